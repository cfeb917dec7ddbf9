use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{models::ToolKind, runner::ToolOutcome};

/// Finished runs kept for status lookups; the oldest finished ones go first.
pub const MAX_TRACKED_TASKS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

/// One direct tool run, outside any scan.
#[derive(Debug, Clone, Serialize)]
pub struct ToolTask {
    pub task_id: Uuid,
    pub tool: ToolKind,
    pub command: String,
    pub status: TaskStatus,
    pub output: String,
    pub parsed_data: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ToolTask {
    pub fn started(tool: ToolKind, command: String) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            tool,
            command,
            status: TaskStatus::Running,
            output: String::new(),
            parsed_data: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn finished(mut self, outcome: ToolOutcome) -> Self {
        self.error = outcome.error_text();
        self.output = outcome.output().to_string();
        match outcome {
            ToolOutcome::Success { parsed_data, .. } => {
                self.status = TaskStatus::Completed;
                self.parsed_data = parsed_data;
            }
            ToolOutcome::Failure { .. } => self.status = TaskStatus::Failed,
        }
        self.completed_at = Some(Utc::now());
        self
    }
}

#[derive(Clone, Default)]
pub struct ToolTaskStore {
    inner: Arc<RwLock<HashMap<Uuid, ToolTask>>>,
}

impl ToolTaskStore {
    /// Inserts or replaces the entry for `task.task_id`.
    pub async fn record(&self, task: ToolTask) {
        let mut tasks = self.inner.write().await;
        tasks.insert(task.task_id, task);
        while tasks.len() > MAX_TRACKED_TASKS {
            let oldest = tasks
                .values()
                .filter(|t| t.status != TaskStatus::Running)
                .min_by_key(|t| t.created_at)
                .map(|t| t.task_id);
            match oldest {
                Some(id) => {
                    tasks.remove(&id);
                }
                None => break,
            }
        }
    }

    pub async fn get(&self, task_id: Uuid) -> Option<ToolTask> {
        self.inner.read().await.get(&task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FailureKind;

    #[tokio::test]
    async fn finished_task_replaces_running_entry() {
        let store = ToolTaskStore::default();
        let task = ToolTask::started(ToolKind::Nmap, "nmap -sV 10.0.0.5".into());
        let id = task.task_id;
        store.record(task.clone()).await;
        assert_eq!(store.get(id).await.unwrap().status, TaskStatus::Running);

        let done = task.finished(ToolOutcome::Failure {
            kind: FailureKind::Execution,
            detail: "exit status 1".into(),
            output: "boom".into(),
        });
        store.record(done).await;
        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.output, "boom");
        assert!(stored.completed_at.is_some());
        assert!(store.get(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn oldest_finished_tasks_are_evicted_first() {
        let store = ToolTaskStore::default();
        let running = ToolTask::started(ToolKind::Nikto, "nikto".into());
        store.record(running.clone()).await;

        let base = Utc::now();
        let mut first = None;
        for i in 0..MAX_TRACKED_TASKS as i64 {
            let mut task = ToolTask::started(ToolKind::Gobuster, "gobuster".into()).finished(
                ToolOutcome::Success {
                    output: String::new(),
                    parsed_data: None,
                },
            );
            task.created_at = base + chrono::Duration::seconds(i);
            first.get_or_insert(task.task_id);
            store.record(task).await;
        }

        assert!(store.get(running.task_id).await.is_some());
        assert!(store.get(first.unwrap()).await.is_none());
        assert_eq!(store.inner.read().await.len(), MAX_TRACKED_TASKS);
    }
}
