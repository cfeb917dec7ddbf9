use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::{
    error::{LabError, LabResult},
    models::{NewScan, ScanPatch, ScanRecord, ScanStatus, ScanType},
};

const SCAN_COLUMNS: &str = "id, name, target, scan_type, status, created_at, started_at, \
                            completed_at, output, parsed_data, error, ai_insights, revision";

pub const DEFAULT_LIST_LIMIT: i64 = 100;
pub const MAX_LIST_LIMIT: i64 = 1000;

#[derive(Debug, sqlx::FromRow)]
struct ScanRow {
    id: i64,
    name: String,
    target: String,
    scan_type: String,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    output: String,
    parsed_data: Option<String>,
    error: Option<String>,
    ai_insights: Option<String>,
    revision: i64,
}

impl TryFrom<ScanRow> for ScanRecord {
    type Error = anyhow::Error;

    fn try_from(row: ScanRow) -> anyhow::Result<Self> {
        Ok(ScanRecord {
            id: row.id,
            name: row.name,
            target: row.target,
            scan_type: row.scan_type.parse()?,
            status: row.status.parse()?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            output: row.output,
            parsed_data: decode_json(row.parsed_data)?,
            error: row.error,
            ai_insights: decode_json(row.ai_insights)?,
            revision: row.revision,
        })
    }
}

fn decode_json(raw: Option<String>) -> anyhow::Result<Option<Value>> {
    raw.map(|s| serde_json::from_str(&s)).transpose().map_err(Into::into)
}

fn encode_json(value: Option<&Value>) -> Option<String> {
    value.map(Value::to_string)
}

fn into_record(row: ScanRow) -> LabResult<ScanRecord> {
    ScanRecord::try_from(row).map_err(|e| LabError::Database(sqlx::Error::Decode(e.into())))
}

#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub status: Option<ScanStatus>,
    pub scan_type: Option<ScanType>,
    pub skip: i64,
}

/// Durable store of scan records and the only place status changes are validated.
#[derive(Debug, Clone)]
pub struct ScanRegistry {
    pool: SqlitePool,
}

impl ScanRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, spec: &NewScan) -> LabResult<ScanRecord> {
        let inserted = sqlx::query(
            "INSERT INTO scans(name, target, scan_type, status, created_at) VALUES(?, ?, ?, 'pending', ?)",
        )
        .bind(&spec.name)
        .bind(&spec.target)
        .bind(spec.scan_type.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.get(inserted.last_insert_rowid()).await
    }

    pub async fn get(&self, id: i64) -> LabResult<ScanRecord> {
        let row = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => into_record(row),
            None => Err(LabError::scan_not_found(id)),
        }
    }

    /// Newest first.
    pub async fn list(&self, filter: &ScanFilter, limit: i64) -> LabResult<Vec<ScanRecord>> {
        let status = filter.status.map(ScanStatus::as_str);
        let scan_type = filter.scan_type.map(ScanType::as_str);
        let rows = sqlx::query_as::<_, ScanRow>(&format!(
            "SELECT {SCAN_COLUMNS} FROM scans \
             WHERE (? IS NULL OR status = ?) AND (? IS NULL OR scan_type = ?) \
             ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(status)
        .bind(status)
        .bind(scan_type)
        .bind(scan_type)
        .bind(limit.clamp(1, MAX_LIST_LIMIT))
        .bind(filter.skip.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(into_record).collect()
    }

    /// Applies `patch` with compare-and-set on the row revision, re-validating
    /// against the fresh record whenever a concurrent writer got there first.
    pub async fn update(&self, id: i64, patch: ScanPatch) -> LabResult<ScanRecord> {
        loop {
            let current = self.get(id).await?;

            if current.status.is_terminal() && !patch.only_post_completion_fields() {
                return Err(LabError::InvalidStateTransition {
                    from: current.status,
                    to: patch.status.unwrap_or(current.status),
                });
            }

            let next_status = match patch.status {
                Some(to) if to != current.status => {
                    if !current.status.can_transition_to(to) {
                        return Err(LabError::InvalidStateTransition {
                            from: current.status,
                            to,
                        });
                    }
                    to
                }
                _ => current.status,
            };

            let now = Utc::now();
            let started_at = if next_status == ScanStatus::Running && current.started_at.is_none() {
                Some(now)
            } else {
                current.started_at
            };
            let completed_at = if next_status.is_terminal() && current.completed_at.is_none() {
                Some(now)
            } else {
                current.completed_at
            };
            let appended = patch.append_output.as_deref().unwrap_or("");
            let parsed_data = patch.parsed_data.clone().or(current.parsed_data.clone());
            let error = patch.error.clone().or(current.error.clone());
            let ai_insights = patch.ai_insights.clone().or(current.ai_insights.clone());

            let result = sqlx::query(
                "UPDATE scans SET status = ?, started_at = ?, completed_at = ?, output = output || ?, \
                 parsed_data = ?, error = ?, ai_insights = ?, revision = revision + 1 \
                 WHERE id = ? AND revision = ?",
            )
            .bind(next_status.as_str())
            .bind(started_at)
            .bind(completed_at)
            .bind(appended)
            .bind(encode_json(parsed_data.as_ref()))
            .bind(&error)
            .bind(encode_json(ai_insights.as_ref()))
            .bind(id)
            .bind(current.revision)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 1 {
                if next_status != current.status {
                    debug!(scan_id = id, from = %current.status, to = %next_status, "scan status changed");
                }
                let mut output = current.output;
                output.push_str(appended);
                return Ok(ScanRecord {
                    status: next_status,
                    started_at,
                    completed_at,
                    output,
                    parsed_data,
                    error,
                    ai_insights,
                    revision: current.revision + 1,
                    ..current
                });
            }
            debug!(scan_id = id, "concurrent scan update, retrying");
        }
    }

    pub async fn delete(&self, id: i64) -> LabResult<()> {
        let deleted = sqlx::query("DELETE FROM scans WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(LabError::scan_not_found(id));
        }
        Ok(())
    }

    /// Fails scans a previous process left running and returns pending ids in arrival order.
    pub async fn recover(&self) -> LabResult<Vec<i64>> {
        let interrupted = sqlx::query(
            "UPDATE scans SET status = 'failed', completed_at = ?, \
             error = 'ToolExecutionFailure: interrupted by service restart', revision = revision + 1 \
             WHERE status = 'running'",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if interrupted.rows_affected() > 0 {
            warn!(count = interrupted.rows_affected(), "marked interrupted scans as failed");
        }

        let pending: Vec<(i64,)> =
            sqlx::query_as("SELECT id FROM scans WHERE status = 'pending' ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(pending.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::memory_pool;

    fn spec(name: &str) -> NewScan {
        NewScan {
            name: name.to_string(),
            target: "10.0.0.5".to_string(),
            scan_type: ScanType::NetworkPortScan,
        }
    }

    async fn registry() -> ScanRegistry {
        ScanRegistry::new(memory_pool().await)
    }

    #[tokio::test]
    async fn get_after_create_is_pending_without_completion_time() {
        let reg = registry().await;
        let created = reg.create(&spec("web1")).await.unwrap();
        let fetched = reg.get(created.id).await.unwrap();
        assert_eq!(fetched.status, ScanStatus::Pending);
        assert!(fetched.completed_at.is_none());
        assert!(fetched.started_at.is_none());
        assert_eq!(fetched.name, "web1");
        assert_eq!(fetched.scan_type, ScanType::NetworkPortScan);
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_and_list_is_newest_first() {
        let reg = registry().await;
        let a = reg.create(&spec("a")).await.unwrap();
        let b = reg.create(&spec("b")).await.unwrap();
        let c = reg.create(&spec("c")).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);

        let listed = reg.list(&ScanFilter::default(), 2).await.unwrap();
        let names: Vec<_> = listed.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);

        let skipped = reg
            .list(&ScanFilter { skip: 2, ..Default::default() }, 10)
            .await
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].name, "a");
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let reg = registry().await;
        let a = reg.create(&spec("a")).await.unwrap();
        reg.create(&spec("b")).await.unwrap();
        reg.update(a.id, ScanPatch::status(ScanStatus::Running)).await.unwrap();

        let running = reg
            .list(
                &ScanFilter {
                    status: Some(ScanStatus::Running),
                    ..Default::default()
                },
                DEFAULT_LIST_LIMIT,
            )
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
    }

    #[tokio::test]
    async fn completion_time_is_set_exactly_on_terminal_transition() {
        let reg = registry().await;
        let scan = reg.create(&spec("a")).await.unwrap();

        let running = reg.update(scan.id, ScanPatch::status(ScanStatus::Running)).await.unwrap();
        assert!(running.started_at.is_some());
        assert!(running.completed_at.is_none());

        let done = reg
            .update(
                scan.id,
                ScanPatch::status(ScanStatus::Completed)
                    .with_parsed_data(Some(json!({"nmap": {"hosts": []}}))),
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(reg.get(scan.id).await.unwrap().completed_at, done.completed_at);
    }

    #[tokio::test]
    async fn out_of_order_transition_is_rejected() {
        let reg = registry().await;
        let scan = reg.create(&spec("a")).await.unwrap();
        let err = reg
            .update(scan.id, ScanPatch::status(ScanStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LabError::InvalidStateTransition {
                from: ScanStatus::Pending,
                to: ScanStatus::Completed
            }
        ));

        reg.update(scan.id, ScanPatch::status(ScanStatus::Running)).await.unwrap();
        reg.update(scan.id, ScanPatch::status(ScanStatus::Completed)).await.unwrap();
        let err = reg
            .update(scan.id, ScanPatch::status(ScanStatus::Running))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::InvalidStateTransition { .. }));
        assert_eq!(reg.get(scan.id).await.unwrap().status, ScanStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_record_only_accepts_ai_insights() {
        let reg = registry().await;
        let scan = reg.create(&spec("a")).await.unwrap();
        reg.update(scan.id, ScanPatch::status(ScanStatus::Stopped)).await.unwrap();

        let err = reg
            .update(scan.id, ScanPatch::append_output("late line\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, LabError::InvalidStateTransition { .. }));

        let patched = reg
            .update(
                scan.id,
                ScanPatch {
                    ai_insights: Some(json!({"risk_score": 40})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(patched.ai_insights, Some(json!({"risk_score": 40})));
        assert_eq!(patched.status, ScanStatus::Stopped);
    }

    #[tokio::test]
    async fn output_is_appended_in_order() {
        let reg = registry().await;
        let scan = reg.create(&spec("a")).await.unwrap();
        reg.update(scan.id, ScanPatch::status(ScanStatus::Running)).await.unwrap();
        reg.update(scan.id, ScanPatch::append_output("one\n")).await.unwrap();
        let updated = reg.update(scan.id, ScanPatch::append_output("two\n")).await.unwrap();
        assert_eq!(updated.output, "one\ntwo\n");
        assert_eq!(reg.get(scan.id).await.unwrap().output, "one\ntwo\n");
    }

    #[tokio::test]
    async fn concurrent_terminal_transitions_resolve_to_one_winner() {
        let reg = registry().await;
        let scan = reg.create(&spec("a")).await.unwrap();
        reg.update(scan.id, ScanPatch::status(ScanStatus::Running)).await.unwrap();

        let (r1, r2) = tokio::join!(
            reg.update(scan.id, ScanPatch::status(ScanStatus::Completed)),
            reg.update(scan.id, ScanPatch::status(ScanStatus::Stopped)),
        );
        assert!(r1.is_ok() ^ r2.is_ok());
        assert!(reg.get(scan.id).await.unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn missing_ids_report_not_found() {
        let reg = registry().await;
        assert!(matches!(reg.get(42).await, Err(LabError::NotFound(_))));
        assert!(matches!(reg.delete(42).await, Err(LabError::NotFound(_))));
        assert!(matches!(
            reg.update(42, ScanPatch::status(ScanStatus::Running)).await,
            Err(LabError::NotFound(_))
        ));

        let scan = reg.create(&spec("a")).await.unwrap();
        reg.delete(scan.id).await.unwrap();
        assert!(matches!(reg.get(scan.id).await, Err(LabError::NotFound(_))));
    }

    #[tokio::test]
    async fn recover_fails_running_and_returns_pending_in_order() {
        let reg = registry().await;
        let a = reg.create(&spec("a")).await.unwrap();
        let b = reg.create(&spec("b")).await.unwrap();
        let c = reg.create(&spec("c")).await.unwrap();
        reg.update(b.id, ScanPatch::status(ScanStatus::Running)).await.unwrap();

        let pending = reg.recover().await.unwrap();
        assert_eq!(pending, vec![a.id, c.id]);

        let interrupted = reg.get(b.id).await.unwrap();
        assert_eq!(interrupted.status, ScanStatus::Failed);
        assert!(interrupted.completed_at.is_some());
        assert!(interrupted.error.unwrap().contains("restart"));
    }
}
