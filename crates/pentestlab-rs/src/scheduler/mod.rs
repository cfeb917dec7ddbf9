use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    adapters::ToolRequest,
    error::{LabError, LabResult},
    hub::{HubEvent, NotificationHub},
    models::{recommendations_from, NewScan, ScanPatch, ScanRecord, ScanStatus, ToolKind},
    registry::ScanRegistry,
    runner::{FailureKind, RunnerEvent, ToolOutcome, ToolRunner},
    security::{check_scope, target_for, validate_target},
};

const FLUSH_LINES: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

enum StepResult {
    Succeeded(Option<Value>),
    Failed(String),
    Stopped,
    Gone,
}

/// Admits scans in arrival order and runs at most `max_concurrent_scans` of them.
#[derive(Debug)]
pub struct ScanScheduler {
    registry: ScanRegistry,
    hub: Arc<NotificationHub>,
    runner: ToolRunner,
    scope_allowlist: Vec<String>,
    queue: mpsc::UnboundedSender<i64>,
    active: Mutex<HashMap<i64, CancellationToken>>,
    permits: Arc<Semaphore>,
}

impl ScanScheduler {
    /// Builds the scheduler and spawns its dispatch loop.
    pub fn start(
        registry: ScanRegistry,
        hub: Arc<NotificationHub>,
        runner: ToolRunner,
        scope_allowlist: Vec<String>,
        max_concurrent_scans: usize,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            registry,
            hub,
            runner,
            scope_allowlist,
            queue: tx,
            active: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent_scans.max(1))),
        });
        tokio::spawn(worker_loop(Arc::clone(&scheduler), rx));
        scheduler
    }

    #[cfg(test)]
    pub fn registry(&self) -> &ScanRegistry {
        &self.registry
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Validates and persists a scan, then queues it. Never waits for dispatch.
    pub async fn submit(&self, spec: NewScan) -> LabResult<ScanRecord> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(LabError::validation("name is required"));
        }
        let target = spec.target.trim();
        if target.is_empty() {
            return Err(LabError::validation("target is required"));
        }
        for &tool in spec.scan_type.plan() {
            let step_target = target_for(tool, target);
            validate_target(tool, &step_target)?;
            check_scope(tool, &step_target, &self.scope_allowlist)?;
        }

        let record = self
            .registry
            .create(&NewScan {
                name: name.to_string(),
                target: target.to_string(),
                scan_type: spec.scan_type,
            })
            .await?;
        info!(scan_id = record.id, target = %record.target, scan_type = %record.scan_type, "scan submitted");
        self.hub.publish(HubEvent::scan_update(
            record.id,
            ScanStatus::Pending,
            "scan queued",
        ));
        self.enqueue(record.id);
        Ok(record)
    }

    /// Re-queues scans a previous process left pending.
    pub async fn recover(&self) -> LabResult<usize> {
        let pending = self.registry.recover().await?;
        for id in &pending {
            self.enqueue(*id);
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "re-queued pending scans");
        }
        Ok(pending.len())
    }

    /// Idempotent: a terminal scan is returned unchanged. A running scan is
    /// only signalled; the run task records `stopped` once the tool is down.
    pub async fn stop(&self, id: i64) -> LabResult<ScanRecord> {
        loop {
            let current = self.registry.get(id).await?;
            match current.status {
                status if status.is_terminal() => return Ok(current),
                ScanStatus::Pending => {
                    match self.registry.update(id, ScanPatch::status(ScanStatus::Stopped)).await {
                        Ok(record) => {
                            info!(scan_id = id, "pending scan stopped");
                            self.hub.publish(HubEvent::scan_update(
                                id,
                                ScanStatus::Stopped,
                                "scan stopped before dispatch",
                            ));
                            return Ok(record);
                        }
                        // dispatched in the meantime
                        Err(LabError::InvalidStateTransition { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    let signalled = match self.active.lock().await.get(&id) {
                        Some(token) => {
                            token.cancel();
                            true
                        }
                        None => false,
                    };
                    if signalled {
                        info!(scan_id = id, "stop requested for running scan");
                        return self.registry.get(id).await;
                    }
                    // running row with no live task
                    match self
                        .registry
                        .update(id, ScanPatch::status(ScanStatus::Stopped))
                        .await
                    {
                        Ok(record) => {
                            warn!(scan_id = id, "stopped orphaned running scan");
                            self.hub.publish(HubEvent::scan_update(
                                id,
                                ScanStatus::Stopped,
                                "scan stopped",
                            ));
                            return Ok(record);
                        }
                        Err(LabError::InvalidStateTransition { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Aborts an active run before removing the record.
    pub async fn delete(&self, id: i64) -> LabResult<()> {
        if let Some(token) = self.active.lock().await.get(&id) {
            token.cancel();
        }
        self.registry.delete(id).await?;
        info!(scan_id = id, "scan deleted");
        Ok(())
    }

    fn enqueue(&self, id: i64) {
        if self.queue.send(id).is_err() {
            error!(scan_id = id, "scan queue closed; scan stays pending");
        }
    }

    async fn dispatch(self: &Arc<Self>, id: i64, permit: OwnedSemaphorePermit) {
        let token = CancellationToken::new();
        self.active.lock().await.insert(id, token.clone());

        match self.registry.update(id, ScanPatch::status(ScanStatus::Running)).await {
            Ok(record) => {
                info!(scan_id = id, scan_type = %record.scan_type, "scan dispatched");
                self.hub.publish(HubEvent::scan_update(id, ScanStatus::Running, "scan started"));
                let scheduler = Arc::clone(self);
                tokio::spawn(async move {
                    scheduler.execute(record, token).await;
                    scheduler.active.lock().await.remove(&id);
                    drop(permit);
                });
            }
            Err(LabError::InvalidStateTransition { from, .. }) => {
                debug!(scan_id = id, status = %from, "skipping scan that is no longer pending");
                self.active.lock().await.remove(&id);
            }
            Err(LabError::NotFound(_)) => {
                debug!(scan_id = id, "skipping deleted scan");
                self.active.lock().await.remove(&id);
            }
            Err(e) => {
                error!(scan_id = id, error = %e, "could not start scan");
                self.active.lock().await.remove(&id);
                let patch = ScanPatch::status(ScanStatus::Failed)
                    .with_error(format!("{}: could not start scan: {e}", e.kind()));
                if let Err(e) = self.registry.update(id, patch).await {
                    error!(scan_id = id, error = %e, "could not record dispatch failure");
                }
            }
        }
    }

    async fn execute(&self, record: ScanRecord, token: CancellationToken) {
        let id = record.id;
        let mut parsed = Map::new();
        let mut failure = None;
        let mut stopped = false;

        for &tool in record.scan_type.plan() {
            if token.is_cancelled() {
                stopped = true;
                break;
            }
            let request =
                ToolRequest::for_scan(tool, &target_for(tool, &record.target), self.runner.tools());
            match self.run_step(id, tool, &request, &token).await {
                StepResult::Succeeded(doc) => {
                    if let Some(doc) = doc {
                        parsed.insert(tool.as_str().to_string(), doc);
                    }
                }
                StepResult::Failed(error) => {
                    failure = Some(error);
                    break;
                }
                StepResult::Stopped => {
                    stopped = true;
                    break;
                }
                StepResult::Gone => {
                    debug!(scan_id = id, "scan removed while running");
                    return;
                }
            }
        }

        let parsed_data = (!parsed.is_empty()).then(|| Value::Object(parsed));
        if stopped {
            self.finish(id, ScanPatch::status(ScanStatus::Stopped), "scan stopped", None)
                .await;
        } else if let Some(error) = failure {
            let patch = ScanPatch::status(ScanStatus::Failed)
                .with_parsed_data(parsed_data)
                .with_error(error.clone());
            self.finish(id, patch, "scan failed", Some(error)).await;
        } else {
            let recommendations = recommendations_from(parsed_data.as_ref());
            let patch = ScanPatch::status(ScanStatus::Completed).with_parsed_data(parsed_data);
            if self.finish(id, patch, "scan completed", None).await {
                self.hub.publish(HubEvent::Recommendations {
                    scan_id: id,
                    recommendations,
                });
            }
        }
    }

    async fn run_step(
        &self,
        id: i64,
        tool: ToolKind,
        request: &ToolRequest,
        token: &CancellationToken,
    ) -> StepResult {
        let mut invocation = match self.runner.invoke_under(request, token) {
            Ok(invocation) => invocation,
            Err(e) => return StepResult::Failed(format!("{}: {e}", e.kind())),
        };
        info!(scan_id = id, tool = %tool, command = %invocation.command, "scan step started");

        let mut buffer = format!("$ {}\n", invocation.command);
        let mut buffered = 0;
        let mut last_flush = Instant::now();
        let outcome = loop {
            match invocation.next_event().await {
                Some(RunnerEvent::Output { line, .. }) => {
                    buffer.push_str(&line);
                    buffer.push('\n');
                    buffered += 1;
                    self.hub.publish(HubEvent::ToolOutput {
                        scan_id: id,
                        tool,
                        output: line,
                    });
                    if buffered >= FLUSH_LINES || last_flush.elapsed() >= FLUSH_INTERVAL {
                        if !self.flush(id, &mut buffer).await {
                            invocation.abort();
                            return StepResult::Gone;
                        }
                        buffered = 0;
                        last_flush = Instant::now();
                    }
                }
                Some(RunnerEvent::Finished(outcome)) => break Some(outcome),
                None => break None,
            }
        };
        if !self.flush(id, &mut buffer).await {
            return StepResult::Gone;
        }

        // a stop observed before the terminal event wins
        if token.is_cancelled() {
            return StepResult::Stopped;
        }
        match outcome {
            Some(ToolOutcome::Success { parsed_data, .. }) => StepResult::Succeeded(parsed_data),
            Some(failure @ ToolOutcome::Failure { .. }) => {
                let error = failure.error_text().unwrap_or_default();
                warn!(scan_id = id, tool = %tool, error = %error, "scan step failed");
                StepResult::Failed(error)
            }
            None => StepResult::Failed(format!(
                "{}: {tool} ended without a result",
                FailureKind::Aborted.label()
            )),
        }
    }

    /// Appends buffered output; `false` if the scan no longer accepts it.
    async fn flush(&self, id: i64, buffer: &mut String) -> bool {
        if buffer.is_empty() {
            return true;
        }
        let chunk = std::mem::take(buffer);
        match self.registry.update(id, ScanPatch::append_output(chunk)).await {
            Ok(_) => true,
            Err(LabError::NotFound(_)) | Err(LabError::InvalidStateTransition { .. }) => false,
            Err(e) => {
                error!(scan_id = id, error = %e, "could not store scan output");
                true
            }
        }
    }

    async fn finish(&self, id: i64, patch: ScanPatch, message: &str, error: Option<String>) -> bool {
        let status = patch.status.unwrap_or(ScanStatus::Failed);
        match self.registry.update(id, patch).await {
            Ok(_) => {
                info!(scan_id = id, status = %status, "{message}");
                self.hub.publish(HubEvent::ScanUpdate {
                    scan_id: id,
                    status,
                    message: message.to_string(),
                    error,
                });
                true
            }
            Err(e) => {
                debug!(scan_id = id, error = %e, "terminal state already recorded");
                false
            }
        }
    }
}

async fn worker_loop(scheduler: Arc<ScanScheduler>, mut rx: mpsc::UnboundedReceiver<i64>) {
    while let Some(id) = rx.recv().await {
        let permit = match Arc::clone(&scheduler.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        scheduler.dispatch(id, permit).await;
    }
    debug!("scan worker loop exited");
}
