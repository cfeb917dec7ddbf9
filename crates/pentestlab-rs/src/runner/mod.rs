use std::{process::Stdio, time::Duration};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    adapters::ToolRequest,
    config::ToolsConfig,
    error::{LabError, LabResult},
    models::ToolKind,
    parser,
};

const EVENT_BUFFER: usize = 1024;
const TRUNCATION_MARKER: &str = "[earlier output truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    Execution,
    Timeout,
    Aborted,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Execution => "ToolExecutionFailure",
            Self::Timeout => "Timeout",
            Self::Aborted => "Aborted",
        }
    }
}

#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success {
        output: String,
        parsed_data: Option<Value>,
    },
    Failure {
        kind: FailureKind,
        detail: String,
        output: String,
    },
}

impl ToolOutcome {
    pub fn output(&self) -> &str {
        match self {
            Self::Success { output, .. } | Self::Failure { output, .. } => output,
        }
    }

    /// `Kind: detail` text stored on failed records.
    pub fn error_text(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { kind, detail, .. } => Some(format!("{}: {detail}", kind.label())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Output { stream: OutputStream, line: String },
    Finished(ToolOutcome),
}

/// One running tool process. Dropping it kills the process.
#[derive(Debug)]
pub struct ToolInvocation {
    pub command: String,
    events: mpsc::Receiver<RunnerEvent>,
    cancel: CancellationToken,
    finished: bool,
}

impl ToolInvocation {
    /// `None` once the terminal event has been delivered.
    pub async fn next_event(&mut self) -> Option<RunnerEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, Some(RunnerEvent::Finished(_)) | None) {
            self.finished = true;
        }
        event
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Drains the remaining events and returns the outcome.
    pub async fn finish(mut self) -> ToolOutcome {
        while let Some(event) = self.next_event().await {
            if let RunnerEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        ToolOutcome::Failure {
            kind: FailureKind::Aborted,
            detail: "runner stopped without a result".to_string(),
            output: String::new(),
        }
    }
}

impl Drop for ToolInvocation {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct ToolRunner {
    tools: ToolsConfig,
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(tools: ToolsConfig, timeout: Duration) -> Self {
        Self { tools, timeout }
    }

    pub fn tools(&self) -> &ToolsConfig {
        &self.tools
    }

    pub fn invoke(&self, request: &ToolRequest) -> LabResult<ToolInvocation> {
        self.invoke_under(request, &CancellationToken::new())
    }

    /// Like [`invoke`](Self::invoke), but cancelling `parent` also aborts the tool.
    pub fn invoke_under(
        &self,
        request: &ToolRequest,
        parent: &CancellationToken,
    ) -> LabResult<ToolInvocation> {
        let adapter = request.adapter();
        adapter.validate()?;
        let args = adapter.args(&self.tools)?;
        let tool = adapter.kind();
        let program = self.tools.path_for(tool).to_string();
        let command = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = parent.child_token();
        tokio::spawn(drive(
            tool,
            program,
            args,
            self.timeout,
            self.tools.output_limit_bytes,
            cancel.clone(),
            tx,
        ));

        Ok(ToolInvocation {
            command,
            events: rx,
            cancel,
            finished: false,
        })
    }
}

async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send((stream, line)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, ?stream, "failed to read tool output");
                break;
            }
        }
    }
}

/// Keeps roughly the newest `limit` bytes of line output.
struct Capture {
    text: String,
    limit: usize,
    truncated: bool,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        // trim in batches so each line is not a front drain
        if self.text.len() > self.limit.saturating_mul(2) {
            self.trim();
        }
    }

    fn trim(&mut self) {
        if self.text.len() <= self.limit {
            return;
        }
        let mut cut = self.text.len() - self.limit;
        while !self.text.is_char_boundary(cut) {
            cut += 1;
        }
        if !self.text[..cut].ends_with('\n') {
            if let Some(newline) = self.text[cut..].find('\n') {
                cut += newline + 1;
            }
        }
        self.text.drain(..cut);
        self.truncated = true;
    }

    fn into_string(mut self) -> String {
        self.trim();
        if self.truncated {
            format!("{TRUNCATION_MARKER}\n{}", self.text)
        } else {
            self.text
        }
    }
}

fn execution_detail(tool: ToolKind, detail: String) -> String {
    LabError::ToolExecution {
        tool: tool.to_string(),
        detail,
    }
    .to_string()
}

async fn drive(
    tool: ToolKind,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    output_limit: usize,
    cancel: CancellationToken,
    tx: mpsc::Sender<RunnerEvent>,
) {
    info!(tool = %tool, command = %program, ?args, "audit: launching external tool");
    let spawned = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            warn!(tool = %tool, error = %e, "failed to launch external tool");
            let _ = tx
                .send(RunnerEvent::Finished(ToolOutcome::Failure {
                    kind: FailureKind::Execution,
                    detail: execution_detail(tool, format!("failed to launch {program}: {e}")),
                    output: String::new(),
                }))
                .await;
            return;
        }
    };

    let (line_tx, mut line_rx) = mpsc::channel(EVENT_BUFFER);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, OutputStream::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, OutputStream::Stderr, line_tx));
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut combined = Capture::new(output_limit);
    let mut stdout_text = Capture::new(output_limit);

    let interrupted = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Some(FailureKind::Aborted),
            _ = &mut deadline => break Some(FailureKind::Timeout),
            next = line_rx.recv() => match next {
                Some((stream, line)) => {
                    combined.push_line(&line);
                    if stream == OutputStream::Stdout {
                        stdout_text.push_line(&line);
                    }
                    // a stalled consumer must not hold off cancel or the deadline
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break Some(FailureKind::Aborted),
                        _ = &mut deadline => break Some(FailureKind::Timeout),
                        sent = tx.send(RunnerEvent::Output { stream, line }) => {
                            if sent.is_err() {
                                break Some(FailureKind::Aborted);
                            }
                        }
                    }
                }
                None => break None,
            },
        }
    };
    let combined = combined.into_string();

    let status = match interrupted {
        Some(kind) => Err(kind),
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FailureKind::Aborted),
            _ = &mut deadline => Err(FailureKind::Timeout),
            status = child.wait() => Ok(status),
        },
    };

    let outcome = match status {
        Err(kind) => {
            if let Err(e) = child.kill().await {
                warn!(tool = %tool, error = %e, "failed to kill external tool");
            }
            let detail = match kind {
                FailureKind::Timeout => LabError::Timeout {
                    tool: tool.to_string(),
                    after: timeout,
                }
                .to_string(),
                _ => format!("{tool} was aborted"),
            };
            warn!(tool = %tool, kind = kind.label(), "external tool interrupted");
            ToolOutcome::Failure {
                kind,
                detail,
                output: combined,
            }
        }
        Ok(Err(e)) => ToolOutcome::Failure {
            kind: FailureKind::Execution,
            detail: execution_detail(tool, format!("failed to wait for process: {e}")),
            output: combined,
        },
        Ok(Ok(exit)) if !exit.success() => {
            warn!(tool = %tool, %exit, "external tool failed");
            ToolOutcome::Failure {
                kind: FailureKind::Execution,
                detail: execution_detail(tool, format!("exited with {exit}")),
                output: combined,
            }
        }
        Ok(Ok(_)) => {
            let parsed_data = match parser::parse(tool, &stdout_text.into_string()) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    warn!(tool = %tool, error = %e, "could not parse tool output");
                    None
                }
            };
            info!(tool = %tool, parsed = parsed_data.is_some(), "external tool finished");
            ToolOutcome::Success {
                output: combined,
                parsed_data,
            }
        }
    };

    let _ = tx.send(RunnerEvent::Finished(outcome)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fake_tools;

    fn runner(timeout: Duration) -> ToolRunner {
        ToolRunner::new(fake_tools().config(), timeout)
    }

    fn nmap(target: &str) -> ToolRequest {
        ToolRequest::for_scan(ToolKind::Nmap, target, &fake_tools().config())
    }

    #[tokio::test]
    async fn successful_run_streams_lines_then_one_terminal_event() {
        let mut inv = runner(Duration::from_secs(10)).invoke(&nmap("10.0.0.5")).unwrap();
        assert!(inv.command.ends_with("-sV -oX - 10.0.0.5"));

        let mut lines = 0;
        let mut terminal = None;
        while let Some(event) = inv.next_event().await {
            match event {
                RunnerEvent::Output { .. } => {
                    assert!(terminal.is_none(), "output after terminal event");
                    lines += 1;
                }
                RunnerEvent::Finished(outcome) => terminal = Some(outcome),
            }
        }
        assert!(lines > 0);
        match terminal.expect("terminal event") {
            ToolOutcome::Success { output, parsed_data } => {
                assert!(output.contains("Starting Nmap"));
                let doc = parsed_data.expect("nmap xml parses");
                assert_eq!(doc["hosts"][0]["ip"], "192.168.1.10");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(inv.next_event().await.is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_execution_failure_with_output() {
        let mut tools = fake_tools().config();
        tools.nmap_path = fake_tools().path("nmap-fail");
        let inv = ToolRunner::new(tools.clone(), Duration::from_secs(10))
            .invoke(&ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools))
            .unwrap();
        let outcome = inv.finish().await;
        assert!(matches!(
            outcome,
            ToolOutcome::Failure { kind: FailureKind::Execution, .. }
        ));
        assert!(outcome.output().contains("Failed to resolve"));
        assert!(outcome.error_text().unwrap().starts_with("ToolExecutionFailure: "));
    }

    #[tokio::test]
    async fn timeout_kills_the_process_and_keeps_partial_output() {
        let mut tools = fake_tools().config();
        tools.nmap_path = fake_tools().path("nmap-hang");
        let started = std::time::Instant::now();
        let inv = ToolRunner::new(tools.clone(), Duration::from_millis(300))
            .invoke(&ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools))
            .unwrap();
        let outcome = inv.finish().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            outcome,
            ToolOutcome::Failure { kind: FailureKind::Timeout, .. }
        ));
        assert!(outcome.output().contains("Starting Nmap"));
    }

    #[tokio::test]
    async fn captured_output_keeps_only_the_newest_text() {
        let mut tools = fake_tools().config();
        tools.nmap_path = fake_tools().path("chatty");
        tools.output_limit_bytes = 4096;
        let mut inv = ToolRunner::new(tools.clone(), Duration::from_secs(10))
            .invoke(&ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools))
            .unwrap();

        let mut streamed = 0;
        let mut outcome = None;
        while let Some(event) = inv.next_event().await {
            match event {
                RunnerEvent::Output { .. } => streamed += 1,
                RunnerEvent::Finished(done) => outcome = Some(done),
            }
        }
        // every line is still streamed; only the retained copy is capped
        assert_eq!(streamed, 3000);
        let output = outcome.expect("terminal event").output().to_string();
        assert!(output.starts_with(TRUNCATION_MARKER));
        assert!(output.len() <= 4096 + TRUNCATION_MARKER.len() + 1);
        assert!(output.trim_end().ends_with("line 2999 of a very talkative tool"));
        assert!(!output.contains("line 0 of"));
    }

    #[test]
    fn capture_trims_on_line_boundaries() {
        let mut capture = Capture::new(16);
        for line in ["first line", "second line", "third"] {
            capture.push_line(line);
        }
        assert_eq!(
            capture.into_string(),
            format!("{TRUNCATION_MARKER}\nthird\n")
        );

        let mut small = Capture::new(64);
        small.push_line("fits");
        assert_eq!(small.into_string(), "fits\n");
    }

    #[tokio::test]
    async fn stalled_consumer_still_times_out() {
        let mut tools = fake_tools().config();
        tools.nmap_path = fake_tools().path("chatty");
        let inv = ToolRunner::new(tools.clone(), Duration::from_millis(200))
            .invoke(&ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools))
            .unwrap();
        // nobody reads while the event buffer fills up
        tokio::time::sleep(Duration::from_millis(600)).await;

        match inv.finish().await {
            ToolOutcome::Failure { kind, detail, .. } => {
                assert_eq!(kind, FailureKind::Timeout);
                assert_eq!(detail, "nmap timed out after 200ms");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_reports_aborted() {
        let mut tools = fake_tools().config();
        tools.nmap_path = fake_tools().path("nmap-hang");
        let parent = CancellationToken::new();
        let inv = ToolRunner::new(tools.clone(), Duration::from_secs(30))
            .invoke_under(&ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools), &parent)
            .unwrap();
        parent.cancel();
        let outcome = inv.finish().await;
        assert!(matches!(
            outcome,
            ToolOutcome::Failure { kind: FailureKind::Aborted, .. }
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_a_terminal_failure_not_an_error() {
        let mut tools = fake_tools().config();
        tools.nmap_path = "/nonexistent/nmap".to_string();
        let inv = ToolRunner::new(tools.clone(), Duration::from_secs(5))
            .invoke(&ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools))
            .unwrap();
        match inv.finish().await {
            ToolOutcome::Failure { kind, detail, .. } => {
                assert_eq!(kind, FailureKind::Execution);
                assert!(detail.contains("failed to launch"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_target_is_rejected_before_spawning() {
        let err = runner(Duration::from_secs(5))
            .invoke(&nmap("-iL /etc/passwd"))
            .unwrap_err();
        assert!(matches!(err, LabError::Validation(_)));
    }

    #[tokio::test]
    async fn unparseable_stdout_keeps_raw_output() {
        let mut tools = fake_tools().config();
        tools.nmap_path = fake_tools().path("gobuster-ok");
        let inv = ToolRunner::new(tools.clone(), Duration::from_secs(10))
            .invoke(&ToolRequest::for_scan(ToolKind::Nmap, "10.0.0.5", &tools))
            .unwrap();
        match inv.finish().await {
            ToolOutcome::Success { output, parsed_data } => {
                assert!(parsed_data.is_none());
                assert!(output.contains("/admin"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
