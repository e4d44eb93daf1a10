//! Subprocess supervisor
//!
//! Runs one external stage process at a time. stdout and stderr are drained by
//! two independent reader tasks that split output into lines, classify them
//! with the progress parser and push the results onto one internal queue. The
//! supervisor pulls from that queue and forwards client events to the job's
//! event channel, so stopping on cancellation is simply "stop pulling".
//!
//! The child is killed when the job is cancelled, when the stage ceiling
//! expires, or when the event channel reports the client gone.

use crate::channel::EventSender;
use crate::progress_parser::{classify, Collected, ResultCollector};
use cleantxt_common::events::JobEvent;
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Number of trailing stderr lines kept for failure messages
const STDERR_TAIL_LINES: usize = 20;

/// Read buffer size per stream
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// One external stage invocation
#[derive(Debug, Clone)]
pub struct StageCommand {
    /// Stage label used in logs and attached to progress events ("acquire", "transcribe")
    pub stage: &'static str,
    pub program: String,
    pub args: Vec<String>,
    /// Environment overrides applied on top of the inherited environment
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    /// Ceiling on the stage's wall-clock time
    pub timeout: Duration,
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Success,
    Failed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    TimedOut(Duration),
    Cancelled,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            return ExitOutcome::Success;
        }
        ExitOutcome::Failed {
            code: status.code(),
            signal: exit_signal(&status),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Everything the controller needs after a stage process ends
#[derive(Debug, Clone)]
pub struct StageReport {
    pub outcome: ExitOutcome,
    /// Last structured result envelope parsed from either stream
    pub result: Option<serde_json::Value>,
    /// Envelope payload that was closed (or cut off) without being valid JSON
    pub malformed_result: Option<String>,
    /// Trailing stderr lines, oldest first
    pub stderr_tail: Vec<String>,
    pub elapsed: Duration,
}

impl StageReport {
    /// Last few stderr lines joined for an error message
    pub fn stderr_summary(&self, max_lines: usize) -> Option<String> {
        if self.stderr_tail.is_empty() {
            return None;
        }
        let skip = self.stderr_tail.len().saturating_sub(max_lines);
        Some(self.stderr_tail[skip..].join("\n"))
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    /// Underlying I/O error kind (used to classify spawn failures)
    pub fn io_kind(&self) -> std::io::ErrorKind {
        match self {
            SupervisorError::Spawn { source, .. } | SupervisorError::Wait { source, .. } => {
                source.kind()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

#[derive(Debug)]
enum ReaderMsg {
    Line {
        stream: StreamKind,
        raw: String,
        collected: Collected,
    },
    Unterminated {
        stream: StreamKind,
        payload: String,
    },
}

/// Splits a byte stream into lines on `\n` and `\r`, holding partial fragments
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every line it completed (empty lines dropped)
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// End of stream: the trailing fragment, if any
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
}

/// Run one stage process to completion, streaming its output as events
///
/// Returns `Err` only when the process could not be started or waited on;
/// every other ending (non-zero exit, timeout, cancellation) is an
/// [`ExitOutcome`] in the report.
pub async fn run_stage(
    command: &StageCommand,
    events: &EventSender,
    cancel: &CancellationToken,
) -> Result<StageReport, SupervisorError> {
    let started = Instant::now();

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &command.current_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    info!(
        stage = command.stage,
        program = %command.program,
        pid = ?child.id(),
        "Spawned stage process"
    );

    let (tx, mut rx) = mpsc::channel::<ReaderMsg>(64);
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(read_stream(stdout, StreamKind::Stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(read_stream(stderr, StreamKind::Stderr, tx.clone())));
    }
    drop(tx);

    let deadline = tokio::time::sleep(command.timeout);
    tokio::pin!(deadline);

    let mut result = None;
    let mut malformed_result = None;
    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut interrupted: Option<ExitOutcome> = None;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                interrupted = Some(ExitOutcome::Cancelled);
                break;
            }

            _ = &mut deadline => {
                interrupted = Some(ExitOutcome::TimedOut(command.timeout));
                break;
            }

            _ = events.closed() => {
                interrupted = Some(ExitOutcome::Cancelled);
                break;
            }

            msg = rx.recv() => {
                let Some(msg) = msg else { break };
                let event = match msg {
                    ReaderMsg::Line { stream, raw, collected } => {
                        if stream == StreamKind::Stderr {
                            if stderr_tail.len() == STDERR_TAIL_LINES {
                                stderr_tail.pop_front();
                            }
                            stderr_tail.push_back(raw.trim_end().to_string());
                        }
                        match collected {
                            Collected::Forward(parsed) => parsed.into_event(),
                            Collected::Absorbed => None,
                            Collected::Result(value) => {
                                debug!(stage = command.stage, stream = stream.as_str(), "Structured result received");
                                result = Some(value);
                                None
                            }
                            Collected::Malformed(payload) => {
                                warn!(stage = command.stage, stream = stream.as_str(), "Result envelope is not valid JSON");
                                malformed_result = Some(payload);
                                Some(JobEvent::log("Received a malformed result payload"))
                            }
                        }
                    }
                    ReaderMsg::Unterminated { stream, payload } => {
                        warn!(stage = command.stage, stream = stream.as_str(), "Result envelope was never closed");
                        malformed_result = Some(payload);
                        None
                    }
                };

                if let Some(event) = event {
                    let event = tag_stage(event, command.stage);
                    if events.send(event).await.is_err() {
                        interrupted = Some(ExitOutcome::Cancelled);
                        break;
                    }
                }
            }
        }
    }

    let outcome = match interrupted {
        Some(outcome) => {
            terminate(&mut child, command).await;
            outcome
        }
        None => {
            // Both pipes closed; the process may still be shutting down
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    terminate(&mut child, command).await;
                    ExitOutcome::Cancelled
                }
                _ = &mut deadline => {
                    terminate(&mut child, command).await;
                    ExitOutcome::TimedOut(command.timeout)
                }
                _ = events.closed() => {
                    terminate(&mut child, command).await;
                    ExitOutcome::Cancelled
                }
                status = child.wait() => {
                    let status = status.map_err(|source| SupervisorError::Wait {
                        program: command.program.clone(),
                        source,
                    })?;
                    ExitOutcome::from_status(status)
                }
            }
        }
    };

    for reader in readers {
        reader.abort();
    }

    let elapsed = started.elapsed();
    info!(
        stage = command.stage,
        outcome = ?outcome,
        elapsed_ms = elapsed.as_millis() as u64,
        "Stage process finished"
    );

    Ok(StageReport {
        outcome,
        result,
        malformed_result,
        stderr_tail: stderr_tail.into_iter().collect(),
        elapsed,
    })
}

fn tag_stage(event: JobEvent, stage: &str) -> JobEvent {
    match event {
        JobEvent::Progress(mut data) => {
            if data.stage.is_none() {
                data.stage = Some(stage.to_string());
            }
            JobEvent::Progress(data)
        }
        other => other,
    }
}

async fn terminate(child: &mut Child, command: &StageCommand) {
    if let Err(e) = child.start_kill() {
        // Already exited between the interrupt and the kill
        debug!(stage = command.stage, error = %e, "Kill skipped");
    }
    match child.wait().await {
        Ok(status) => debug!(stage = command.stage, status = %status, "Stage process reaped"),
        Err(e) => warn!(stage = command.stage, error = %e, "Failed to reap stage process"),
    }
}

async fn read_stream<R>(mut reader: R, stream: StreamKind, tx: mpsc::Sender<ReaderMsg>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut collector = ResultCollector::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(stream = stream.as_str(), error = %e, "Stream read failed");
                break;
            }
        };
        for raw in splitter.push(&buf[..n]) {
            if !forward_line(&tx, &mut collector, stream, raw).await {
                return;
            }
        }
    }

    if let Some(raw) = splitter.finish() {
        if !forward_line(&tx, &mut collector, stream, raw).await {
            return;
        }
    }

    if let Some(payload) = collector.finish() {
        let _ = tx.send(ReaderMsg::Unterminated { stream, payload }).await;
    }
}

async fn forward_line(
    tx: &mpsc::Sender<ReaderMsg>,
    collector: &mut ResultCollector,
    stream: StreamKind,
    raw: String,
) -> bool {
    let parsed = classify(&raw);
    let collected = collector.accept(&raw, parsed);
    tx.send(ReaderMsg::Line {
        stream,
        raw,
        collected,
    })
    .await
    .is_ok()
}
