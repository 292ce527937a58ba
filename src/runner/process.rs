use super::invocation::{AgentInvocation, EXIT_KILLED, EXIT_LAUNCH_FAILED, EXIT_TIMED_OUT};
use crate::sanitize::strip_ansi;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Pipes are drained in fixed-size reads so output streams while the
/// child is still running.
const READ_CHUNK_BYTES: usize = 1024;

/// One sanitized line from the child, tagged by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Stdout(String),
    Stderr(String),
}

/// Final shape of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub success: bool,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl RunReport {
    fn failure(exit_code: i32, timed_out: bool) -> Self {
        Self {
            success: false,
            exit_code,
            timed_out,
        }
    }
}

/// Live handle to one supervised run: a stream of line events, then a
/// final report.
pub struct RunHandle {
    events: mpsc::Receiver<OutputEvent>,
    outcome: oneshot::Receiver<RunReport>,
}

impl RunHandle {
    /// Next sanitized line event; `None` once both pipes are drained.
    pub async fn next_event(&mut self) -> Option<OutputEvent> {
        self.events.recv().await
    }

    /// Wait for the final report. Undrained events are discarded.
    pub async fn wait(self) -> RunReport {
        drop(self.events);
        self.outcome
            .await
            .unwrap_or_else(|_| RunReport::failure(EXIT_KILLED, false))
    }
}

/// Spawns and supervises agent subprocesses.
///
/// Every live run is tracked in a registry keyed by run id, so
/// [`shutdown`](Self::shutdown) can kill stragglers before the service
/// exits. Entries remove themselves when their run finishes.
pub struct AgentRunner {
    active: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_run: AtomicU64,
}

impl AgentRunner {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
            next_run: AtomicU64::new(1),
        }
    }

    /// Number of runs currently being supervised.
    pub fn active_runs(&self) -> usize {
        self.active.lock().len()
    }

    /// Launch `invocation` and supervise it on a background task.
    ///
    /// Never fails: a spawn problem surfaces as one `Stderr` event plus a
    /// report carrying [`EXIT_LAUNCH_FAILED`], so callers handle launch
    /// failure and runtime failure through the same two code paths.
    pub fn start(&self, invocation: AgentInvocation) -> RunHandle {
        let (event_tx, event_rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.active.lock().insert(run_id, token.clone());

        let registry = Arc::clone(&self.active);
        tokio::spawn(async move {
            let report = supervise(invocation, &event_tx, &token).await;
            registry.lock().remove(&run_id);
            drop(event_tx);
            let _ = outcome_tx.send(report);
        });

        RunHandle {
            events: event_rx,
            outcome: outcome_rx,
        }
    }

    /// Run `--version` through the supervisor and return the first stdout
    /// line.
    pub async fn version_probe(&self, invocation: AgentInvocation) -> anyhow::Result<String> {
        let mut handle = self.start(invocation);
        let mut first_line: Option<String> = None;
        while let Some(event) = handle.next_event().await {
            if let OutputEvent::Stdout(line) = event {
                first_line.get_or_insert(line);
            }
        }
        let report = handle.wait().await;
        if !report.success {
            anyhow::bail!("version probe exited with code {}", report.exit_code);
        }
        first_line.ok_or_else(|| anyhow::anyhow!("version probe produced no output"))
    }

    /// Cancel every live run, then wait up to ~2s for children to be
    /// reaped.
    pub async fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = self.active.lock().values().cloned().collect();
        if tokens.is_empty() {
            return;
        }
        tracing::info!("Stopping {} live agent run(s)", tokens.len());
        for token in &tokens {
            token.cancel();
        }
        for _ in 0..20 {
            if self.active.lock().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::warn!("{} agent run(s) still terminating at shutdown", self.active_runs());
    }
}

/// Drive one child to completion: spawn, drain both pipes, race the time
/// budget and the cancellation token.
async fn supervise(
    invocation: AgentInvocation,
    events: &mpsc::Sender<OutputEvent>,
    cancel: &CancellationToken,
) -> RunReport {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(&invocation.workdir)
        .env("PWD", &invocation.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            let notice = format!("failed to launch agent '{}': {err}", invocation.program);
            tracing::error!("{notice}");
            let _ = events.send(OutputEvent::Stderr(notice)).await;
            return RunReport::failure(EXIT_LAUNCH_FAILED, false);
        }
    };

    let out_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(pump_lines(pipe, events.clone(), OutputEvent::Stdout)));
    let err_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(pump_lines(pipe, events.clone(), OutputEvent::Stderr)));

    let drained = async {
        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }
    };

    tokio::select! {
        () = drained => match child.wait().await {
            Ok(status) => RunReport {
                success: status.success(),
                exit_code: status.code().unwrap_or(EXIT_KILLED),
                timed_out: false,
            },
            Err(err) => {
                tracing::error!("failed to reap agent process: {err}");
                RunReport::failure(EXIT_KILLED, false)
            }
        },
        () = tokio::time::sleep(invocation.timeout) => {
            tracing::warn!("agent run exceeded {}s, killing", invocation.timeout.as_secs());
            let _ = child.kill().await;
            RunReport::failure(EXIT_TIMED_OUT, true)
        }
        () = cancel.cancelled() => {
            tracing::info!("agent run cancelled, killing");
            let _ = child.kill().await;
            RunReport::failure(EXIT_KILLED, false)
        }
    }
}

/// Drain one child pipe: fixed-size reads, newline framing, permissive
/// decoding, escape stripping. Lines that are blank after trimming are
/// dropped; a trailing unterminated line is flushed at EOF.
///
/// Keeps reading to EOF even after the receiver goes away so the child
/// never blocks on a full pipe.
async fn pump_lines<R>(mut pipe: R, events: mpsc::Sender<OutputEvent>, tag: fn(String) -> OutputEvent)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    let mut pending: Vec<u8> = Vec::new();
    let mut sink_open = true;
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&chunk[..n]);
                while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = pending.drain(..=newline).collect();
                    emit_line(&raw[..raw.len() - 1], &events, tag, &mut sink_open).await;
                }
            }
            Err(err) => {
                tracing::warn!("agent pipe read error: {err}");
                break;
            }
        }
    }
    emit_line(&pending, &events, tag, &mut sink_open).await;
}

async fn emit_line(
    raw: &[u8],
    events: &mpsc::Sender<OutputEvent>,
    tag: fn(String) -> OutputEvent,
    sink_open: &mut bool,
) {
    let decoded = String::from_utf8_lossy(raw);
    let line = strip_ansi(&decoded);
    if line.trim().is_empty() {
        return;
    }
    if *sink_open && events.send(tag(line.into_owned())).await.is_err() {
        *sink_open = false;
    }
}
