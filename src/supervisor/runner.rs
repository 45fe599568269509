//! Process-spawning primitive behind the supervisor.
//!
//! The runner spawns one OS process, streams its stdout/stderr line by
//! line, delivers optional stdin, and reports the exit condition. It is a
//! trait so the supervisor can be exercised in tests without real
//! subprocesses.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FailureKind, ForemanError, Result};

/// Channel depth for process events; readers are drained continuously so
/// this only buffers short bursts.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What to spawn.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Delivered to the child's stdin and closed (EOF) once written.
    pub stdin: Option<String>,
}

/// One event from a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A line of stdout.
    Stdout(String),
    /// A line of stderr.
    Stderr(String),
    /// The process exited; `code` is `None` when killed by signal.
    Exited { code: Option<i32> },
}

/// Handle used to request termination of a spawned process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    kill_tx: mpsc::Sender<()>,
}

impl ProcessHandle {
    /// Wrap a kill channel (used by alternative runner implementations).
    #[must_use]
    pub fn new(kill_tx: mpsc::Sender<()>) -> Self {
        Self { kill_tx }
    }

    /// Signal the OS process to terminate. Returns immediately; the exit is
    /// observed later as a [`ProcessEvent::Exited`].
    pub fn kill(&self) {
        let _ = self.kill_tx.try_send(());
    }
}

/// A spawned process: pid, event stream, and kill handle.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ProcessEvent>,
    pub handle: ProcessHandle,
}

/// Abstraction over OS process spawning.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Spawn the process described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ForemanError::WorkerFailed`] when the binary
    /// cannot be spawned at all (e.g. missing from PATH).
    async fn spawn(&self, spec: ProcessSpec) -> Result<SpawnedProcess>;
}

/// Real runner backed by `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn spawn(&self, spec: ProcessSpec) -> Result<SpawnedProcess> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            let kind = if e.kind() == std::io::ErrorKind::NotFound {
                FailureKind::MissingBinary
            } else {
                FailureKind::Unknown
            };
            ForemanError::WorkerFailed {
                kind,
                message: format!("failed to spawn {}: {e}", spec.command),
                exit_code: None,
            }
        })?;

        let pid = child.id();
        debug!("Spawned {} (pid {:?})", spec.command, pid);

        // Write the prompt to stdin, flush, and close to signal EOF.
        if let Some(input) = spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                stdin.flush().await?;
                drop(stdin);
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_tx = tx.clone();
        let stdout_task = tokio::spawn(async move {
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if out_tx.send(ProcessEvent::Stdout(line)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let err_tx = tx.clone();
        let stderr_task = tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if err_tx.send(ProcessEvent::Stderr(line)).await.is_err() {
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            let mut kill_handled = false;
            let code = loop {
                tokio::select! {
                    msg = kill_rx.recv(), if !kill_handled => {
                        kill_handled = true;
                        if msg.is_some() {
                            let _ = child.start_kill();
                        }
                    }
                    status = child.wait() => {
                        break status.ok().and_then(|s| s.code());
                    }
                }
            };
            // Drain both readers to EOF so output precedes the exit event.
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            let _ = tx.send(ProcessEvent::Exited { code }).await;
        });

        Ok(SpawnedProcess {
            pid,
            events: rx,
            handle: ProcessHandle { kill_tx },
        })
    }
}

/// Classify a worker failure from its exit condition and stderr text.
#[must_use]
pub fn classify_failure(exit_code: Option<i32>, stderr: &str, timed_out: bool) -> FailureKind {
    if timed_out {
        return FailureKind::Timeout;
    }

    let stderr = stderr.to_lowercase();

    if stderr.contains("command not found")
        || stderr.contains("no such file or directory")
        || stderr.contains("is not recognized as")
    {
        return FailureKind::MissingBinary;
    }

    let auth_markers = [
        "unauthorized",
        "authentication failed",
        "not logged in",
        "invalid api key",
        "api key not found",
        "login required",
        "error 401",
        "error 403",
    ];
    if auth_markers.iter().any(|m| stderr.contains(m)) {
        return FailureKind::Auth;
    }

    let network_markers = [
        "connection refused",
        "connection reset",
        "could not resolve",
        "network is unreachable",
        "temporary failure in name resolution",
        "enotfound",
        "etimedout",
        "econnreset",
        "tls handshake",
    ];
    if network_markers.iter().any(|m| stderr.contains(m)) {
        return FailureKind::Network;
    }

    let _ = exit_code;
    FailureKind::Unknown
}

/// Whether an OS process with `pid` is currently alive on this host.
///
/// Used for run-lock staleness and registry reconciliation after a hard
/// kill that left no terminal event.
#[must_use]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
