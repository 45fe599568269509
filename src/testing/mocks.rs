//! Mock implementations of external collaborators.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::dispatch::{DispatchRequest, GitProbe, RepoReset, WorkerDispatcher};
use crate::error::{FailureKind, ForemanError, Result};
use crate::supervisor::runner::{
    ProcessEvent, ProcessHandle, ProcessRunner, ProcessSpec, SpawnedProcess,
};
use crate::supervisor::CompletedRun;

// ============================================================================
// Process runner
// ============================================================================

/// Scripted behavior for one mock process spawn.
#[derive(Debug, Clone)]
pub struct MockScript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// `Some(code)` exits after emitting output; `None` hangs until killed.
    pub exit_code: Option<i32>,
    /// Hold the stream shut until [`MockProcessRunner::release`] is called.
    pub hold_open: bool,
    pub pid: Option<u32>,
}

impl MockScript {
    /// Script that emits its output and exits with `code`.
    #[must_use]
    pub fn exits(code: i32) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: Some(code),
            hold_open: false,
            pid: Some(std::process::id()),
        }
    }

    /// Script that emits its output and then hangs until killed.
    #[must_use]
    pub fn hang() -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code: None,
            hold_open: false,
            pid: Some(std::process::id()),
        }
    }

    #[must_use]
    pub fn with_stdout(mut self, lines: Vec<&str>) -> Self {
        self.stdout = lines.into_iter().map(String::from).collect();
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, lines: Vec<&str>) -> Self {
        self.stderr = lines.into_iter().map(String::from).collect();
        self
    }

    #[must_use]
    pub fn with_hold_open(mut self, hold: bool) -> Self {
        self.hold_open = hold;
        self
    }
}

/// Process runner replaying scripted spawns.
///
/// Scripts are consumed in push order; a spawn with no script behaves like
/// [`MockScript::exits`] with code 0.
#[derive(Default)]
pub struct MockProcessRunner {
    scripts: Mutex<VecDeque<MockScript>>,
    released: Arc<AtomicBool>,
    spawn_count: AtomicU32,
}

impl MockProcessRunner {
    /// Queue the script for the next spawn.
    pub fn push_script(&self, script: MockScript) {
        self.scripts
            .lock()
            .expect("scripts lock")
            .push_back(script);
    }

    /// Open the gate for scripts created with `hold_open`.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    /// Number of spawns served so far.
    pub fn spawn_count(&self) -> u32 {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn spawn(&self, _spec: ProcessSpec) -> Result<SpawnedProcess> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .pop_front()
            .unwrap_or_else(|| MockScript::exits(0));

        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let (kill_tx, mut kill_rx) = tokio::sync::mpsc::channel::<()>(1);
        let released = self.released.clone();
        let pid = script.pid;

        tokio::spawn(async move {
            if script.hold_open {
                loop {
                    if released.load(Ordering::SeqCst) {
                        break;
                    }
                    if kill_rx.try_recv().is_ok() {
                        let _ = tx.send(ProcessEvent::Exited { code: None }).await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            for line in script.stdout {
                let _ = tx.send(ProcessEvent::Stdout(line)).await;
            }
            for line in script.stderr {
                let _ = tx.send(ProcessEvent::Stderr(line)).await;
            }
            match script.exit_code {
                Some(code) => {
                    let _ = tx.send(ProcessEvent::Exited { code: Some(code) }).await;
                }
                None => {
                    let _ = kill_rx.recv().await;
                    let _ = tx.send(ProcessEvent::Exited { code: None }).await;
                }
            }
        });

        Ok(SpawnedProcess {
            pid,
            events: rx,
            handle: ProcessHandle::new(kill_tx),
        })
    }
}

// ============================================================================
// Worker dispatcher
// ============================================================================

type DispatchHook = Box<dyn Fn(&DispatchRequest) + Send + Sync>;

/// Dispatcher replaying scripted results and recording every request.
#[derive(Default)]
pub struct MockDispatcher {
    results: Mutex<VecDeque<Result<CompletedRun>>>,
    requests: Mutex<Vec<DispatchRequest>>,
    fail_preflight: AtomicBool,
    dispatch_delay_ms: AtomicU32,
    on_dispatch: Mutex<Option<DispatchHook>>,
}

impl MockDispatcher {
    /// Queue a successful run with the given stdout.
    pub fn push_success(&self, stdout: &str) {
        self.results
            .lock()
            .expect("results lock")
            .push_back(Ok(CompletedRun {
                command: "mock-worker".into(),
                args: vec![],
                stdout: stdout.to_string(),
                stderr: String::new(),
                duration_ms: 5,
            }));
    }

    /// Queue a classified worker failure.
    pub fn push_failure(&self, kind: FailureKind, message: &str) {
        self.results
            .lock()
            .expect("results lock")
            .push_back(Err(ForemanError::WorkerFailed {
                kind,
                message: message.to_string(),
                exit_code: Some(1),
            }));
    }

    /// Make `preflight` fail with missing-binary from now on.
    pub fn fail_preflight(&self) {
        self.fail_preflight.store(true, Ordering::SeqCst);
    }

    /// Delay every dispatch, simulating a long-running worker.
    pub fn set_dispatch_delay_ms(&self, delay_ms: u32) {
        self.dispatch_delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// Run `hook` on every dispatch (e.g. to simulate worker side effects).
    pub fn on_dispatch(&self, hook: impl Fn(&DispatchRequest) + Send + Sync + 'static) {
        *self.on_dispatch.lock().expect("hook lock") = Some(Box::new(hook));
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Number of dispatches served.
    pub fn dispatch_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }
}

#[async_trait]
impl WorkerDispatcher for MockDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<CompletedRun> {
        let delay = self.dispatch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if let Some(hook) = self.on_dispatch.lock().expect("hook lock").as_ref() {
            hook(&request);
        }
        self.requests
            .lock()
            .expect("requests lock")
            .push(request);
        self.results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or_else(|| {
                Ok(CompletedRun {
                    command: "mock-worker".into(),
                    args: vec![],
                    stdout: "ok".into(),
                    stderr: String::new(),
                    duration_ms: 5,
                })
            })
    }

    fn preflight(&self, assignee: &str) -> Result<()> {
        if self.fail_preflight.load(Ordering::SeqCst) {
            return Err(ForemanError::agent_failure_with_kind(
                format!("worker binary for '{assignee}' not found on PATH"),
                FailureKind::MissingBinary,
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Git probe / repo reset
// ============================================================================

/// Git probe with settable answers.
pub struct MockGitProbe {
    branch_pushed: AtomicBool,
    cli_ready: AtomicBool,
}

impl Default for MockGitProbe {
    fn default() -> Self {
        Self {
            branch_pushed: AtomicBool::new(true),
            cli_ready: AtomicBool::new(true),
        }
    }
}

impl MockGitProbe {
    pub fn set_branch_pushed(&self, pushed: bool) {
        self.branch_pushed.store(pushed, Ordering::SeqCst);
    }

    pub fn set_cli_ready(&self, ready: bool) {
        self.cli_ready.store(ready, Ordering::SeqCst);
    }
}

#[async_trait]
impl GitProbe for MockGitProbe {
    async fn branch_pushed(&self, _branch: &str) -> Result<bool> {
        Ok(self.branch_pushed.load(Ordering::SeqCst))
    }

    async fn cli_ready(&self) -> Result<bool> {
        Ok(self.cli_ready.load(Ordering::SeqCst))
    }
}

/// Repo reset that records invocations instead of touching a repository.
#[derive(Default)]
pub struct MockRepoReset {
    resets: AtomicU32,
}

impl MockRepoReset {
    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoReset for MockRepoReset {
    async fn hard_reset(&self, _root_dir: &Path) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_runner_default_exits_zero() {
        let runner = MockProcessRunner::default();
        let mut spawned = runner
            .spawn(ProcessSpec {
                command: "x".into(),
                args: vec![],
                cwd: "/tmp".into(),
                stdin: None,
            })
            .await
            .unwrap();

        let mut code = None;
        while let Some(event) = spawned.events.recv().await {
            if let ProcessEvent::Exited { code: c } = event {
                code = c;
                break;
            }
        }
        assert_eq!(code, Some(0));
        assert_eq!(runner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_runner_hang_until_killed() {
        let runner = MockProcessRunner::default();
        runner.push_script(MockScript::hang().with_stdout(vec!["working"]));
        let mut spawned = runner
            .spawn(ProcessSpec {
                command: "x".into(),
                args: vec![],
                cwd: "/tmp".into(),
                stdin: None,
            })
            .await
            .unwrap();

        assert_eq!(
            spawned.events.recv().await,
            Some(ProcessEvent::Stdout("working".into()))
        );
        spawned.handle.kill();
        assert_eq!(
            spawned.events.recv().await,
            Some(ProcessEvent::Exited { code: None })
        );
    }

    #[tokio::test]
    async fn test_mock_dispatcher_scripts_and_records() {
        let dispatcher = MockDispatcher::default();
        dispatcher.push_failure(FailureKind::Network, "connection refused");

        let request = DispatchRequest {
            assignee: "CLAUDE_CLI".into(),
            prompt: "p".into(),
            phase_id: Some("p1".into()),
            task_id: Some("t1".into()),
            project_name: None,
            resume: false,
        };
        let err = dispatcher.dispatch(request).await.unwrap_err();
        assert_eq!(err.failure_kind(), Some(FailureKind::Network));
        assert_eq!(dispatcher.dispatch_count(), 1);
        assert_eq!(dispatcher.requests()[0].task_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_mock_git_probe_flags() {
        let probe = MockGitProbe::default();
        assert!(probe.branch_pushed("main").await.unwrap());
        probe.set_branch_pushed(false);
        assert!(!probe.branch_pushed("main").await.unwrap());
    }
}
