//! Collaborator seams around the state machine.
//!
//! The state machine never builds CLI invocations or git commands itself;
//! it talks to these traits. The default implementations here are thin
//! shells over the supervisor and the `git`/`gh` CLIs; tests substitute
//! the mocks from [`crate::testing`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FailureKind, ForemanError, Result};
use crate::supervisor::{AgentSupervisor, CompletedRun, StartAgentInput};

/// A request to run one task through a worker CLI.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Worker id (e.g. "CLAUDE_CLI") the adapter maps to a command line.
    pub assignee: String,
    /// Generated prompt carrying the task context.
    pub prompt: String,
    pub phase_id: Option<String>,
    pub task_id: Option<String>,
    pub project_name: Option<String>,
    /// Set on a same-assignee retry so the worker can continue a prior
    /// session.
    pub resume: bool,
}

/// Maps an assignee id to a concrete CLI invocation and runs it.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    /// Run the worker to completion.
    async fn dispatch(&self, request: DispatchRequest) -> Result<CompletedRun>;

    /// Cheap capability check for an assignee (binary present) without
    /// spending a worker invocation.
    fn preflight(&self, assignee: &str) -> Result<()>;
}

/// Read-only probes against the git remote and its tooling.
#[async_trait]
pub trait GitProbe: Send + Sync {
    /// Whether `branch` exists on the remote.
    async fn branch_pushed(&self, branch: &str) -> Result<bool>;

    /// Whether the GitHub CLI is present and authenticated.
    async fn cli_ready(&self) -> Result<bool>;
}

/// Hard repository reset, used when a FAILED task may have left partial
/// filesystem changes behind.
#[async_trait]
pub trait RepoReset: Send + Sync {
    async fn hard_reset(&self, root_dir: &Path) -> Result<()>;
}

// ============================================================================
// Worker command table
// ============================================================================

/// Concrete CLI invocation for one assignee id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra args appended when resuming a prior session.
    #[serde(default)]
    pub resume_args: Vec<String>,
}

/// Built-in worker table covering the common coding-agent CLIs.
#[must_use]
pub fn default_worker_commands() -> HashMap<String, WorkerCommand> {
    let mut workers = HashMap::new();
    workers.insert(
        "CLAUDE_CLI".to_string(),
        WorkerCommand {
            command: "claude".into(),
            args: vec!["-p".into(), "--dangerously-skip-permissions".into()],
            resume_args: vec!["--continue".into()],
        },
    );
    workers.insert(
        "CODEX_CLI".to_string(),
        WorkerCommand {
            command: "codex".into(),
            args: vec!["exec".into()],
            resume_args: vec!["resume".into(), "--last".into()],
        },
    );
    workers
}

// ============================================================================
// Default implementations
// ============================================================================

/// Dispatcher backed by the agent supervisor's run-to-completion path.
pub struct SupervisorDispatcher {
    supervisor: AgentSupervisor,
    workers: HashMap<String, WorkerCommand>,
    root_dir: PathBuf,
}

impl SupervisorDispatcher {
    #[must_use]
    pub fn new(
        supervisor: AgentSupervisor,
        workers: HashMap<String, WorkerCommand>,
        root_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            supervisor,
            workers,
            root_dir: root_dir.into(),
        }
    }

    fn worker(&self, assignee: &str) -> Result<&WorkerCommand> {
        self.workers.get(assignee).ok_or_else(|| {
            ForemanError::agent_failure(format!("no worker command configured for '{assignee}'"))
        })
    }
}

#[async_trait]
impl WorkerDispatcher for SupervisorDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<CompletedRun> {
        let worker = self.worker(&request.assignee)?;

        let mut args = worker.args.clone();
        if request.resume {
            args.extend(worker.resume_args.iter().cloned());
        }

        debug!(
            "Dispatching task {:?} to {} ({} {:?})",
            request.task_id, request.assignee, worker.command, args
        );

        let input = StartAgentInput {
            name: format!("{}:{}", request.assignee, request.task_id.as_deref().unwrap_or("-")),
            command: worker.command.clone(),
            args,
            cwd: self.root_dir.clone(),
            adapter_id: Some(request.assignee.clone()),
            phase_id: request.phase_id.clone(),
            task_id: request.task_id.clone(),
            project_name: request.project_name.clone(),
            stdin: Some(request.prompt.clone()),
            timeout_ms: None,
            approved_adapter_spawn: true,
        };

        self.supervisor.run_to_completion(input).await
    }

    fn preflight(&self, assignee: &str) -> Result<()> {
        let worker = self.worker(assignee)?;
        which::which(&worker.command).map_err(|_| {
            ForemanError::agent_failure_with_kind(
                format!("worker binary '{}' not found on PATH", worker.command),
                FailureKind::MissingBinary,
            )
        })?;
        Ok(())
    }
}

/// Git probe shelling out to `git`/`gh`.
pub struct GitCliProbe {
    root_dir: PathBuf,
}

impl GitCliProbe {
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }
}

#[async_trait]
impl GitProbe for GitCliProbe {
    async fn branch_pushed(&self, branch: &str) -> Result<bool> {
        let output = tokio::process::Command::new("git")
            .args(["ls-remote", "--exit-code", "--heads", "origin", branch])
            .current_dir(&self.root_dir)
            .output()
            .await?;
        Ok(output.status.success())
    }

    async fn cli_ready(&self) -> Result<bool> {
        if which::which("gh").is_err() {
            return Ok(false);
        }
        let output = tokio::process::Command::new("gh")
            .args(["auth", "status"])
            .current_dir(&self.root_dir)
            .output()
            .await?;
        Ok(output.status.success())
    }
}

/// Repository reset shelling out to `git reset --hard` + `git clean`.
#[derive(Debug, Default)]
pub struct GitCliReset;

#[async_trait]
impl RepoReset for GitCliReset {
    async fn hard_reset(&self, root_dir: &Path) -> Result<()> {
        let reset = tokio::process::Command::new("git")
            .args(["reset", "--hard", "HEAD"])
            .current_dir(root_dir)
            .output()
            .await?;
        if !reset.status.success() {
            return Err(ForemanError::dirty_worktree(format!(
                "git reset --hard failed: {}",
                String::from_utf8_lossy(&reset.stderr).trim()
            )));
        }

        let clean = tokio::process::Command::new("git")
            .args(["clean", "-fd"])
            .current_dir(root_dir)
            .output()
            .await?;
        if !clean.status.success() {
            return Err(ForemanError::dirty_worktree(format!(
                "git clean -fd failed: {}",
                String::from_utf8_lossy(&clean.stderr).trim()
            )));
        }
        Ok(())
    }
}
