//! Unattended execution loop (auto mode).
//!
//! One autopilot drives one project at a time: it repeatedly asks the state
//! machine for the next runnable task in the active phase and dispatches it
//! sequentially, halting when no work remains, when a task fails, or when a
//! stop is requested. A cross-process run lock guarantees at most one
//! driver system-wide per project; the lock is released on every exit path
//! of the loop.
//!
//! Task selection is "first CI_FIX else first TODO, by list order" within
//! the active phase only — not a priority scheduler. CI_FIX tasks in
//! non-active phases wait until their phase becomes active.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::model::{TaskStatus, UNASSIGNED};
use crate::engine::TaskEngine;
use crate::error::{ForemanError, Result};
use crate::lock::RunLock;
use crate::store::ProjectStore;
use crate::supervisor::record::AgentStatus;
use crate::supervisor::AgentSupervisor;

/// Loop pacing and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutopilotConfig {
    /// Interval between settle polls while stopping.
    #[serde(default = "default_settle_poll_interval_ms")]
    pub settle_poll_interval_ms: u64,

    /// Number of settle polls before giving up.
    #[serde(default = "default_settle_poll_attempts")]
    pub settle_poll_attempts: u32,

    /// Assignee used when a task has none of its own.
    #[serde(default = "default_assignee")]
    pub default_assignee: String,
}

fn default_settle_poll_interval_ms() -> u64 {
    1_000
}
fn default_settle_poll_attempts() -> u32 {
    15
}
fn default_assignee() -> String {
    "CLAUDE_CLI".to_string()
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            settle_poll_interval_ms: default_settle_poll_interval_ms(),
            settle_poll_attempts: default_settle_poll_attempts(),
            default_assignee: default_assignee(),
        }
    }
}

/// Snapshot of the driver's current activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoStatus {
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<String>,
}

impl AutoStatus {
    fn idle(last_outcome: Option<String>) -> Self {
        Self {
            running: false,
            project_name: None,
            phase_id: None,
            task_id: None,
            last_outcome,
        }
    }
}

#[derive(Default)]
struct DriverState {
    running: bool,
    project_name: Option<String>,
    current: Option<(String, String)>,
    last_outcome: Option<String>,
    join: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<DriverState>,
    stop_requested: AtomicBool,
}

/// The auto-mode driver for one project.
pub struct Autopilot {
    engine: Arc<TaskEngine>,
    supervisor: AgentSupervisor,
    store: Arc<dyn ProjectStore>,
    config: AutopilotConfig,
    owner_tag: String,
    shared: Arc<Shared>,
}

impl Autopilot {
    #[must_use]
    pub fn new(
        engine: Arc<TaskEngine>,
        supervisor: AgentSupervisor,
        store: Arc<dyn ProjectStore>,
        config: AutopilotConfig,
    ) -> Self {
        Self {
            engine,
            supervisor,
            store,
            config,
            owner_tag: format!("autopilot-{}", Uuid::new_v4()),
            shared: Arc::new(Shared {
                state: Mutex::new(DriverState::default()),
                stop_requested: AtomicBool::new(false),
            }),
        }
    }

    /// Start the unattended loop.
    ///
    /// # Errors
    ///
    /// Rejects if this driver is already running, or if another process
    /// holds the run lock for the project.
    pub fn start_auto(&self) -> Result<()> {
        let project = self.store.read()?;
        let project_name = project.project_name.clone();

        // Reserve the driver before touching the lock file so two callers
        // cannot both pass the running check.
        {
            let mut state = self.shared.state.lock().expect("driver state lock");
            if state.running {
                return Err(ForemanError::AlreadyRunning {
                    project: project_name,
                });
            }
            state.running = true;
            state.project_name = Some(project_name.clone());
            state.current = None;
            state.last_outcome = None;
        }

        // At most one driver system-wide for this project.
        let lock = match RunLock::acquire(&project.root_dir, &project_name, &self.owner_tag) {
            Ok(lock) => lock,
            Err(e) => {
                self.shared.state.lock().expect("driver state lock").running = false;
                return Err(e);
            }
        };
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        info!("Auto mode started for project '{}'", project_name);

        let engine = self.engine.clone();
        let shared = self.shared.clone();
        let config = self.config.clone();
        let join = tokio::spawn(async move {
            let outcome = drive(&engine, &shared, &config).await;
            info!("Auto mode finished: {}", outcome);

            // The lock is released on every exit path, including errors
            // surfaced as outcomes.
            if let Err(e) = lock.release() {
                warn!("Failed to release run lock: {}", e);
            }

            let mut state = shared.state.lock().expect("driver state lock");
            state.running = false;
            state.current = None;
            state.last_outcome = Some(outcome);
        });

        self.shared.state.lock().expect("driver state lock").join = Some(join);
        Ok(())
    }

    /// Wait for the running loop to finish, returning its outcome.
    pub async fn wait(&self) -> Option<String> {
        let join = self.shared.state.lock().expect("driver state lock").join.take();
        if let Some(join) = join {
            let _ = join.await;
        }
        self.shared
            .state
            .lock()
            .expect("driver state lock")
            .last_outcome
            .clone()
    }

    /// Request a clean stop: kill the correlated agent, wait for the current
    /// task to settle, and leave the project at a clean task boundary.
    pub async fn stop(&self) -> Result<()> {
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        let (project_name, current) = {
            let state = self.shared.state.lock().expect("driver state lock");
            (state.project_name.clone(), state.current.clone())
        };

        let Some((phase_id, task_id)) = current else {
            return Ok(()); // idle between dispatches; the loop exits on its next check
        };

        // Kill any RUNNING agent correlated to the in-flight task.
        for view in self.supervisor.list()? {
            let correlated = view.status == AgentStatus::Running
                && view.project_name.as_deref() == project_name.as_deref()
                && view.phase_id.as_deref() == Some(phase_id.as_str())
                && view.task_id.as_deref() == Some(task_id.as_str());
            if correlated {
                info!("Stopping agent {} for task '{}'", view.id, task_id);
                self.supervisor.kill(view.id)?;
            }
        }

        // Poll for the task to leave IN_PROGRESS.
        let mut settled = None;
        for _ in 0..self.config.settle_poll_attempts {
            let state = self.store.read()?;
            if let Some((_, task)) = state.find_task(&task_id) {
                if task.status != TaskStatus::InProgress {
                    settled = Some(task.status);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.settle_poll_interval_ms)).await;
        }

        match settled {
            Some(TaskStatus::Failed) => {
                // A stop-induced failure is not a real failure; return the
                // task to TODO so the project is never left half-applied.
                self.engine.reset_task_to_todo(&phase_id, &task_id).await?;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ForemanError::StopSettleTimeout {
                task_id,
                attempts: self.config.settle_poll_attempts,
            }),
        }
    }

    /// Current status for `project_name` (or whatever project is active
    /// when `None`). A single driver only ever reflects one active project;
    /// any other project reports idle.
    pub fn status(&self, project_name: Option<&str>) -> AutoStatus {
        let state = self.shared.state.lock().expect("driver state lock");
        let matches = match (project_name, &state.project_name) {
            (Some(asked), Some(active)) => asked == active,
            (Some(_), None) => false,
            (None, _) => true,
        };
        if state.running && matches {
            AutoStatus {
                running: true,
                project_name: state.project_name.clone(),
                phase_id: state.current.as_ref().map(|(p, _)| p.clone()),
                task_id: state.current.as_ref().map(|(_, t)| t.clone()),
                last_outcome: state.last_outcome.clone(),
            }
        } else {
            AutoStatus::idle(if matches { state.last_outcome.clone() } else { None })
        }
    }
}

/// The sequential drive loop. Every exit path reduces to an outcome string.
async fn drive(engine: &TaskEngine, shared: &Shared, config: &AutopilotConfig) -> String {
    loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            return "stop requested".to_string();
        }

        let phase = match engine.resolve_active_phase() {
            Ok(Some(phase)) => phase,
            Ok(None) => return "no phase available".to_string(),
            Err(e) => return format!("halted: {e}"),
        };

        // First CI_FIX, else first TODO, by list order.
        let next = phase
            .tasks
            .iter()
            .find(|t| t.status == TaskStatus::CiFix)
            .or_else(|| phase.tasks.iter().find(|t| t.status == TaskStatus::Todo));
        let Some(task) = next else {
            return "finished, no TODO/CI_FIX tasks remain".to_string();
        };

        let assignee = if task.assignee != UNASSIGNED {
            task.assignee.clone()
        } else {
            config.default_assignee.clone()
        };

        {
            let mut state = shared.state.lock().expect("driver state lock");
            state.current = Some((phase.id.clone(), task.id.clone()));
        }

        let result = engine.start_task(&phase.id, &task.id, &assignee).await;

        {
            let mut state = shared.state.lock().expect("driver state lock");
            state.current = None;
        }

        match result {
            Ok(task) if task.status == TaskStatus::Done => {}
            Ok(task) => {
                // Auto mode halts on the first failure; no automatic retry.
                return format!("halted: task '{}' ended {}", task.id, task.status);
            }
            Err(e) => return format!("halted: {e}"),
        }
    }
}
