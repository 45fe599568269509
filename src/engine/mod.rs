//! Task/phase state machine.
//!
//! Owns the phase/task data model, validates dependency and retry
//! constraints, dispatches tasks to workers, verifies completion side
//! effects, and records recovery attempts. Worker failures are converted
//! into persisted task-state mutations; only genuinely invalid inputs (bad
//! ids, broken dependency graphs) propagate as errors the caller must not
//! retry blindly.

pub mod model;
pub mod prompt;
pub mod verification;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::{DispatchRequest, GitProbe, RepoReset, WorkerDispatcher};
use crate::error::{ErrorCategory, FailureKind, ForemanError, Result};
use crate::store::ProjectStore;
use model::{
    cap_text, CiFailureKind, Phase, PhaseStatus, ProjectState, RecoveryAttemptRecord,
    RecoveryExceptionSnapshot, RecoveryResult, Task, TaskStatus, UNASSIGNED,
};

/// Partial update for a task's authored fields.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub dependencies: Option<Vec<String>>,
}

/// The task/phase state machine.
pub struct TaskEngine {
    store: Arc<dyn ProjectStore>,
    dispatcher: Arc<dyn WorkerDispatcher>,
    git: Arc<dyn GitProbe>,
    reset: Arc<dyn RepoReset>,
}

impl TaskEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn ProjectStore>,
        dispatcher: Arc<dyn WorkerDispatcher>,
        git: Arc<dyn GitProbe>,
        reset: Arc<dyn RepoReset>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            git,
            reset,
        }
    }

    /// Read the current project state.
    pub fn state(&self) -> Result<ProjectState> {
        self.store.read()
    }

    // ========================================================================
    // Phase/task authoring
    // ========================================================================

    /// Create a phase and append it to the project.
    pub fn create_phase(&self, name: &str, branch_name: &str) -> Result<Phase> {
        require_text("name", name)?;
        require_text("branch_name", branch_name)?;

        let mut state = self.store.read()?;
        let id = format!("phase-{}", state.phases.len() + 1);
        let phase = Phase::new(id, name.trim(), branch_name.trim());
        state.phases.push(phase.clone());
        self.store.write(state)?;
        info!("Created phase '{}' ({})", phase.name, phase.id);
        Ok(phase)
    }

    /// Create a task and append it to a phase.
    pub fn create_task(
        &self,
        phase_id: &str,
        title: &str,
        description: &str,
        dependencies: Vec<String>,
    ) -> Result<Task> {
        require_text("title", title)?;
        require_text("description", description)?;

        let mut state = self.store.read()?;
        for dep_id in &dependencies {
            if state.find_task(dep_id).is_none() {
                return Err(ForemanError::UnknownDependency { id: dep_id.clone() });
            }
        }

        let id = format!(
            "task-{}",
            state.phases.iter().map(|p| p.tasks.len()).sum::<usize>() + 1
        );
        let mut task = Task::new(id, title.trim(), description.trim());
        task.dependencies = dependencies;

        let phase = state
            .phase_mut(phase_id)
            .ok_or_else(|| ForemanError::UnknownPhase {
                id: phase_id.to_string(),
            })?;
        phase.tasks.push(task.clone());
        self.store.write(state)?;
        Ok(task)
    }

    /// Update a task's authored fields. Unknown dependency ids are rejected.
    pub fn update_task(&self, phase_id: &str, task_id: &str, update: TaskUpdate) -> Result<Task> {
        let mut state = self.store.read()?;

        if let Some(title) = &update.title {
            require_text("title", title)?;
        }
        if let Some(description) = &update.description {
            require_text("description", description)?;
        }
        if let Some(dependencies) = &update.dependencies {
            for dep_id in dependencies {
                if state.find_task(dep_id).is_none() {
                    return Err(ForemanError::UnknownDependency { id: dep_id.clone() });
                }
            }
        }

        let task = resolve_task_mut(&mut state, phase_id, task_id)?;
        if let Some(title) = update.title {
            task.title = title.trim().to_string();
        }
        if let Some(description) = update.description {
            task.description = description.trim().to_string();
        }
        if let Some(dependencies) = update.dependencies {
            task.dependencies = dependencies;
        }
        let snapshot = task.clone();
        self.store.write(state)?;
        Ok(snapshot)
    }

    /// Select the active phase by id or 1-based phase number.
    pub fn set_active_phase(&self, selector: &str) -> Result<Phase> {
        let mut state = self.store.read()?;

        let phase = if let Ok(number) = selector.parse::<usize>() {
            (number >= 1)
                .then(|| state.phases.get(number - 1))
                .flatten()
        } else {
            state.phases.iter().find(|p| p.id == selector)
        };

        let phase = phase
            .cloned()
            .ok_or_else(|| ForemanError::UnknownPhase {
                id: selector.to_string(),
            })?;

        state.active_phase_id = Some(phase.id.clone());
        self.store.write(state)?;
        Ok(phase)
    }

    /// Resolve the active phase: the explicit reference if set, else the
    /// first phase. An explicit reference to a phase that no longer resolves
    /// is a non-recoverable preflight condition.
    pub fn resolve_active_phase(&self) -> Result<Option<Phase>> {
        let state = self.store.read()?;
        match &state.active_phase_id {
            Some(id) => state
                .phase(id)
                .cloned()
                .map(Some)
                .ok_or_else(|| ForemanError::StalePhaseReference {
                    reference: id.clone(),
                }),
            None => Ok(state.phases.first().cloned()),
        }
    }

    /// Set a phase's lifecycle status. A CI_FAILED status requires a failure
    /// kind; leaving CI_FAILED clears it.
    pub fn set_phase_status(
        &self,
        phase_id: &str,
        status: PhaseStatus,
        failure_kind: Option<CiFailureKind>,
        ci_status_context: Option<String>,
    ) -> Result<Phase> {
        if status == PhaseStatus::CiFailed && failure_kind.is_none() {
            return Err(ForemanError::EmptyField {
                field: "failure_kind".into(),
            });
        }

        let mut state = self.store.read()?;
        let phase = state
            .phase_mut(phase_id)
            .ok_or_else(|| ForemanError::UnknownPhase {
                id: phase_id.to_string(),
            })?;

        phase.transition(status);
        if status == PhaseStatus::CiFailed {
            phase.failure_kind = failure_kind;
            if ci_status_context.is_some() {
                phase.ci_status_context = ci_status_context;
            }
        }
        let snapshot = phase.clone();
        self.store.write(state)?;
        Ok(snapshot)
    }

    /// Record the phase's pull-request URL.
    pub fn set_phase_pr_url(&self, phase_id: &str, pr_url: &str) -> Result<Phase> {
        require_text("pr_url", pr_url)?;
        let mut state = self.store.read()?;
        let phase = state
            .phase_mut(phase_id)
            .ok_or_else(|| ForemanError::UnknownPhase {
                id: phase_id.to_string(),
            })?;
        phase.pr_url = Some(pr_url.trim().to_string());
        let snapshot = phase.clone();
        self.store.write(state)?;
        Ok(snapshot)
    }

    // ========================================================================
    // Recovery ledger
    // ========================================================================

    /// Append an immutable recovery-attempt record to a task's ledger (when
    /// `task_id` is given) or the phase's. This is the only recovery
    /// mutation the state machine performs; it never computes fixes.
    pub fn record_recovery_attempt(
        &self,
        phase_id: &str,
        task_id: Option<&str>,
        exception: RecoveryExceptionSnapshot,
        result: RecoveryResult,
    ) -> Result<RecoveryAttemptRecord> {
        let mut state = self.store.read()?;

        let ledger = match task_id {
            Some(task_id) => &mut resolve_task_mut(&mut state, phase_id, task_id)?.recovery_attempts,
            None => {
                &mut state
                    .phase_mut(phase_id)
                    .ok_or_else(|| ForemanError::UnknownPhase {
                        id: phase_id.to_string(),
                    })?
                    .recovery_attempts
            }
        };

        let record = RecoveryAttemptRecord {
            id: uuid::Uuid::new_v4(),
            occurred_at: chrono::Utc::now(),
            attempt_number: ledger.len() as u32 + 1,
            exception,
            result,
        };
        ledger.push(record.clone());
        self.store.write(state)?;
        Ok(record)
    }

    // ========================================================================
    // Reset / reconcile
    // ========================================================================

    /// Reset a task to TODO: clear failure state, clear the assignee, and
    /// hard-reset the repository — a FAILED task may have left partial
    /// filesystem changes behind.
    pub async fn reset_task_to_todo(&self, phase_id: &str, task_id: &str) -> Result<Task> {
        let mut state = self.store.read()?;
        let root_dir = state.root_dir.clone();

        let task = resolve_task_mut(&mut state, phase_id, task_id)?;
        task.status = TaskStatus::Todo;
        task.assignee = UNASSIGNED.to_string();
        task.clear_failure();
        let snapshot = task.clone();
        self.store.write(state)?;

        self.reset.hard_reset(&root_dir).await?;
        info!("Reset task '{}' to TODO and hard-reset the repository", task_id);
        Ok(snapshot)
    }

    /// Startup safety net: any task stuck IN_PROGRESS from a prior crash is
    /// reset to TODO. Returns the number of tasks reset.
    pub fn reconcile_in_progress_tasks(&self) -> Result<u32> {
        let mut state = self.store.read()?;
        let mut count = 0;
        for phase in &mut state.phases {
            for task in &mut phase.tasks {
                if task.status == TaskStatus::InProgress {
                    task.status = TaskStatus::Todo;
                    count += 1;
                }
            }
        }
        if count > 0 {
            warn!("Reconciled {} task(s) stuck IN_PROGRESS back to TODO", count);
            self.store.write(state)?;
        }
        Ok(count)
    }

    /// Reset one specific IN_PROGRESS task back to TODO.
    pub fn reconcile_in_progress_task_to_todo(
        &self,
        phase_id: &str,
        task_id: &str,
    ) -> Result<Task> {
        let mut state = self.store.read()?;
        let task = resolve_task_mut(&mut state, phase_id, task_id)?;
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Todo;
        }
        let snapshot = task.clone();
        self.store.write(state)?;
        Ok(snapshot)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Start a task: validate constraints, dispatch it to `assignee`, and
    /// persist the terminal outcome.
    ///
    /// Worker and preflight failures are recorded on the task (the returned
    /// task carries status FAILED); validation failures and non-recoverable
    /// preflight conditions are returned as errors.
    pub async fn start_task(&self, phase_id: &str, task_id: &str, assignee: &str) -> Result<Task> {
        require_text("assignee", assignee)?;
        let mut state = self.store.read()?;

        // Resolve phase and task; fail fast if either is missing.
        let phase = state
            .phase(phase_id)
            .ok_or_else(|| ForemanError::UnknownPhase {
                id: phase_id.to_string(),
            })?;
        let task = phase
            .task(task_id)
            .ok_or_else(|| ForemanError::UnknownTask {
                id: task_id.to_string(),
            })?;

        // Non-recoverable preflight conditions: operator action required.
        if phase.status.is_terminal() {
            return Err(ForemanError::TerminalPhaseStatus {
                phase_id: phase_id.to_string(),
                status: phase.status.to_string(),
            });
        }
        if phase.branch_name.trim().is_empty() {
            return Err(ForemanError::EmptyBranchName {
                phase_id: phase_id.to_string(),
            });
        }

        // Every dependency must resolve to DONE; dependencies may live in
        // other phases.
        for dep_id in &task.dependencies {
            match state.find_task(dep_id) {
                None => {
                    return Err(ForemanError::UnknownDependency { id: dep_id.clone() });
                }
                Some((_, dep)) if dep.status != TaskStatus::Done => {
                    return Err(ForemanError::IncompleteDependency {
                        dependency_id: dep_id.clone(),
                        status: dep.status.to_string(),
                    });
                }
                Some(_) => {}
            }
        }

        // A FAILED task must be retried by the worker that owns the broken
        // session; a same-assignee retry resumes that session.
        let retrying = task.status == TaskStatus::Failed;
        if retrying && task.is_assigned() && task.assignee != assignee {
            return Err(ForemanError::RetryAssigneeMismatch {
                previous: task.assignee.clone(),
                requested: assignee.to_string(),
            });
        }
        let resume = retrying;
        let was_ci_fix = task.status == TaskStatus::CiFix;

        let contracts = verification::derive_contracts(&task.title, &task.description);

        // Capability preflight before spending a worker invocation.
        if !contracts.is_empty() {
            if let Err(e) = self.contract_preflight(assignee, &contracts).await {
                warn!("Preflight for task '{}' failed: {}", task_id, e);
                let task = resolve_task_mut(&mut state, phase_id, task_id)?;
                task.assignee = assignee.to_string();
                task.status = TaskStatus::Failed;
                task.error_logs = Some(cap_text(&e.to_string()));
                task.error_category = Some(ErrorCategory::AgentFailure);
                task.adapter_failure_kind =
                    Some(e.failure_kind().unwrap_or(FailureKind::MissingBinary));
                let snapshot = task.clone();
                self.store.write(state)?;
                return Ok(snapshot);
            }
        }

        // Mark IN_PROGRESS and persist before invoking the worker.
        {
            let task = resolve_task_mut(&mut state, phase_id, task_id)?;
            task.status = TaskStatus::InProgress;
            task.assignee = assignee.to_string();
            task.clear_failure();
        }
        let state = self.store.write(state)?;

        let phase = state.phase(phase_id).expect("phase resolved above");
        let task = phase.task(task_id).expect("task resolved above");
        let prompt_text = prompt::build_dispatch_prompt(&state, phase, task, &contracts, resume);

        debug!(
            "Dispatching task '{}' to '{}' (resume: {}, contracts: {:?})",
            task_id, assignee, resume, contracts
        );
        let outcome = self
            .dispatcher
            .dispatch(DispatchRequest {
                assignee: assignee.to_string(),
                prompt: prompt_text,
                phase_id: Some(phase_id.to_string()),
                task_id: Some(task_id.to_string()),
                project_name: Some(state.project_name.clone()),
                resume,
            })
            .await;

        // Re-read: side effects (PR URL, CI context) may have landed while
        // the worker ran.
        let mut state = self.store.read()?;

        match outcome {
            Ok(run) => {
                let verification = if contracts.is_empty() {
                    None
                } else {
                    let phase = state
                        .phase(phase_id)
                        .ok_or_else(|| ForemanError::UnknownPhase {
                            id: phase_id.to_string(),
                        })?;
                    Some(verification::verify_contracts(phase, &contracts, self.git.as_ref()).await)
                };

                match verification {
                    Some(v) if !v.passed() => {
                        // Verification is authoritative over the exit code:
                        // exit 0 is not proof the side effect happened.
                        let summary = format!(
                            "completion verification failed: {}",
                            v.missing_side_effects.join("; ")
                        );
                        warn!("Task '{}': {}", task_id, summary);
                        let task = resolve_task_mut(&mut state, phase_id, task_id)?;
                        task.status = TaskStatus::Failed;
                        task.error_logs = Some(cap_text(&summary));
                        task.completion_verification = Some(v);
                    }
                    v => {
                        let task = resolve_task_mut(&mut state, phase_id, task_id)?;
                        task.status = TaskStatus::Done;
                        task.result_context = Some(cap_text(&run.stdout));
                        task.completion_verification = v;
                        info!("Task '{}' completed by '{}'", task_id, assignee);

                        // A successful CI_FIX task returns its phase to
                        // CODING; completing any other task never clears
                        // CI_FAILED.
                        if was_ci_fix {
                            let phase = state
                                .phase_mut(phase_id)
                                .ok_or_else(|| ForemanError::UnknownPhase {
                                    id: phase_id.to_string(),
                                })?;
                            if phase.status == PhaseStatus::CiFailed {
                                phase.transition(PhaseStatus::Coding);
                                phase.ci_status_context = None;
                                info!("Phase '{}' returned to CODING after CI fix", phase_id);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Task '{}' worker failure: {}", task_id, e);
                let task = resolve_task_mut(&mut state, phase_id, task_id)?;
                task.status = TaskStatus::Failed;
                task.error_logs = Some(cap_text(&e.to_string()));
                task.error_category = Some(e.category().unwrap_or(ErrorCategory::AgentFailure));
                task.adapter_failure_kind = Some(e.failure_kind().unwrap_or(FailureKind::Unknown));
            }
        }

        let snapshot = resolve_task_mut(&mut state, phase_id, task_id)?.clone();
        self.store.write(state)?;
        Ok(snapshot)
    }

    /// Check required tooling for the derived contracts before dispatch.
    async fn contract_preflight(
        &self,
        assignee: &str,
        contracts: &[model::ContractKind],
    ) -> Result<()> {
        self.dispatcher.preflight(assignee)?;

        let needs_gh = contracts.iter().any(|c| {
            matches!(
                c,
                model::ContractKind::PrCreation | model::ContractKind::CiTriggeredUpdate
            )
        });
        if needs_gh && !self.git.cli_ready().await? {
            return Err(ForemanError::agent_failure_with_kind(
                "GitHub CLI missing or unauthenticated",
                FailureKind::MissingBinary,
            ));
        }
        Ok(())
    }
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ForemanError::EmptyField {
            field: field.to_string(),
        });
    }
    Ok(())
}

fn resolve_task_mut<'a>(
    state: &'a mut ProjectState,
    phase_id: &str,
    task_id: &str,
) -> Result<&'a mut Task> {
    let phase = state
        .phase_mut(phase_id)
        .ok_or_else(|| ForemanError::UnknownPhase {
            id: phase_id.to_string(),
        })?;
    phase
        .task_mut(task_id)
        .ok_or_else(|| ForemanError::UnknownTask {
            id: task_id.to_string(),
        })
}
