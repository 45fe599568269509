//! Phase/task data model and persisted records.
//!
//! A **phase** is one GitOps unit (one branch, one eventual PR) holding an
//! ordered list of tasks. A **task** is one unit of dispatchable work with a
//! status, an assignee, and a dependency set that may cross phase boundaries.
//! Tasks and phases are never deleted, only transitioned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCategory, FailureKind};

/// Sentinel assignee for tasks that have not been handed to a worker.
pub const UNASSIGNED: &str = "UNASSIGNED";

/// Cap applied to persisted result/error text.
pub const RESULT_TEXT_CAP: usize = 4000;

/// Marker appended when persisted text was truncated.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Cap `text` to [`RESULT_TEXT_CAP`] characters, appending the truncation
/// marker when anything was cut. Only persisted records are bounded; surfaces
/// reporting an error at the moment of failure may show the full text.
#[must_use]
pub fn cap_text(text: &str) -> String {
    if text.chars().count() <= RESULT_TEXT_CAP {
        return text.to_string();
    }
    let capped: String = text.chars().take(RESULT_TEXT_CAP).collect();
    format!("{capped}{TRUNCATION_MARKER}")
}

// ============================================================================
// Task
// ============================================================================

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Not yet started.
    Todo,
    /// Currently dispatched to a worker.
    InProgress,
    /// Completed, side effects verified where required.
    Done,
    /// Worker failure or failed completion verification.
    Failed,
    /// Queued to repair a CI failure; selected ahead of TODO tasks.
    CiFix,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "TODO"),
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Done => write!(f, "DONE"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::CiFix => write!(f, "CI_FIX"),
        }
    }
}

/// One unit of dispatchable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the project.
    pub id: String,

    /// Short human-readable title.
    pub title: String,

    /// Full description handed to the worker prompt.
    pub description: String,

    /// Current status.
    pub status: TaskStatus,

    /// Worker id this task is (or was last) assigned to, or [`UNASSIGNED`].
    pub assignee: String,

    /// Ids of tasks that must be DONE first; may reference other phases.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Worker output stored on success, capped to [`RESULT_TEXT_CAP`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_context: Option<String>,

    /// Worker/stderr output stored on failure, capped to [`RESULT_TEXT_CAP`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_logs: Option<String>,

    /// Recovery category of the last failure, if classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,

    /// Adapter-level failure kind of the last failure, if classified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_failure_kind: Option<FailureKind>,

    /// Outcome of the most recent completion-side-effect verification.
    /// Overwritten on retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_verification: Option<CompletionVerification>,

    /// Append-only ledger of recovery attempts against this task.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_attempts: Vec<RecoveryAttemptRecord>,
}

impl Task {
    /// Create a new TODO task.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Todo,
            assignee: UNASSIGNED.to_string(),
            dependencies: Vec::new(),
            result_context: None,
            error_logs: None,
            error_category: None,
            adapter_failure_kind: None,
            completion_verification: None,
            recovery_attempts: Vec::new(),
        }
    }

    /// Whether the task currently has a concrete assignee.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        self.assignee != UNASSIGNED
    }

    /// Whether the task is in a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Done | TaskStatus::Failed)
    }

    /// Clear failure state (used by reset-to-todo).
    pub fn clear_failure(&mut self) {
        self.error_logs = None;
        self.error_category = None;
        self.adapter_failure_kind = None;
        self.completion_verification = None;
    }
}

// ============================================================================
// Phase
// ============================================================================

/// Status of a phase along its GitOps lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    /// Tasks are being authored.
    Planning,
    /// The working branch is being created.
    Branching,
    /// Tasks are being executed.
    Coding,
    /// The pull request is being opened.
    CreatingPr,
    /// Waiting on CI for the opened PR.
    AwaitingCi,
    /// CI reported a failure; CI_FIX tasks repair it.
    CiFailed,
    /// CI green, PR awaiting human review.
    ReadyForReview,
    /// Merged / finished.
    Done,
}

impl PhaseStatus {
    /// Whether this status accepts no further work.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Done)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PhaseStatus::Planning => "PLANNING",
            PhaseStatus::Branching => "BRANCHING",
            PhaseStatus::Coding => "CODING",
            PhaseStatus::CreatingPr => "CREATING_PR",
            PhaseStatus::AwaitingCi => "AWAITING_CI",
            PhaseStatus::CiFailed => "CI_FAILED",
            PhaseStatus::ReadyForReview => "READY_FOR_REVIEW",
            PhaseStatus::Done => "DONE",
        };
        write!(f, "{s}")
    }
}

/// What produced a CI_FAILED phase status.
///
/// Defined iff the phase status is [`PhaseStatus::CiFailed`]; cleared when
/// the phase leaves that status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiFailureKind {
    /// A local test runner reported the failure.
    LocalTester,
    /// The remote CI system reported the failure.
    RemoteCi,
    /// The worker itself failed while acting on CI.
    AgentFailure,
}

/// An ordered container of tasks representing one branch + PR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    /// Unique identifier within the project.
    pub id: String,

    /// Human-readable phase name.
    pub name: String,

    /// Git branch this phase works on.
    pub branch_name: String,

    /// Current lifecycle status.
    pub status: PhaseStatus,

    /// Ordered task list; list order is dispatch order.
    #[serde(default)]
    pub tasks: Vec<Task>,

    /// Pull-request URL once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,

    /// Most recent CI signal context (check name, conclusion, url).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_status_context: Option<String>,

    /// Present iff `status == CiFailed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<CiFailureKind>,

    /// Append-only ledger of recovery attempts against this phase.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recovery_attempts: Vec<RecoveryAttemptRecord>,
}

impl Phase {
    /// Create a new PLANNING phase.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        branch_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            branch_name: branch_name.into(),
            status: PhaseStatus::Planning,
            tasks: Vec::new(),
            pr_url: None,
            ci_status_context: None,
            failure_kind: None,
            recovery_attempts: Vec::new(),
        }
    }

    /// Find a task by id.
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Find a task by id, mutably.
    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    /// Set the phase status, keeping the failure-kind invariant: the kind is
    /// defined iff the status is CI_FAILED.
    pub fn transition(&mut self, status: PhaseStatus) {
        if status != PhaseStatus::CiFailed {
            self.failure_kind = None;
        }
        self.status = status;
    }
}

// ============================================================================
// Project
// ============================================================================

/// Root aggregate for one orchestrated project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectState {
    /// Project name; also names the run lock.
    pub project_name: String,

    /// Repository root the workers run in.
    pub root_dir: std::path::PathBuf,

    /// Phases in creation order.
    #[serde(default)]
    pub phases: Vec<Phase>,

    /// Explicitly selected phase; falls back to the first phase when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_phase_id: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last-write timestamp, bumped by the state machine on every mutation.
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    /// Create an empty project rooted at `root_dir`.
    #[must_use]
    pub fn new(project_name: impl Into<String>, root_dir: impl Into<std::path::PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            project_name: project_name.into(),
            root_dir: root_dir.into(),
            phases: Vec::new(),
            active_phase_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Find a phase by id.
    #[must_use]
    pub fn phase(&self, phase_id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Find a phase by id, mutably.
    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == phase_id)
    }

    /// Resolve the active phase: the explicit reference if set, else the
    /// first phase. Returns `None` when the project has no phases or the
    /// explicit reference is stale.
    #[must_use]
    pub fn active_phase(&self) -> Option<&Phase> {
        match &self.active_phase_id {
            Some(id) => self.phase(id),
            None => self.phases.first(),
        }
    }

    /// Look a task up by id across all phases (dependencies may cross phase
    /// boundaries). Returns the owning phase id alongside the task.
    #[must_use]
    pub fn find_task(&self, task_id: &str) -> Option<(&Phase, &Task)> {
        self.phases
            .iter()
            .find_map(|p| p.task(task_id).map(|t| (p, t)))
    }

    /// Record a mutation timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Recovery ledger
// ============================================================================

/// Outcome status of a single recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryResultStatus {
    /// The recovery engine believes the condition was fixed.
    Fixed,
    /// The recovery engine gave up.
    Unfixable,
}

/// Snapshot of the exception a recovery attempt responded to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryExceptionSnapshot {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_failure_kind: Option<FailureKind>,
}

/// What the recovery engine reported back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub status: RecoveryResultStatus,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions_taken: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_touched: Option<Vec<String>>,
}

/// One immutable entry in a task's or phase's recovery ledger.
///
/// This core only appends these records; it never computes fixes and never
/// mutates or removes an appended record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryAttemptRecord {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub attempt_number: u32,
    pub exception: RecoveryExceptionSnapshot,
    pub result: RecoveryResult,
}

// ============================================================================
// Completion verification
// ============================================================================

/// A side-effect contract a task's completion must satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractKind {
    /// The task claims to create a pull request.
    PrCreation,
    /// The task claims to push to the remote.
    RemotePush,
    /// The task claims to trigger a CI update.
    CiTriggeredUpdate,
}

impl std::fmt::Display for ContractKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractKind::PrCreation => write!(f, "PR_CREATION"),
            ContractKind::RemotePush => write!(f, "REMOTE_PUSH"),
            ContractKind::CiTriggeredUpdate => write!(f, "CI_TRIGGERED_UPDATE"),
        }
    }
}

/// Overall verification status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Passed,
    Failed,
}

/// One independent probe run during verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationProbe {
    pub name: String,
    pub success: bool,
    pub details: String,
}

/// Post-hoc proof that a task's claimed side effects actually occurred.
///
/// Computed once per task-run attempt and overwritten on retry. A FAILED
/// verification is authoritative over a successful process exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionVerification {
    pub checked_at: DateTime<Utc>,
    pub contracts: Vec<ContractKind>,
    pub status: VerificationStatus,
    pub probes: Vec<VerificationProbe>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_side_effects: Vec<String>,
}

impl CompletionVerification {
    /// Overall pass iff every probe succeeded.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.status == VerificationStatus::Passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cap_text_short_unchanged() {
        assert_eq!(cap_text("hello"), "hello");
    }

    #[test]
    fn test_cap_text_truncates_with_marker() {
        let long = "x".repeat(RESULT_TEXT_CAP + 100);
        let capped = cap_text(&long);
        assert!(capped.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            capped.chars().count(),
            RESULT_TEXT_CAP + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn test_cap_text_exact_boundary() {
        let exact = "y".repeat(RESULT_TEXT_CAP);
        assert_eq!(cap_text(&exact), exact);
    }

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("t1", "Add login", "Implement the login flow");
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.assignee, UNASSIGNED);
        assert!(!task.is_assigned());
        assert!(!task.is_terminal());
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_task_clear_failure() {
        let mut task = Task::new("t1", "T", "D");
        task.status = TaskStatus::Failed;
        task.error_logs = Some("boom".into());
        task.error_category = Some(ErrorCategory::AgentFailure);
        task.adapter_failure_kind = Some(FailureKind::Network);

        task.clear_failure();
        assert!(task.error_logs.is_none());
        assert!(task.error_category.is_none());
        assert!(task.adapter_failure_kind.is_none());
    }

    #[test]
    fn test_task_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::CiFix).unwrap(),
            "\"CI_FIX\""
        );
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"IN_PROGRESS\""
        );
        let status: TaskStatus = serde_json::from_str("\"TODO\"").unwrap();
        assert_eq!(status, TaskStatus::Todo);
    }

    #[test]
    fn test_phase_transition_clears_failure_kind() {
        let mut phase = Phase::new("p1", "Auth", "feature/auth");
        phase.status = PhaseStatus::CiFailed;
        phase.failure_kind = Some(CiFailureKind::RemoteCi);

        phase.transition(PhaseStatus::Coding);
        assert_eq!(phase.status, PhaseStatus::Coding);
        assert!(phase.failure_kind.is_none());
    }

    #[test]
    fn test_phase_transition_to_ci_failed_keeps_kind() {
        let mut phase = Phase::new("p1", "Auth", "feature/auth");
        phase.failure_kind = Some(CiFailureKind::LocalTester);
        phase.transition(PhaseStatus::CiFailed);
        assert_eq!(phase.failure_kind, Some(CiFailureKind::LocalTester));
    }

    #[test]
    fn test_phase_status_display() {
        assert_eq!(PhaseStatus::CreatingPr.to_string(), "CREATING_PR");
        assert_eq!(PhaseStatus::ReadyForReview.to_string(), "READY_FOR_REVIEW");
    }

    #[test]
    fn test_project_active_phase_fallback() {
        let mut project = ProjectState::new("demo", "/repo");
        assert!(project.active_phase().is_none());

        project.phases.push(Phase::new("p1", "First", "feature/one"));
        project.phases.push(Phase::new("p2", "Second", "feature/two"));
        assert_eq!(project.active_phase().unwrap().id, "p1");

        project.active_phase_id = Some("p2".into());
        assert_eq!(project.active_phase().unwrap().id, "p2");
    }

    #[test]
    fn test_project_active_phase_stale_reference() {
        let mut project = ProjectState::new("demo", "/repo");
        project.phases.push(Phase::new("p1", "First", "feature/one"));
        project.active_phase_id = Some("gone".into());
        assert!(project.active_phase().is_none());
    }

    #[test]
    fn test_find_task_across_phases() {
        let mut project = ProjectState::new("demo", "/repo");
        let mut p1 = Phase::new("p1", "First", "feature/one");
        p1.tasks.push(Task::new("t1", "A", "a"));
        let mut p2 = Phase::new("p2", "Second", "feature/two");
        p2.tasks.push(Task::new("t2", "B", "b"));
        project.phases.push(p1);
        project.phases.push(p2);

        let (phase, task) = project.find_task("t2").unwrap();
        assert_eq!(phase.id, "p2");
        assert_eq!(task.id, "t2");
        assert!(project.find_task("t9").is_none());
    }

    #[test]
    fn test_contract_kind_display() {
        assert_eq!(ContractKind::PrCreation.to_string(), "PR_CREATION");
        assert_eq!(
            ContractKind::CiTriggeredUpdate.to_string(),
            "CI_TRIGGERED_UPDATE"
        );
    }

    #[test]
    fn test_project_state_roundtrip() {
        let mut project = ProjectState::new("demo", "/repo");
        let mut phase = Phase::new("p1", "Auth", "feature/auth");
        let mut task = Task::new("t1", "Create PR", "Open the PR");
        task.dependencies.push("t0".into());
        phase.tasks.push(task);
        phase.pr_url = Some("https://github.com/acme/demo/pull/7".into());
        project.phases.push(phase);

        let json = serde_json::to_string_pretty(&project).unwrap();
        let decoded: ProjectState = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.project_name, "demo");
        assert_eq!(decoded.phases.len(), 1);
        assert_eq!(decoded.phases[0].tasks[0].dependencies, vec!["t0"]);
        assert_eq!(
            decoded.phases[0].pr_url.as_deref(),
            Some("https://github.com/acme/demo/pull/7")
        );
    }
}
