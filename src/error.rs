//! Custom error types for Foreman.
//!
//! This module provides structured error types that separate recoverable
//! execution failures (routed to the external recovery engine) from
//! preflight conditions that require manual operator action.

use std::path::PathBuf;
use thiserror::Error;

/// Category attached to recoverable errors.
///
/// Only errors carrying one of these categories may be handed to the
/// external recovery engine; everything else is surfaced directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// The working tree has uncommitted changes where a clean tree was required.
    DirtyWorktree,
    /// An expected commit is missing from the branch.
    MissingCommit,
    /// A worker CLI invocation failed.
    AgentFailure,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::DirtyWorktree => write!(f, "DIRTY_WORKTREE"),
            ErrorCategory::MissingCommit => write!(f, "MISSING_COMMIT"),
            ErrorCategory::AgentFailure => write!(f, "AGENT_FAILURE"),
        }
    }
}

/// Classified cause of a worker-process failure.
///
/// Derived heuristically from the exit condition and stderr text of the
/// worker CLI; persisted on the task alongside the error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Authentication or authorization rejected by the worker's backend.
    Auth,
    /// Network-level failure (DNS, connection refused, unreachable).
    Network,
    /// The worker binary was not found on PATH.
    MissingBinary,
    /// The process exceeded its execution timeout and was killed.
    Timeout,
    /// Anything that could not be classified.
    Unknown,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Auth => write!(f, "auth"),
            FailureKind::Network => write!(f, "network"),
            FailureKind::MissingBinary => write!(f, "missing-binary"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Main error type for Foreman operations
#[derive(Error, Debug)]
pub enum ForemanError {
    // =========================================================================
    // Input validation (caller error, never retried)
    // =========================================================================
    /// A required text field was empty
    #[error("Validation error: {field} must not be empty")]
    EmptyField { field: String },

    /// Unknown phase id
    #[error("Unknown phase: {id}")]
    UnknownPhase { id: String },

    /// Unknown task id
    #[error("Unknown task: {id}")]
    UnknownTask { id: String },

    /// A task references a dependency id that does not exist in any phase
    #[error("Unknown dependency: {id}")]
    UnknownDependency { id: String },

    /// A dependency has not reached DONE
    #[error("Task has incomplete dependency: {dependency_id} (status: {status})")]
    IncompleteDependency {
        dependency_id: String,
        status: String,
    },

    /// A FAILED task was retried with a different assignee
    #[error("FAILED task must be retried with the same assignee (was {previous}, got {requested})")]
    RetryAssigneeMismatch { previous: String, requested: String },

    // =========================================================================
    // Supervisor errors
    // =========================================================================
    /// Spawn attempted without the approved-adapter capability flag
    #[error("raw agent command execution is blocked: {detail}")]
    SpawnBlocked { detail: String },

    /// No agent record exists for the given id
    #[error("Unknown agent: {id}")]
    UnknownAgent { id: String },

    /// A worker process failed, with classified cause
    #[error("Worker process failed ({kind}): {message}")]
    WorkerFailed {
        kind: FailureKind,
        message: String,
        exit_code: Option<i32>,
    },

    // =========================================================================
    // Recoverable execution errors (routed to the recovery engine)
    // =========================================================================
    /// The working tree was dirty where a clean tree was required
    #[error("Dirty worktree: {message}")]
    DirtyWorktree { message: String },

    /// An expected commit is missing
    #[error("Missing commit: {message}")]
    MissingCommit { message: String },

    /// A worker CLI failed in a way the recovery engine may fix
    #[error("Agent failure: {message}")]
    AgentFailure {
        message: String,
        kind: Option<FailureKind>,
    },

    // =========================================================================
    // Non-recoverable preflight conditions (manual operator action)
    // =========================================================================
    /// The phase is in a terminal status and cannot accept work
    #[error("Phase '{phase_id}' is in terminal status {status} and cannot accept work")]
    TerminalPhaseStatus { phase_id: String, status: String },

    /// The phase has no branch name configured
    #[error("Phase '{phase_id}' has an empty branch name")]
    EmptyBranchName { phase_id: String },

    /// The active-phase reference points at a phase that no longer resolves
    #[error("Active phase reference '{reference}' does not resolve to any phase")]
    StalePhaseReference { reference: String },

    // =========================================================================
    // Execution loop errors
    // =========================================================================
    /// The auto-mode loop is already running
    #[error("Auto mode is already running for project '{project}'")]
    AlreadyRunning { project: String },

    /// The run lock is held by another process
    #[error("Run lock for '{project}' is held by {owner}")]
    LockHeld { project: String, owner: String },

    /// A stopped task failed to settle within the poll window
    #[error("Task '{task_id}' did not settle within {attempts} poll attempts")]
    StopSettleTimeout { task_id: String, attempts: u32 },

    // =========================================================================
    // Storage errors
    // =========================================================================
    /// The project state document does not exist
    #[error("Project state not found at {path}")]
    StateNotFound { path: PathBuf },

    /// The project state document could not be decoded
    #[error("Project state at {path} is not valid: {message}")]
    StateInvalid { path: PathBuf, message: String },

    // =========================================================================
    // Wrapped errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForemanError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a spawn-blocked error
    pub fn spawn_blocked(detail: impl Into<String>) -> Self {
        Self::SpawnBlocked {
            detail: detail.into(),
        }
    }

    /// Create an agent-failure error
    pub fn agent_failure(message: impl Into<String>) -> Self {
        Self::AgentFailure {
            message: message.into(),
            kind: None,
        }
    }

    /// Create an agent-failure error with a classified kind
    pub fn agent_failure_with_kind(message: impl Into<String>, kind: FailureKind) -> Self {
        Self::AgentFailure {
            message: message.into(),
            kind: Some(kind),
        }
    }

    /// Create a dirty-worktree error
    pub fn dirty_worktree(message: impl Into<String>) -> Self {
        Self::DirtyWorktree {
            message: message.into(),
        }
    }

    /// Create a missing-commit error
    pub fn missing_commit(message: impl Into<String>) -> Self {
        Self::MissingCommit {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// The recovery category of this error, if it is routable to recovery.
    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            Self::DirtyWorktree { .. } => Some(ErrorCategory::DirtyWorktree),
            Self::MissingCommit { .. } => Some(ErrorCategory::MissingCommit),
            Self::AgentFailure { .. } | Self::WorkerFailed { .. } => {
                Some(ErrorCategory::AgentFailure)
            }
            _ => None,
        }
    }

    /// Check if this error may be routed to the external recovery engine
    pub fn is_recoverable(&self) -> bool {
        self.category().is_some()
    }

    /// Check if this error is a preflight condition requiring operator action
    pub fn requires_operator(&self) -> bool {
        matches!(
            self,
            Self::TerminalPhaseStatus { .. }
                | Self::EmptyBranchName { .. }
                | Self::StalePhaseReference { .. }
        )
    }

    /// Check if this error is a caller/programmer error that must not be retried
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyField { .. }
                | Self::UnknownPhase { .. }
                | Self::UnknownTask { .. }
                | Self::UnknownDependency { .. }
                | Self::IncompleteDependency { .. }
                | Self::RetryAssigneeMismatch { .. }
        )
    }

    /// The classified worker failure kind, if any
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::WorkerFailed { kind, .. } => Some(*kind),
            Self::AgentFailure { kind, .. } => *kind,
            _ => None,
        }
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::SpawnBlocked { .. } => 2,
            Self::AlreadyRunning { .. } | Self::LockHeld { .. } => 3,
            Self::TerminalPhaseStatus { .. }
            | Self::EmptyBranchName { .. }
            | Self::StalePhaseReference { .. } => 4,
            Self::StateNotFound { .. } | Self::StateInvalid { .. } => 6,
            e if e.is_validation() => 7,
            _ => 1,
        }
    }
}

/// Type alias for Foreman results
pub type Result<T> = std::result::Result<T, ForemanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ForemanError::IncompleteDependency {
            dependency_id: "task-7".into(),
            status: "TODO".into(),
        };
        assert!(err.to_string().contains("Task has incomplete dependency"));
        assert!(err.to_string().contains("task-7"));
    }

    #[test]
    fn test_spawn_blocked_message() {
        let err = ForemanError::spawn_blocked("missing approval flag");
        assert!(err
            .to_string()
            .contains("raw agent command execution is blocked"));
    }

    #[test]
    fn test_retry_assignee_message() {
        let err = ForemanError::RetryAssigneeMismatch {
            previous: "CODEX_CLI".into(),
            requested: "CLAUDE_CLI".into(),
        };
        assert!(err
            .to_string()
            .contains("FAILED task must be retried with the same assignee"));
    }

    #[test]
    fn test_category_routing() {
        assert_eq!(
            ForemanError::dirty_worktree("x").category(),
            Some(ErrorCategory::DirtyWorktree)
        );
        assert_eq!(
            ForemanError::missing_commit("x").category(),
            Some(ErrorCategory::MissingCommit)
        );
        assert_eq!(
            ForemanError::agent_failure("x").category(),
            Some(ErrorCategory::AgentFailure)
        );
        assert_eq!(
            ForemanError::TerminalPhaseStatus {
                phase_id: "p1".into(),
                status: "DONE".into(),
            }
            .category(),
            None
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(ForemanError::agent_failure("x").is_recoverable());
        assert!(!ForemanError::EmptyBranchName {
            phase_id: "p1".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_requires_operator() {
        assert!(ForemanError::StalePhaseReference {
            reference: "p9".into()
        }
        .requires_operator());
        assert!(ForemanError::EmptyBranchName {
            phase_id: "p1".into()
        }
        .requires_operator());
        assert!(!ForemanError::agent_failure("x").requires_operator());
    }

    #[test]
    fn test_is_validation() {
        assert!(ForemanError::EmptyField {
            field: "title".into()
        }
        .is_validation());
        assert!(ForemanError::UnknownTask { id: "t1".into() }.is_validation());
        assert!(!ForemanError::agent_failure("x").is_validation());
    }

    #[test]
    fn test_failure_kind() {
        let err = ForemanError::WorkerFailed {
            kind: FailureKind::Timeout,
            message: "killed after 30s".into(),
            exit_code: None,
        };
        assert_eq!(err.failure_kind(), Some(FailureKind::Timeout));
        assert_eq!(err.category(), Some(ErrorCategory::AgentFailure));
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::MissingBinary.to_string(), "missing-binary");
        assert_eq!(FailureKind::Auth.to_string(), "auth");
        assert_eq!(FailureKind::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ForemanError::spawn_blocked("x").exit_code(), 2);
        assert_eq!(
            ForemanError::AlreadyRunning {
                project: "p".into()
            }
            .exit_code(),
            3
        );
        assert_eq!(
            ForemanError::EmptyField {
                field: "name".into()
            }
            .exit_code(),
            7
        );
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&ErrorCategory::DirtyWorktree).unwrap();
        assert_eq!(json, "\"DIRTY_WORKTREE\"");
        let kind: FailureKind = serde_json::from_str("\"missing-binary\"").unwrap();
        assert_eq!(kind, FailureKind::MissingBinary);
    }
}
