//! Foreman - autonomous coding-agent orchestration.
//!
//! Foreman drives external coding-agent CLIs against a Git/CI-backed
//! project: work is decomposed into phases and tasks, tasks are dispatched
//! to supervised worker processes, claimed side effects (pull requests,
//! pushes, CI signals) are verified after the fact, and an unattended loop
//! runs the whole thing until work is exhausted or a failure halts it.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`supervisor`] - Worker-process supervision: liveness diagnostics,
//!   output capture, crash-safe cross-process registry
//! - [`engine`] - Phase/task state machine: dependencies, retries,
//!   completion verification, recovery ledger
//! - [`autopilot`] - Unattended execution loop under an exclusive run lock
//! - [`dispatch`] - Collaborator seams (worker dispatcher, git probes,
//!   repository reset)
//! - [`store`] - Whole-document project-state storage (file or memory)
//! - [`lock`] - Cross-process run lock
//! - [`config`] - Settings loading
//! - [`error`] - Error taxonomy and classification
//! - [`testing`] - Mock collaborators for tests

pub mod autopilot;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod lock;
pub mod store;
pub mod supervisor;
pub mod testing;

// Re-export commonly used types
pub use error::{ErrorCategory, FailureKind, ForemanError, Result};

// Re-export config types
pub use config::ForemanConfig;

// Re-export the data model
pub use engine::model::{
    CiFailureKind, CompletionVerification, ContractKind, Phase, PhaseStatus, ProjectState,
    RecoveryAttemptRecord, Task, TaskStatus, VerificationStatus, UNASSIGNED,
};
pub use engine::{TaskEngine, TaskUpdate};

// Re-export supervisor types
pub use supervisor::events::{AgentEvent, EventContext, OutputStream, RunOutcome};
pub use supervisor::record::{AgentStatus, AgentView};
pub use supervisor::{
    AgentFailureHook, AgentSupervisor, CompletedRun, StartAgentInput, SupervisorConfig,
};

// Re-export loop and lock types
pub use autopilot::{AutoStatus, Autopilot, AutopilotConfig};
pub use lock::{RunLock, RunLockInfo};

// Re-export collaborator seams
pub use dispatch::{DispatchRequest, GitProbe, RepoReset, WorkerCommand, WorkerDispatcher};
pub use store::{FileProjectStore, MemoryProjectStore, ProjectStore};
