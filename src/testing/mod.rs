//! Testing infrastructure: mock collaborators.
//!
//! These mocks substitute the process runner, worker dispatcher, git probes,
//! and repository reset so the supervisor, state machine, and execution loop
//! can be exercised without real subprocesses or repositories. They are
//! compiled into the library so integration tests under `tests/` can reuse
//! them.

pub mod mocks;

pub use mocks::{
    MockDispatcher, MockGitProbe, MockProcessRunner, MockRepoReset, MockScript,
};
