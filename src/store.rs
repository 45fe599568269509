//! Project-state storage with atomic whole-document replace.
//!
//! The state machine never patches the project document in place; it reads
//! the whole document, mutates it in memory, and writes the whole document
//! back. Two backings exist behind one interface: a file store for real use
//! (atomic write-temp-then-rename under an advisory lock, shareable across
//! processes) and an in-memory store for tests.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use tracing::warn;

use crate::engine::model::ProjectState;
use crate::error::{ForemanError, Result};

/// Default project state file name.
const STATE_FILE: &str = "project.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Whole-document project-state storage.
pub trait ProjectStore: Send + Sync {
    /// Read the current project state. Fails distinctly when absent.
    fn read(&self) -> Result<ProjectState>;

    /// Replace the stored project state with `state`, returning it.
    fn write(&self, state: ProjectState) -> Result<ProjectState>;

    /// Whether a state document exists.
    fn exists(&self) -> bool;
}

// ============================================================================
// File backing
// ============================================================================

/// File-backed project store under `<dir>/project.json`.
#[derive(Debug, Clone)]
pub struct FileProjectStore {
    dir: PathBuf,
}

impl FileProjectStore {
    /// Create a store rooted at `dir` (usually `<project>/.foreman`).
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the path to the state file.
    #[must_use]
    pub fn state_file_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    fn tmp_file_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{TMP_SUFFIX}"))
    }

    fn lock_file_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{LOCK_SUFFIX}"))
    }
}

impl ProjectStore for FileProjectStore {
    fn read(&self) -> Result<ProjectState> {
        let path = self.state_file_path();
        if !path.exists() {
            return Err(ForemanError::StateNotFound { path });
        }

        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(|e| {
            warn!("Project state at {} failed to decode: {}", path.display(), e);
            ForemanError::StateInvalid {
                path,
                message: e.to_string(),
            }
        })
    }

    fn write(&self, mut state: ProjectState) -> Result<ProjectState> {
        fs::create_dir_all(&self.dir)?;

        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file)?;

        state.touch();
        let json = serde_json::to_string_pretty(&state)?;

        let tmp_path = self.tmp_file_path();
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.state_file_path())?;

        FileExt::unlock(&lock_file)?;
        Ok(state)
    }

    fn exists(&self) -> bool {
        self.state_file_path().exists()
    }
}

// ============================================================================
// Memory backing
// ============================================================================

/// In-memory project store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    state: Mutex<Option<ProjectState>>,
}

impl MemoryProjectStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with `state`.
    #[must_use]
    pub fn seeded(state: ProjectState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

impl ProjectStore for MemoryProjectStore {
    fn read(&self) -> Result<ProjectState> {
        self.state
            .lock()
            .expect("state lock poisoned")
            .clone()
            .ok_or(ForemanError::StateNotFound {
                path: PathBuf::from("<memory>"),
            })
    }

    fn write(&self, mut state: ProjectState) -> Result<ProjectState> {
        state.touch();
        *self.state.lock().expect("state lock poisoned") = Some(state.clone());
        Ok(state)
    }

    fn exists(&self) -> bool {
        self.state.lock().expect("state lock poisoned").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::Phase;
    use tempfile::TempDir;

    fn test_store() -> (FileProjectStore, TempDir) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let store = FileProjectStore::new(temp.path().join(".foreman"));
        (store, temp)
    }

    #[test]
    fn test_read_missing_is_distinct_error() {
        let (store, _temp) = test_store();
        let err = store.read().unwrap_err();
        assert!(matches!(err, ForemanError::StateNotFound { .. }));
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let (store, _temp) = test_store();
        let mut state = ProjectState::new("demo", "/repo");
        state.phases.push(Phase::new("p1", "Auth", "feature/auth"));

        store.write(state).expect("write should succeed");
        let loaded = store.read().expect("read should succeed");
        assert_eq!(loaded.project_name, "demo");
        assert_eq!(loaded.phases.len(), 1);
    }

    #[test]
    fn test_write_bumps_updated_at() {
        let (store, _temp) = test_store();
        let state = ProjectState::new("demo", "/repo");
        let created = state.created_at;

        let written = store.write(state).expect("write");
        assert!(written.updated_at >= created);
    }

    #[test]
    fn test_write_is_atomic_no_tmp_left_behind() {
        let (store, _temp) = test_store();
        store
            .write(ProjectState::new("demo", "/repo"))
            .expect("write");
        assert!(!store.tmp_file_path().exists());
        assert!(store.state_file_path().exists());
    }

    #[test]
    fn test_corrupted_state_is_invalid_not_panic() {
        let (store, _temp) = test_store();
        fs::create_dir_all(&store.dir).unwrap();
        fs::write(store.state_file_path(), "not json {{{").unwrap();

        let err = store.read().unwrap_err();
        assert!(matches!(err, ForemanError::StateInvalid { .. }));
    }

    #[test]
    fn test_whole_document_replace() {
        let (store, _temp) = test_store();
        let mut first = ProjectState::new("demo", "/repo");
        first.phases.push(Phase::new("p1", "One", "feature/one"));
        store.write(first).expect("write");

        // A second write fully replaces the document, including removals.
        let second = ProjectState::new("demo", "/repo");
        store.write(second).expect("write");
        let loaded = store.read().expect("read");
        assert!(loaded.phases.is_empty());
    }

    #[test]
    fn test_exists() {
        let (store, _temp) = test_store();
        assert!(!store.exists());
        store
            .write(ProjectState::new("demo", "/repo"))
            .expect("write");
        assert!(store.exists());
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryProjectStore::new();
        assert!(!store.exists());
        assert!(matches!(
            store.read().unwrap_err(),
            ForemanError::StateNotFound { .. }
        ));

        store.write(ProjectState::new("demo", "/repo")).unwrap();
        assert!(store.exists());
        assert_eq!(store.read().unwrap().project_name, "demo");
    }

    #[test]
    fn test_two_stores_same_dir_share_state() {
        let (store, _temp) = test_store();
        let peer = FileProjectStore::new(&store.dir);

        let mut state = ProjectState::new("demo", "/repo");
        state.phases.push(Phase::new("p1", "One", "feature/one"));
        store.write(state).expect("write");

        let seen = peer.read().expect("peer read");
        assert_eq!(seen.phases.len(), 1);
    }
}
