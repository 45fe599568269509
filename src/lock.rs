//! Exclusive run lock for auto-mode execution.
//!
//! At most one execution loop may drive a given project system-wide. The
//! lock is a JSON file at a path derived from (project root, project name),
//! holding the owner tag, owning pid, and acquisition time. Acquisition is
//! serialized through an fs2 advisory lock so two processes racing for the
//! same project cannot both win.
//!
//! Staleness policy: a lock whose recorded pid is no longer alive on this
//! host is treated as stale and taken over. There is no TTL; a lock from
//! another host never expires automatically and must be cleared manually.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ForemanError, Result};
use crate::supervisor::runner::pid_alive;

/// On-disk contents of a run lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLockInfo {
    /// Owner tag supplied at acquisition (e.g. "foreman-cli").
    pub owner: String,
    /// Pid of the owning process, used for staleness detection.
    pub pid: u32,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
}

/// An acquired, exclusive run lock. Release it on every loop exit path.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    owner: String,
}

impl RunLock {
    /// Deterministic lock path for (root_dir, project_name).
    #[must_use]
    pub fn path_for(root_dir: &Path, project_name: &str) -> PathBuf {
        root_dir
            .join(".foreman")
            .join(format!("run-{project_name}.lock.json"))
    }

    /// Acquire the run lock for a project, failing if a live lock with a
    /// different owner exists.
    pub fn acquire(root_dir: &Path, project_name: &str, owner: &str) -> Result<Self> {
        let path = Self::path_for(root_dir, project_name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Serialize acquisition attempts across processes.
        let guard_path = path.with_extension("guard");
        let guard = File::create(&guard_path)?;
        FileExt::lock_exclusive(&guard)?;

        let result = Self::acquire_locked(&path, project_name, owner);

        FileExt::unlock(&guard)?;
        result
    }

    fn acquire_locked(path: &Path, project_name: &str, owner: &str) -> Result<Self> {
        if let Some(existing) = Self::read_info(path)? {
            if existing.owner != owner {
                if pid_alive(existing.pid) {
                    return Err(ForemanError::LockHeld {
                        project: project_name.to_string(),
                        owner: existing.owner,
                    });
                }
                warn!(
                    "Taking over stale run lock for '{}' (dead pid {} owned by {})",
                    project_name, existing.pid, existing.owner
                );
            }
        }

        let info = RunLockInfo {
            owner: owner.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        let tmp_path = path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(serde_json::to_string_pretty(&info)?.as_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, path)?;

        debug!("Acquired run lock at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            owner: owner.to_string(),
        })
    }

    /// Read the current holder, if any. Malformed lock files are reported as
    /// absent (and will be overwritten by the next acquisition).
    pub fn holder(root_dir: &Path, project_name: &str) -> Result<Option<RunLockInfo>> {
        Self::read_info(&Self::path_for(root_dir, project_name))
    }

    fn read_info(path: &Path) -> Result<Option<RunLockInfo>> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(path)?;
        match serde_json::from_str(&contents) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!("Malformed run lock at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Release the lock. A lock file that has since been taken over by a
    /// different owner is left untouched.
    pub fn release(self) -> Result<()> {
        match Self::read_info(&self.path)? {
            Some(info) if info.owner == self.owner => {
                fs::remove_file(&self.path)?;
                debug!("Released run lock at {}", self.path.display());
            }
            Some(info) => {
                warn!(
                    "Run lock at {} now owned by {}; not releasing",
                    self.path.display(),
                    info.owner
                );
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_writes_lock_file() {
        let temp = TempDir::new().unwrap();
        let lock = RunLock::acquire(temp.path(), "demo", "tester").unwrap();

        let info = RunLock::holder(temp.path(), "demo").unwrap().unwrap();
        assert_eq!(info.owner, "tester");
        assert_eq!(info.pid, std::process::id());

        lock.release().unwrap();
        assert!(RunLock::holder(temp.path(), "demo").unwrap().is_none());
    }

    #[test]
    fn test_second_owner_rejected_while_live() {
        let temp = TempDir::new().unwrap();
        let _lock = RunLock::acquire(temp.path(), "demo", "first").unwrap();

        // The first lock records this (live) process's pid, so a different
        // owner must be refused.
        let err = RunLock::acquire(temp.path(), "demo", "second").unwrap_err();
        assert!(matches!(err, ForemanError::LockHeld { .. }));
        assert!(err.to_string().contains("first"));
    }

    #[test]
    fn test_same_owner_reacquires() {
        let temp = TempDir::new().unwrap();
        let _first = RunLock::acquire(temp.path(), "demo", "cli").unwrap();
        let second = RunLock::acquire(temp.path(), "demo", "cli");
        assert!(second.is_ok());
    }

    #[test]
    fn test_stale_lock_taken_over() {
        let temp = TempDir::new().unwrap();
        let path = RunLock::path_for(temp.path(), "demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();

        // Plant a lock owned by a pid that cannot be alive.
        let stale = RunLockInfo {
            owner: "ghost".into(),
            pid: u32::MAX - 1,
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = RunLock::acquire(temp.path(), "demo", "fresh").unwrap();
        let info = RunLock::holder(temp.path(), "demo").unwrap().unwrap();
        assert_eq!(info.owner, "fresh");
        lock.release().unwrap();
    }

    #[test]
    fn test_malformed_lock_treated_as_absent() {
        let temp = TempDir::new().unwrap();
        let path = RunLock::path_for(temp.path(), "demo");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{{{ not json").unwrap();

        assert!(RunLock::holder(temp.path(), "demo").unwrap().is_none());
        assert!(RunLock::acquire(temp.path(), "demo", "cli").is_ok());
    }

    #[test]
    fn test_release_respects_takeover() {
        let temp = TempDir::new().unwrap();
        let lock = RunLock::acquire(temp.path(), "demo", "old").unwrap();

        // Simulate a takeover by another owner while we still hold the guard.
        let path = RunLock::path_for(temp.path(), "demo");
        let info = RunLockInfo {
            owner: "new".into(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        fs::write(&path, serde_json::to_string(&info).unwrap()).unwrap();

        lock.release().unwrap();
        let holder = RunLock::holder(temp.path(), "demo").unwrap().unwrap();
        assert_eq!(holder.owner, "new");
    }

    #[test]
    fn test_path_for_is_deterministic() {
        let a = RunLock::path_for(Path::new("/repo"), "demo");
        let b = RunLock::path_for(Path::new("/repo"), "demo");
        assert_eq!(a, b);
        assert!(a.ends_with(".foreman/run-demo.lock.json"));
    }
}
