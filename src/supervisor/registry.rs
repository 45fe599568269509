//! File-backed agent registry shared across processes.
//!
//! The registry is a JSON array of agent views. Writers never clobber each
//! other: a flush re-reads the current on-disk set and merges by id before
//! writing, and the write itself goes to a sibling temporary path that is
//! renamed over the target. Readers tolerate and silently drop malformed
//! entries rather than failing the whole load, so one corrupt record cannot
//! take down every supervisor sharing the file.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;
use uuid::Uuid;

use super::record::AgentView;
use crate::error::Result;

/// Default registry file name.
const REGISTRY_FILE: &str = "agents.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix serializing cross-process flushes.
const LOCK_SUFFIX: &str = ".lock";

/// File-backed registry of agent records.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    dir: PathBuf,
}

impl AgentRegistry {
    /// Create a registry rooted at `dir` (usually `<project>/.foreman`).
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the path to the registry file.
    #[must_use]
    pub fn registry_file_path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    fn tmp_file_path(&self) -> PathBuf {
        self.dir.join(format!("{REGISTRY_FILE}{TMP_SUFFIX}"))
    }

    fn lock_file_path(&self) -> PathBuf {
        self.dir.join(format!("{REGISTRY_FILE}{LOCK_SUFFIX}"))
    }

    /// Load the persisted agent set, dropping entries that fail to decode.
    pub fn load(&self) -> Result<Vec<AgentView>> {
        let path = self.registry_file_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path)?;
        let raw: serde_json::Value = match serde_json::from_str(&contents) {
            Ok(v) => v,
            Err(e) => {
                warn!("Agent registry at {} is unreadable: {}", path.display(), e);
                return Ok(Vec::new());
            }
        };

        let Some(entries) = raw.as_array() else {
            warn!("Agent registry at {} is not an array", path.display());
            return Ok(Vec::new());
        };

        let mut views = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<AgentView>(entry.clone()) {
                Ok(view) => views.push(view),
                Err(e) => warn!("Dropping malformed agent registry entry: {}", e),
            }
        }
        Ok(views)
    }

    /// Persist `views`, merging with the current on-disk set by id.
    ///
    /// The supplied views win over their on-disk counterparts; on-disk
    /// records with unknown ids are preserved, so flushes from different
    /// supervisor instances never clobber each other.
    pub fn merge_write(&self, views: &[AgentView]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file)?;

        let result = self.merge_write_locked(views);

        FileExt::unlock(&lock_file)?;
        result
    }

    fn merge_write_locked(&self, views: &[AgentView]) -> Result<()> {
        let existing = self.load()?;
        let ours: HashMap<Uuid, &AgentView> = views.iter().map(|v| (v.id, v)).collect();

        // Keep on-disk order for known ids, replacing with our copy; append
        // ids the disk has not seen yet in the order given.
        let mut merged: Vec<AgentView> = Vec::with_capacity(existing.len() + views.len());
        let mut seen: HashSet<Uuid> = HashSet::new();
        for disk in existing {
            let view = ours.get(&disk.id).map(|v| (*v).clone()).unwrap_or(disk);
            seen.insert(view.id);
            merged.push(view);
        }
        for view in views {
            if !seen.contains(&view.id) {
                merged.push(view.clone());
            }
        }

        let json = serde_json::to_string_pretty(&merged)?;
        let tmp_path = self.tmp_file_path();
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, self.registry_file_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::record::{AgentRecord, AgentStatus};
    use tempfile::TempDir;

    fn registry() -> (AgentRegistry, TempDir) {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let registry = AgentRegistry::new(temp.path().join(".foreman"));
        (registry, temp)
    }

    fn view(name: &str) -> AgentView {
        AgentRecord::new(name, "claude", vec!["-p".into()], "/repo").view
    }

    #[test]
    fn test_load_missing_is_empty() {
        let (registry, _temp) = registry();
        assert!(registry.load().unwrap().is_empty());
    }

    #[test]
    fn test_merge_write_and_load_roundtrip() {
        let (registry, _temp) = registry();
        let a = view("a");
        registry.merge_write(&[a.clone()]).unwrap();

        let loaded = registry.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, a.id);
        assert_eq!(loaded[0].name, "a");
    }

    #[test]
    fn test_merge_preserves_foreign_ids() {
        let (registry, _temp) = registry();
        let ours = view("ours");
        let theirs = view("theirs");

        // Another supervisor instance flushed first.
        registry.merge_write(&[theirs.clone()]).unwrap();
        registry.merge_write(&[ours.clone()]).unwrap();

        let loaded = registry.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|v| v.id == theirs.id));
        assert!(loaded.iter().any(|v| v.id == ours.id));
    }

    #[test]
    fn test_merge_in_flight_copy_wins() {
        let (registry, _temp) = registry();
        let mut record = AgentRecord::new("w", "claude", vec![], "/repo");
        registry.merge_write(&[record.view.clone()]).unwrap();

        record.mark_stopped(Some(0));
        registry.merge_write(&[record.view.clone()]).unwrap();

        let loaded = registry.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, AgentStatus::Stopped);
        assert_eq!(loaded[0].last_exit_code, Some(0));
    }

    #[test]
    fn test_malformed_entries_dropped_not_fatal() {
        let (registry, _temp) = registry();
        let good = view("good");
        registry.merge_write(&[good.clone()]).unwrap();

        // Append garbage alongside the good entry.
        let path = registry.registry_file_path();
        let mut entries: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        entries.push(serde_json::json!({"id": "not-a-uuid", "status": 42}));
        fs::write(&path, serde_json::to_string(&entries).unwrap()).unwrap();

        let loaded = registry.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, good.id);
    }

    #[test]
    fn test_unreadable_file_is_empty_not_fatal() {
        let (registry, _temp) = registry();
        fs::create_dir_all(&registry.dir).unwrap();
        fs::write(registry.registry_file_path(), "not json at all").unwrap();
        assert!(registry.load().unwrap().is_empty());
    }

    #[test]
    fn test_flush_idempotent_byte_identical() {
        let (registry, _temp) = registry();
        let views = vec![view("a"), view("b")];
        registry.merge_write(&views).unwrap();
        let first = fs::read(registry.registry_file_path()).unwrap();

        registry.merge_write(&views).unwrap();
        let second = fs::read(registry.registry_file_path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let (registry, _temp) = registry();
        registry.merge_write(&[view("a")]).unwrap();
        assert!(!registry.tmp_file_path().exists());
    }

    #[test]
    fn test_two_registries_same_file_round_trip() {
        let (registry, _temp) = registry();
        let peer = AgentRegistry::new(&registry.dir);

        let mut record = AgentRecord::new("w", "claude", vec![], "/repo");
        record.assign(Some("p1".into()), Some("t1".into()));
        registry.merge_write(&[record.view.clone()]).unwrap();

        let seen = peer.load().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].task_id.as_deref(), Some("t1"));
        assert_eq!(seen[0].status, record.view.status);
    }
}
