//! Configuration management for Foreman.
//!
//! Settings live in `.foreman/settings.json` under the project directory.
//! A missing file yields the defaults; an unreadable or invalid file is an
//! error rather than a silent fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::autopilot::AutopilotConfig;
use crate::dispatch::{default_worker_commands, WorkerCommand};
use crate::error::Result;
use crate::supervisor::SupervisorConfig;

/// Directory under the project root holding all Foreman state.
pub const STATE_DIR: &str = ".foreman";

/// Top-level configuration loaded from `.foreman/settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Supervisor liveness-timer settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Execution-loop pacing and defaults.
    #[serde(default)]
    pub autopilot: AutopilotConfig,

    /// Assignee id to concrete worker-CLI invocation.
    #[serde(default = "default_worker_commands")]
    pub workers: HashMap<String, WorkerCommand>,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            autopilot: AutopilotConfig::default(),
            workers: default_worker_commands(),
        }
    }
}

impl ForemanConfig {
    /// Load configuration for a project, falling back to defaults when the
    /// settings file does not exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let settings_path = Self::settings_path(project_dir);

        if settings_path.exists() {
            let content = std::fs::read_to_string(&settings_path)?;
            let config: ForemanConfig = serde_json::from_str(&content)?;
            debug!("Loaded settings from {}", settings_path.display());
            Ok(config)
        } else {
            debug!("No settings file at {}; using defaults", settings_path.display());
            Ok(Self::default())
        }
    }

    /// Get the settings.json path for a project.
    #[must_use]
    pub fn settings_path(project_dir: &Path) -> PathBuf {
        Self::state_dir(project_dir).join("settings.json")
    }

    /// Get the state directory for a project.
    #[must_use]
    pub fn state_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(STATE_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = ForemanConfig::load(temp.path()).unwrap();
        assert_eq!(config.autopilot.default_assignee, "CLAUDE_CLI");
        assert_eq!(config.supervisor.startup_silence_timeout_ms, 15_000);
        assert!(config.workers.contains_key("CLAUDE_CLI"));
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(ForemanConfig::state_dir(temp.path())).unwrap();
        std::fs::write(
            ForemanConfig::settings_path(temp.path()),
            r#"{"autopilot": {"default_assignee": "CODEX_CLI"}}"#,
        )
        .unwrap();

        let config = ForemanConfig::load(temp.path()).unwrap();
        assert_eq!(config.autopilot.default_assignee, "CODEX_CLI");
        // Unspecified sections keep defaults.
        assert_eq!(config.autopilot.settle_poll_attempts, 15);
        assert_eq!(config.supervisor.heartbeat_interval_ms, 30_000);
    }

    #[test]
    fn test_load_invalid_json_is_an_error() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(ForemanConfig::state_dir(temp.path())).unwrap();
        std::fs::write(ForemanConfig::settings_path(temp.path()), "{{{").unwrap();
        assert!(ForemanConfig::load(temp.path()).is_err());
    }

    #[test]
    fn test_settings_path() {
        assert_eq!(
            ForemanConfig::settings_path(Path::new("/proj")),
            PathBuf::from("/proj/.foreman/settings.json")
        );
    }

    #[test]
    fn test_config_roundtrip() {
        let config = ForemanConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let decoded: ForemanConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(
            decoded.supervisor.timeout_ms,
            config.supervisor.timeout_ms
        );
        assert_eq!(decoded.workers.len(), config.workers.len());
    }
}
