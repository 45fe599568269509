//! Agent records: one per supervised worker-process lifetime.
//!
//! An agent (supervisor sense) is one OS worker-process lifetime, distinct
//! from a task. Records are created on spawn and never deleted; terminal
//! records remain queryable history. The `run_token` is a generation counter
//! that only increases: async callbacks capture it at spawn and become
//! no-ops when the record has since moved to a newer generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of output lines retained per agent.
pub const OUTPUT_TAIL_LINES: usize = 50;

/// Maximum characters kept from a non-diagnostic output line.
pub const OUTPUT_LINE_MAX_CHARS: usize = 240;

/// Status of a supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Running,
    Stopped,
    Failed,
}

impl AgentStatus {
    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentStatus::Stopped | AgentStatus::Failed)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Running => write!(f, "RUNNING"),
            AgentStatus::Stopped => write!(f, "STOPPED"),
            AgentStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Publicly visible (and persisted) shape of an agent record.
///
/// This is the registry-file entry format; readers must tolerate and drop
/// malformed entries rather than failing the whole load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentView {
    pub id: Uuid,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub output_tail: Vec<String>,
}

/// Full in-process record, including fencing state not exposed in the view.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub view: AgentView,
    /// Generation counter; strictly increases across restarts.
    pub run_token: u64,
    /// Set by `kill()`; a subsequent process exit must not flip the status
    /// to FAILED.
    pub stop_requested: bool,
}

impl AgentRecord {
    /// Create a RUNNING record for a fresh spawn.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        cwd: impl Into<String>,
    ) -> Self {
        Self {
            view: AgentView {
                id: Uuid::new_v4(),
                name: name.into(),
                command: command.into(),
                args,
                cwd: cwd.into(),
                adapter_id: None,
                phase_id: None,
                task_id: None,
                project_name: None,
                status: AgentStatus::Running,
                pid: None,
                started_at: Utc::now(),
                stopped_at: None,
                last_exit_code: None,
                output_tail: Vec::new(),
            },
            run_token: 1,
            stop_requested: false,
        }
    }

    /// Append one output line to the tail ring.
    ///
    /// Non-diagnostic lines are truncated to [`OUTPUT_LINE_MAX_CHARS`];
    /// synthesized diagnostics are stored whole. The ring keeps only the
    /// most recent [`OUTPUT_TAIL_LINES`] lines.
    pub fn push_output_line(&mut self, line: &str, is_diagnostic: bool) {
        let stored = if !is_diagnostic && line.chars().count() > OUTPUT_LINE_MAX_CHARS {
            line.chars().take(OUTPUT_LINE_MAX_CHARS).collect()
        } else {
            line.to_string()
        };
        self.view.output_tail.push(stored);
        if self.view.output_tail.len() > OUTPUT_TAIL_LINES {
            let excess = self.view.output_tail.len() - OUTPUT_TAIL_LINES;
            self.view.output_tail.drain(..excess);
        }
    }

    /// Transition to STOPPED.
    pub fn mark_stopped(&mut self, exit_code: Option<i32>) {
        self.view.status = AgentStatus::Stopped;
        self.view.stopped_at = Some(Utc::now());
        if exit_code.is_some() {
            self.view.last_exit_code = exit_code;
        }
    }

    /// Transition to FAILED.
    pub fn mark_failed(&mut self, exit_code: Option<i32>) {
        self.view.status = AgentStatus::Failed;
        self.view.stopped_at = Some(Utc::now());
        self.view.last_exit_code = exit_code;
    }

    /// Begin a new process generation: bump the token, reset runtime fields.
    /// Any callback holding the previous token is fenced out.
    pub fn begin_generation(&mut self) {
        self.run_token += 1;
        self.stop_requested = false;
        self.view.status = AgentStatus::Running;
        self.view.pid = None;
        self.view.started_at = Utc::now();
        self.view.stopped_at = None;
        self.view.last_exit_code = None;
    }

    /// Update task/phase correlation. Clearing the task also clears the
    /// phase: a phase correlation is meaningless without a task.
    pub fn assign(&mut self, phase_id: Option<String>, task_id: Option<String>) {
        match task_id {
            Some(task) => {
                self.view.task_id = Some(task);
                if phase_id.is_some() {
                    self.view.phase_id = phase_id;
                }
            }
            None => {
                self.view.task_id = None;
                self.view.phase_id = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AgentRecord {
        AgentRecord::new("worker", "claude", vec!["-p".into()], "/repo")
    }

    #[test]
    fn test_new_record_is_running() {
        let rec = record();
        assert_eq!(rec.view.status, AgentStatus::Running);
        assert_eq!(rec.run_token, 1);
        assert!(!rec.stop_requested);
        assert!(rec.view.output_tail.is_empty());
    }

    #[test]
    fn test_tail_caps_at_fifty_lines() {
        let mut rec = record();
        for i in 0..120 {
            rec.push_output_line(&format!("line {i}"), false);
        }
        assert_eq!(rec.view.output_tail.len(), OUTPUT_TAIL_LINES);
        assert_eq!(rec.view.output_tail[0], "line 70");
        assert_eq!(rec.view.output_tail.last().unwrap(), "line 119");
    }

    #[test]
    fn test_long_lines_truncated() {
        let mut rec = record();
        let long = "a".repeat(500);
        rec.push_output_line(&long, false);
        assert_eq!(
            rec.view.output_tail[0].chars().count(),
            OUTPUT_LINE_MAX_CHARS
        );
    }

    #[test]
    fn test_diagnostic_lines_not_truncated() {
        let mut rec = record();
        let diag = "d".repeat(500);
        rec.push_output_line(&diag, true);
        assert_eq!(rec.view.output_tail[0].chars().count(), 500);
    }

    #[test]
    fn test_begin_generation_increases_token() {
        let mut rec = record();
        rec.stop_requested = true;
        rec.mark_failed(Some(2));

        let before = rec.run_token;
        rec.begin_generation();
        assert!(rec.run_token > before);
        assert_eq!(rec.view.status, AgentStatus::Running);
        assert!(!rec.stop_requested);
        assert!(rec.view.last_exit_code.is_none());
        assert!(rec.view.stopped_at.is_none());
    }

    #[test]
    fn test_assign_clearing_task_clears_phase() {
        let mut rec = record();
        rec.assign(Some("p1".into()), Some("t1".into()));
        assert_eq!(rec.view.phase_id.as_deref(), Some("p1"));
        assert_eq!(rec.view.task_id.as_deref(), Some("t1"));

        rec.assign(None, None);
        assert!(rec.view.task_id.is_none());
        assert!(rec.view.phase_id.is_none());
    }

    #[test]
    fn test_mark_stopped_keeps_prior_exit_code_when_none() {
        let mut rec = record();
        rec.view.last_exit_code = Some(0);
        rec.mark_stopped(None);
        assert_eq!(rec.view.status, AgentStatus::Stopped);
        assert_eq!(rec.view.last_exit_code, Some(0));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!AgentStatus::Running.is_terminal());
        assert!(AgentStatus::Stopped.is_terminal());
        assert!(AgentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_view_serialization_shape() {
        let rec = record();
        let json = serde_json::to_string(&rec.view).unwrap();
        assert!(json.contains("\"status\":\"RUNNING\""));
        assert!(json.contains("\"output_tail\":[]"));
        // Fencing state is not part of the persisted view.
        assert!(!json.contains("run_token"));
        assert!(!json.contains("stop_requested"));
    }
}
