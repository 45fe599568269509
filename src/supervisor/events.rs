//! Runtime event stream surfaced to agent subscribers.
//!
//! Events form a closed sum type matched exhaustively by subscribers; there
//! is no open-ended "any event" family. Every event carries the context
//! identifying which agent (and optionally which task) produced it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which stream an output line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Synthesized diagnostic lines (heartbeats, timeouts) rather than
    /// process output.
    System,
}

/// Terminal outcome of one supervised process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failure,
    Cancelled,
}

/// Correlation context attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventContext {
    /// Component that emitted the event (e.g. "supervisor", "engine").
    pub source: String,
    pub agent_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

/// A single event on an agent's subscription feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum AgentEvent {
    /// One line of worker output (or a synthesized diagnostic line).
    AdapterOutput {
        context: EventContext,
        stream: OutputStream,
        line: String,
        is_diagnostic: bool,
    },
    /// The supervised process reached a terminal outcome.
    TerminalOutcome {
        context: EventContext,
        outcome: RunOutcome,
        summary: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Free-form progress message from the task lifecycle.
    TaskLifecycle {
        context: EventContext,
        message: String,
    },
}

impl AgentEvent {
    /// The context shared by every event family.
    #[must_use]
    pub fn context(&self) -> &EventContext {
        match self {
            AgentEvent::AdapterOutput { context, .. }
            | AgentEvent::TerminalOutcome { context, .. }
            | AgentEvent::TaskLifecycle { context, .. } => context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> EventContext {
        EventContext {
            source: "supervisor".into(),
            agent_id: Uuid::new_v4(),
            adapter_id: Some("claude-cli".into()),
            phase_id: Some("p1".into()),
            task_id: Some("t1".into()),
            project_name: Some("demo".into()),
        }
    }

    #[test]
    fn test_event_context_accessor() {
        let event = AgentEvent::TaskLifecycle {
            context: context(),
            message: "dispatching".into(),
        };
        assert_eq!(event.context().source, "supervisor");
        assert_eq!(event.context().task_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_event_serialization_tags_family() {
        let event = AgentEvent::AdapterOutput {
            context: context(),
            stream: OutputStream::Stderr,
            line: "warning: deprecated".into(),
            is_diagnostic: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"family\":\"adapter-output\""));
        assert!(json.contains("\"stream\":\"stderr\""));
    }

    #[test]
    fn test_terminal_outcome_roundtrip() {
        let event = AgentEvent::TerminalOutcome {
            context: context(),
            outcome: RunOutcome::Failure,
            summary: "exited with code 2".into(),
            exit_code: Some(2),
        };
        let json = serde_json::to_string(&event).unwrap();
        let decoded: AgentEvent = serde_json::from_str(&json).unwrap();
        match decoded {
            AgentEvent::TerminalOutcome {
                outcome, exit_code, ..
            } => {
                assert_eq!(outcome, RunOutcome::Failure);
                assert_eq!(exit_code, Some(2));
            }
            _ => panic!("wrong family"),
        }
    }
}
