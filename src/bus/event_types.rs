//! Event kinds, wire names, and flush policy.
//!
//! Single source of truth for which wire events the client subscribes to,
//! which ones land in the store, and which ones flush the queue immediately
//! instead of waiting for the debounce window.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name the push channel uses for frames sent without an `event:` line.
pub const DEFAULT_WIRE_EVENT: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Planning,
    ToolCall,
    ToolOutput,
    CodeExecution,
    Observation,
    Visualization,
    TodosUpdated,
    FinalResult,
    Error,
    Complete,
    Heartbeat,
    Debug,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::ToolCall => "tool_call",
            Self::ToolOutput => "tool_output",
            Self::CodeExecution => "code_execution",
            Self::Observation => "observation",
            Self::Visualization => "visualization",
            Self::TodosUpdated => "todos_updated",
            Self::FinalResult => "final_result",
            Self::Error => "error",
            Self::Complete => "complete",
            Self::Heartbeat => "heartbeat",
            Self::Debug => "debug",
        }
    }

    pub const fn all() -> &'static [EventKind] {
        &[
            EventKind::Planning,
            EventKind::ToolCall,
            EventKind::ToolOutput,
            EventKind::CodeExecution,
            EventKind::Observation,
            EventKind::Visualization,
            EventKind::TodosUpdated,
            EventKind::FinalResult,
            EventKind::Error,
            EventKind::Complete,
            EventKind::Heartbeat,
            EventKind::Debug,
        ]
    }

    /// Whether events of this kind become entries in the store's event list.
    /// Heartbeats only refresh liveness and `complete` only ends the session.
    pub const fn is_stored(&self) -> bool {
        !matches!(self, Self::Heartbeat | Self::Complete)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EventKind::all()
            .iter()
            .copied()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| format!("unknown event type: {value}"))
    }
}

/// Whether a frame with this `event:` name is delivered to the codec.
/// Anything else is a name the client never subscribed to.
pub fn is_subscribed_wire_event(name: &str) -> bool {
    name == DEFAULT_WIRE_EVENT || name.parse::<EventKind>().is_ok()
}

// ---------------------------------------------------------------------------
// Flush policy
// ---------------------------------------------------------------------------

/// Returns true if this event should flush the pending queue right away
/// instead of waiting for the debounce timer. The event itself is enqueued
/// first so ordering with the current buffer is preserved.
pub fn should_flush_immediately(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::FinalResult | EventKind::Error | EventKind::Complete
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for kind in EventKind::all() {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), *kind);
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn legacy_names_are_not_subscribed() {
        assert!(is_subscribed_wire_event("message"));
        assert!(is_subscribed_wire_event("todos_updated"));
        assert!(!is_subscribed_wire_event("final_answer"));
        assert!(!is_subscribed_wire_event("done"));
    }

    #[test]
    fn terminal_events_flush_immediately() {
        assert!(should_flush_immediately(EventKind::Complete));
        assert!(should_flush_immediately(EventKind::Error));
        assert!(should_flush_immediately(EventKind::FinalResult));
        assert!(!should_flush_immediately(EventKind::ToolCall));
        assert!(!EventKind::Heartbeat.is_stored());
        assert!(EventKind::Debug.is_stored());
    }
}
