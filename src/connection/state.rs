use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::ReadyState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget spent or the server reported a fatal error. Cleared only
    /// by a new `start()`.
    Error,
}

impl ConnectionStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }

    /// A session is running and `start()` must not open another channel.
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }

    /// The transition table of the connection state machine. `stop()` may
    /// move any state to `Disconnected`.
    pub const fn can_transition_to(&self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (*self, next) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Reconnecting | Error) => true,
            (Connected, Reconnecting | Error) => true,
            (Reconnecting, Connecting) => true,
            (Error, Connecting) => true,
            _ => false,
        }
    }

    /// What an EventSource-style `readyState` would report in this state.
    /// No channel handle exists while waiting out a backoff delay.
    pub const fn ready_state(&self) -> ReadyState {
        match self {
            Self::Connecting => ReadyState::Connecting,
            Self::Connected => ReadyState::Open,
            Self::Disconnected | Self::Reconnecting | Self::Error => ReadyState::Closed,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of the connection manager, as published to observers.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub reconnect_attempts: u32,
    pub last_event_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::ConnectionStatus::*;
    use super::*;

    #[test]
    fn stop_is_allowed_from_every_state() {
        for status in [Disconnected, Connecting, Connected, Reconnecting, Error] {
            assert!(status.can_transition_to(Disconnected), "{status}");
        }
    }

    #[test]
    fn error_is_only_left_by_start_or_stop() {
        assert!(Error.can_transition_to(Connecting));
        assert!(!Error.can_transition_to(Connected));
        assert!(!Error.can_transition_to(Reconnecting));
    }

    #[test]
    fn reconnect_path_goes_through_connecting() {
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connecting));
        assert!(!Reconnecting.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
    }

    #[test]
    fn only_live_states_block_start() {
        assert!(Connecting.is_active());
        assert!(Connected.is_active());
        assert!(Reconnecting.is_active());
        assert!(!Disconnected.is_active());
        assert!(!Error.is_active());
    }

    #[test]
    fn ready_state_mapping() {
        assert_eq!(Connected.ready_state(), ReadyState::Open);
        assert_eq!(Connecting.ready_state(), ReadyState::Connecting);
        assert_eq!(Reconnecting.ready_state(), ReadyState::Closed);
    }
}
