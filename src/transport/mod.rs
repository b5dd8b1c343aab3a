//! The push channel between the agent backend and the client.
//!
//! A [`Transport`] opens one long-lived stream per connection attempt and
//! yields [`TransportEvent`]s: `Open` once, then frames, then possibly a
//! terminal `Error`. Reconnection policy belongs to the connection manager;
//! transports never retry on their own.

mod sse;
mod url;

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

pub use sse::{frame_stream, SseFrame, SseStreamParser, SseTransport};
pub use url::{build_stream_url, extract_file_references, StreamRequest};

/// EventSource-style channel state, as reported by `readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadyState::Connecting => write!(f, "connecting"),
            ReadyState::Open => write!(f, "open"),
            ReadyState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Frame(SseFrame),
    /// Bytes arrived that carried no subscribed frame: `:` comments, `ping`
    /// events and the like. Proves the channel is alive.
    KeepAlive,
    /// `ready_state == Connecting` means the channel is retrying by itself
    /// and the error is informational. `Closed` is terminal for this stream.
    Error {
        ready_state: ReadyState,
        message: String,
    },
}

impl TransportEvent {
    pub fn closed(message: impl Into<String>) -> Self {
        TransportEvent::Error {
            ready_state: ReadyState::Closed,
            message: message.into(),
        }
    }
}

pub type TransportStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

impl TransportError {
    pub fn connection<E: fmt::Display>(err: E) -> Self {
        TransportError::Connection(err.to_string())
    }

    /// Whether another connection attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection(_) | TransportError::Timeout(_) => true,
            TransportError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            TransportError::InvalidUrl(_) | TransportError::Client(_) => false,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new stream. Dropping the returned stream closes the channel.
    async fn connect(&self, url: &str) -> Result<TransportStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(TransportError::Connection("reset".into()).is_retryable());
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(TransportError::Http {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(TransportError::Http {
            status: 429,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::Http {
            status: 404,
            message: String::new()
        }
        .is_retryable());
        assert!(!TransportError::InvalidUrl("ftp://x".into()).is_retryable());
    }

    #[test]
    fn ready_state_codes_match_eventsource() {
        assert_eq!(ReadyState::Connecting as u8, 0);
        assert_eq!(ReadyState::Open as u8, 1);
        assert_eq!(ReadyState::Closed as u8, 2);
    }
}
