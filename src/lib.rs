//! Streaming ingestion client for remote AI agent progress events.
//!
//! A server pushes a long-lived stream of typed events (plans, tool calls,
//! observations, results, errors) while an agent works on a prompt. This
//! crate keeps that stream alive and turns it into bounded, queryable state:
//! - `transport`: the push channel (SSE over reqwest) and stream URL building
//! - `events`: the event model and frame decoding
//! - `connection`: connection lifecycle, reconnection, heartbeat watchdog
//! - `bus`: subscription routing and the debounced store writer
//! - `store`: bounded in-memory store and session persistence
//! - `config` / `db`: configuration stored in SQLite settings
//!
//! # Flow
//!
//! ```text
//! transport -> decode -> router (subscribers) -> event queue -> store
//!                             ^                                  |
//!                     connection manager                  persistence
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod db;
pub mod events;
pub mod store;
pub mod transport;

pub use bus::{EventKind, EventRouter, HandlerResult, SubscriptionId, Topic};
pub use config::{load_stream_config, save_stream_config, ConfigError, StreamConfig};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus, StartOutcome};
pub use events::{decode, DecodeError, EventPayload, StreamEvent};
pub use store::{SessionPersistence, StoreHandle};
pub use transport::{ReadyState, StreamRequest, Transport, TransportError};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

/// Error for embedders that touch several layers at once (config, storage,
/// transport setup).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Db(#[from] db::DbError),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Persist(#[from] store::PersistError),
    #[error(transparent)]
    Transport(#[from] transport::TransportError),
    #[error("{0}")]
    Other(String),
}

impl serde::Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Install the tracing subscriber used by the binaries. `RUST_LOG` wins over
/// the built-in default filter.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agentstream=debug,info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
