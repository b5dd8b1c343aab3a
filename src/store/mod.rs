//! Bounded event store and its persisted slice.
//!
//! - `BoundedCollection`: FIFO-evicting sequence used for every collection
//! - `BoundedEventStore`: messages, stream events, todos, uploaded files
//! - `persist`: size-capped session snapshot written to durable storage

mod bounded;
mod event_store;
pub mod persist;

pub use bounded::BoundedCollection;
pub use event_store::{
    ApplyOutcome, BoundedEventStore, ChatMessage, MessageRole, StoreCapacity, StoreHandle,
    UploadedFile,
};
pub use persist::{
    MemoryStateStorage, PersistError, PersistLimits, PersistedState, SessionPersistence,
    SqliteStateStorage, StateStorage, UiPreferences,
};
