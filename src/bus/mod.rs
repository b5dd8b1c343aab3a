//! Event routing and batching between the decoder and the store.
//!
//! - `EventRouter`: typed publish/subscribe with per-kind and wildcard topics
//! - `EventQueue`: debounced, chunked, deduplicating writer into the store
//! - `event_types`: event kinds, subscribed wire names, and flush policy
//!
//! # Flow
//!
//! Decoded events are dispatched to subscribers immediately, then queued.
//! The queue flushes into the store when its 100ms debounce window closes,
//! five events per store write, or at once for terminal events.

mod batcher;
mod event_bus;
mod event_types;

pub use batcher::{debounce_elapsed, EventQueue, FlushReport, DEFAULT_CHUNK_SIZE, DEFAULT_DEBOUNCE};
pub use event_bus::{
    DispatchReport, EventRouter, HandlerError, HandlerResult, SubscriptionId, Topic,
};
pub use event_types::{
    is_subscribed_wire_event, should_flush_immediately, EventKind, DEFAULT_WIRE_EVENT,
};
