//! Session continuity: a small, size-capped slice of the store written to
//! durable storage.
//!
//! Only the most recent messages and uploaded-file records are kept, plus the
//! session id and UI preferences. Stream events are never persisted. Loading
//! never fails the caller: corrupt or foreign payloads fall back to defaults
//! field by field.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::event_store::{BoundedEventStore, ChatMessage, UploadedFile};
use crate::db::{queries, Database, DbError};

pub const PERSISTED_STATE_VERSION: u32 = 1;
pub const SESSION_STATE_KEY: &str = "session_state";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Db(#[from] DbError),
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiPreferences {
    pub show_debug_events: bool,
    pub auto_scroll: bool,
    pub sidebar_collapsed: bool,
    pub selected_model: Option<String>,
}

impl Default for UiPreferences {
    fn default() -> Self {
        Self {
            show_debug_events: false,
            auto_scroll: true,
            sidebar_collapsed: false,
            selected_model: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistLimits {
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_max_uploaded_files")]
    pub max_uploaded_files: usize,
    /// Serialized snapshots larger than this are dropped, not written.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for PersistLimits {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_uploaded_files: default_max_uploaded_files(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_messages() -> usize {
    50
}

fn default_max_uploaded_files() -> usize {
    20
}

fn default_max_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    pub messages: Vec<ChatMessage>,
    pub current_session_id: Option<String>,
    pub uploaded_files: Vec<UploadedFile>,
    pub preferences: UiPreferences,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            messages: Vec::new(),
            current_session_id: None,
            uploaded_files: Vec::new(),
            preferences: UiPreferences::default(),
        }
    }
}

impl PersistedState {
    pub fn snapshot(
        store: &BoundedEventStore,
        preferences: &UiPreferences,
        limits: &PersistLimits,
    ) -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            messages: store.messages().tail(limits.max_messages).cloned().collect(),
            current_session_id: store.current_session_id().map(ToString::to_string),
            uploaded_files: store
                .uploaded_files()
                .tail(limits.max_uploaded_files)
                .cloned()
                .collect(),
            preferences: preferences.clone(),
        }
    }

    /// Serialize, or `None` when the payload exceeds `max_bytes`.
    pub fn encode(&self, max_bytes: usize) -> Result<Option<String>, PersistError> {
        let raw = serde_json::to_string(self)?;
        if raw.len() > max_bytes {
            tracing::warn!(
                "session snapshot is {} bytes (limit {max_bytes}), not persisting",
                raw.len()
            );
            return Ok(None);
        }
        Ok(Some(raw))
    }

    /// Parse a stored snapshot, defaulting whatever is missing or malformed.
    pub fn decode(raw: &str) -> Self {
        let map = match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::warn!("persisted session state is not an object, using defaults");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!("persisted session state is corrupt, using defaults: {e}");
                return Self::default();
            }
        };

        let version = stored_version(&map);
        if version > PERSISTED_STATE_VERSION {
            tracing::warn!(
                "persisted session state has newer version {version}, reading known fields only"
            );
        }

        Self {
            version: PERSISTED_STATE_VERSION,
            messages: decode_list(&map, "messages"),
            current_session_id: decode_field(&map, "currentSessionId"),
            uploaded_files: decode_list(&map, "uploadedFiles"),
            preferences: decode_field(&map, "preferences"),
        }
    }

    /// Replace the store's session-scoped contents with this snapshot.
    pub fn restore_into(self, store: &mut BoundedEventStore) {
        store.reset_for_session(self.current_session_id);
        for mut message in self.messages {
            // A placeholder from an interrupted session will never be filled.
            message.streaming = false;
            store.append_message(message);
        }
        for file in self.uploaded_files {
            store.record_upload(file);
        }
    }
}

fn decode_field<T: DeserializeOwned + Default>(map: &Map<String, Value>, key: &str) -> T {
    match map.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value.clone()).unwrap_or_else(|e| {
            tracing::warn!("persisted field '{key}' is invalid, using default: {e}");
            T::default()
        }),
    }
}

/// Snapshot format version; values past `u32::MAX` count as newer.
fn stored_version(map: &Map<String, Value>) -> u32 {
    match map.get("version").and_then(Value::as_u64) {
        Some(v) => u32::try_from(v).unwrap_or(u32::MAX),
        None => PERSISTED_STATE_VERSION,
    }
}

fn decode_list<T: DeserializeOwned>(map: &Map<String, Value>, key: &str) -> Vec<T> {
    let Some(Value::Array(items)) = map.get(key) else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match serde_json::from_value(item.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!("dropping invalid entry in persisted '{key}': {e}");
                None
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Storage collaborators
// ---------------------------------------------------------------------------

/// Durable key/value storage the snapshot is written to.
pub trait StateStorage: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, PersistError>;
    fn save(&self, key: &str, value: &str) -> Result<(), PersistError>;
    fn remove(&self, key: &str) -> Result<(), PersistError>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStorage for MemoryStateStorage {
    fn load(&self, key: &str) -> Result<Option<String>, PersistError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PersistError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key);
        Ok(())
    }
}

/// Stores snapshots in the SQLite `settings` table.
pub struct SqliteStateStorage {
    db: Arc<Database>,
}

impl SqliteStateStorage {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl StateStorage for SqliteStateStorage {
    fn load(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(queries::get_setting(&self.db, key)?)
    }

    fn save(&self, key: &str, value: &str) -> Result<(), PersistError> {
        queries::upsert_setting(&self.db, key, value, &Utc::now().to_rfc3339())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), PersistError> {
        queries::delete_setting(&self.db, key)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Save / load
// ---------------------------------------------------------------------------

pub struct SessionPersistence<S: StateStorage> {
    storage: S,
    limits: PersistLimits,
    key: String,
}

impl<S: StateStorage> SessionPersistence<S> {
    pub fn new(storage: S, limits: PersistLimits) -> Self {
        Self {
            storage,
            limits,
            key: SESSION_STATE_KEY.to_string(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Write a snapshot; returns false when it was over the size ceiling.
    pub fn save(
        &self,
        store: &BoundedEventStore,
        preferences: &UiPreferences,
    ) -> Result<bool, PersistError> {
        let snapshot = PersistedState::snapshot(store, preferences, &self.limits);
        match snapshot.encode(self.limits.max_bytes)? {
            Some(raw) => {
                self.storage.save(&self.key, &raw)?;
                tracing::debug!(
                    "persisted {} messages, {} uploads",
                    snapshot.messages.len(),
                    snapshot.uploaded_files.len()
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Load the last snapshot; storage failures and corruption yield defaults.
    pub fn load(&self) -> PersistedState {
        match self.storage.load(&self.key) {
            Ok(Some(raw)) => PersistedState::decode(&raw),
            Ok(None) => PersistedState::default(),
            Err(e) => {
                tracing::warn!("failed to read persisted session state: {e}");
                PersistedState::default()
            }
        }
    }

    pub fn clear(&self) -> Result<(), PersistError> {
        self.storage.remove(&self.key)
    }
}
