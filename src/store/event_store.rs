//! The bounded, order-preserving store the UI reads.
//!
//! Only the event queue's flush step mutates stream state; UI code reads
//! through [`StoreHandle::read`]. Each collection has its own capacity and
//! evicts oldest-first.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::bounded::BoundedCollection;
use crate::bus::EventKind;
use crate::events::types::now_rfc3339;
use crate::events::{EventPayload, StreamEvent, TodoItem};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default = "now_rfc3339")]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// True while this is an assistant placeholder awaiting its final result.
    #[serde(default)]
    pub streaming: bool,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: now_rfc3339(),
            metadata: None,
            streaming: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: String,
    pub filename: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default = "now_rfc3339")]
    pub uploaded_at: String,
}

// ---------------------------------------------------------------------------
// Capacities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapacity {
    #[serde(default = "default_message_capacity")]
    pub messages: usize,
    #[serde(default = "default_event_capacity")]
    pub events: usize,
    #[serde(default = "default_todo_capacity")]
    pub todos: usize,
    #[serde(default = "default_upload_capacity")]
    pub uploaded_files: usize,
}

impl Default for StoreCapacity {
    fn default() -> Self {
        Self {
            messages: default_message_capacity(),
            events: default_event_capacity(),
            todos: default_todo_capacity(),
            uploaded_files: default_upload_capacity(),
        }
    }
}

fn default_message_capacity() -> usize {
    200
}

fn default_event_capacity() -> usize {
    1000
}

fn default_todo_capacity() -> usize {
    100
}

fn default_upload_capacity() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// What happened to an event handed to [`BoundedEventStore::apply_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Stored,
    /// An event with the same `(event_type, timestamp)` is already present.
    Duplicate,
    /// Kinds that never become store entries (heartbeat, complete).
    Skipped,
}

#[derive(Debug)]
pub struct BoundedEventStore {
    messages: BoundedCollection<ChatMessage>,
    events: BoundedCollection<StreamEvent>,
    todos: BoundedCollection<TodoItem>,
    uploaded_files: BoundedCollection<UploadedFile>,
    event_keys: HashSet<(EventKind, String)>,
    pending_assistant_id: Option<String>,
    current_session_id: Option<String>,
}

impl Default for BoundedEventStore {
    fn default() -> Self {
        Self::new(StoreCapacity::default())
    }
}

impl BoundedEventStore {
    pub fn new(capacity: StoreCapacity) -> Self {
        Self {
            messages: BoundedCollection::new(capacity.messages),
            events: BoundedCollection::new(capacity.events),
            todos: BoundedCollection::new(capacity.todos),
            uploaded_files: BoundedCollection::new(capacity.uploaded_files),
            event_keys: HashSet::new(),
            pending_assistant_id: None,
            current_session_id: None,
        }
    }

    pub fn messages(&self) -> &BoundedCollection<ChatMessage> {
        &self.messages
    }

    pub fn events(&self) -> &BoundedCollection<StreamEvent> {
        &self.events
    }

    pub fn todos(&self) -> &BoundedCollection<TodoItem> {
        &self.todos
    }

    pub fn uploaded_files(&self) -> &BoundedCollection<UploadedFile> {
        &self.uploaded_files
    }

    pub fn current_session_id(&self) -> Option<&str> {
        self.current_session_id.as_deref()
    }

    pub fn set_current_session_id(&mut self, session_id: Option<String>) {
        self.current_session_id = session_id;
    }

    /// Drop everything from the previous session.
    pub fn reset_for_session(&mut self, session_id: Option<String>) {
        self.messages.clear();
        self.events.clear();
        self.todos.clear();
        self.uploaded_files.clear();
        self.event_keys.clear();
        self.pending_assistant_id = None;
        self.current_session_id = session_id;
    }

    // -- messages -----------------------------------------------------------

    pub fn append_message(&mut self, message: ChatMessage) {
        for evicted in self.messages.push(message) {
            if self.pending_assistant_id.as_deref() == Some(evicted.id.as_str()) {
                self.pending_assistant_id = None;
            }
        }
    }

    pub fn append_user_message(&mut self, content: impl Into<String>) -> String {
        let message = ChatMessage::new(MessageRole::User, content);
        let id = message.id.clone();
        self.append_message(message);
        id
    }

    /// Insert the assistant placeholder a later `final_result` fills in.
    pub fn begin_assistant_message(&mut self) -> String {
        let mut message = ChatMessage::new(MessageRole::Assistant, "");
        message.streaming = true;
        let id = message.id.clone();
        self.append_message(message);
        self.pending_assistant_id = Some(id.clone());
        id
    }

    pub fn pending_assistant_id(&self) -> Option<&str> {
        self.pending_assistant_id.as_deref()
    }

    /// Update-in-place; returns false when no message has this id.
    pub fn update_message(&mut self, id: &str, content: &str, metadata: Option<Value>) -> bool {
        let Some(message) = self.messages.find_mut(|m| m.id == id) else {
            return false;
        };
        message.content = content.to_string();
        message.streaming = false;
        if metadata.is_some() {
            message.metadata = metadata;
        }
        true
    }

    // -- uploads ------------------------------------------------------------

    pub fn record_upload(&mut self, file: UploadedFile) {
        self.uploaded_files.push(file);
    }

    // -- todos --------------------------------------------------------------

    pub fn upsert_todo(&mut self, todo: TodoItem) {
        if let Some(existing) = self.todos.find_mut(|t| t.id == todo.id) {
            *existing = todo;
            return;
        }
        self.todos.push(todo);
    }

    pub fn replace_todos(&mut self, todos: Vec<TodoItem>) {
        self.todos.replace_all(todos);
    }

    // -- stream events ------------------------------------------------------

    pub fn contains_event(&self, kind: EventKind, timestamp: &str) -> bool {
        self.event_keys.contains(&(kind, timestamp.to_string()))
    }

    /// Record one decoded event and apply its side effects on todos and
    /// messages. Duplicates are dropped without side effects.
    pub fn apply_event(&mut self, event: StreamEvent) -> ApplyOutcome {
        let kind = event.kind();
        if !kind.is_stored() {
            return ApplyOutcome::Skipped;
        }
        if self.contains_event(kind, event.timestamp()) {
            return ApplyOutcome::Duplicate;
        }

        match event.payload() {
            EventPayload::TodosUpdated(update) => {
                // The server owns the full task list.
                self.replace_todos(update.todos.clone());
            }
            EventPayload::FinalResult(result) => {
                let target = result
                    .message_id
                    .clone()
                    .or_else(|| self.pending_assistant_id.clone());
                let metadata = event.metadata().cloned();
                let updated = target
                    .as_deref()
                    .map(|id| self.update_message(id, &result.content, metadata.clone()))
                    .unwrap_or(false);
                if !updated {
                    let mut message = ChatMessage::new(MessageRole::Assistant, result.content.clone());
                    message.metadata = metadata;
                    self.append_message(message);
                }
                self.pending_assistant_id = None;
            }
            EventPayload::Planning(_)
            | EventPayload::ToolCall(_)
            | EventPayload::ToolOutput(_)
            | EventPayload::CodeExecution(_)
            | EventPayload::Observation(_)
            | EventPayload::Visualization(_)
            | EventPayload::Error(_)
            | EventPayload::Debug(_) => {}
            EventPayload::Complete(_) | EventPayload::Heartbeat => return ApplyOutcome::Skipped,
        }

        self.event_keys
            .insert((kind, event.timestamp().to_string()));
        for evicted in self.events.push(event) {
            self.event_keys
                .remove(&(evicted.kind(), evicted.timestamp().to_string()));
        }
        ApplyOutcome::Stored
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle shared by the connection pipeline and the UI.
#[derive(Debug, Clone, Default)]
pub struct StoreHandle {
    inner: Arc<RwLock<BoundedEventStore>>,
}

impl StoreHandle {
    pub fn new(store: BoundedEventStore) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub fn with_capacity(capacity: StoreCapacity) -> Self {
        Self::new(BoundedEventStore::new(capacity))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, BoundedEventStore> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// UI-side mutations (user messages, placeholders, uploads). Stream
    /// events reach the store through the event queue only.
    pub fn write(&self) -> RwLockWriteGuard<'_, BoundedEventStore> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
