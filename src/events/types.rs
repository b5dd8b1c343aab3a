//! Typed records for the agent progress stream.
//!
//! Every frame the server pushes decodes into one [`StreamEvent`]: a handful of
//! envelope fields shared by all events plus an [`EventPayload`] variant keyed
//! by `event_type`. Events are read-only once built.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::EventKind;

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default = "now_rfc3339")]
    timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Value>,
    #[serde(flatten)]
    payload: EventPayload,
}

impl StreamEvent {
    /// Build an event stamped with the current wall clock.
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: now_rfc3339(),
            session_id: None,
            step_id: None,
            metadata: None,
            payload,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = timestamp.into();
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The non-recoverable error the connection manager synthesizes once its
    /// retry budget is spent.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(EventPayload::Error(ErrorEvent {
            error: message.into(),
            recoverable: false,
            retry_after: None,
        }))
    }

    pub fn debug(message: impl Into<String>, level: DebugLevel) -> Self {
        Self::new(EventPayload::Debug(DebugEvent {
            message: message.into(),
            level,
        }))
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn step_id(&self) -> Option<&str> {
        self.step_id.as_deref()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Two events with the same key are the same logical event; a reconnect
    /// that replays the tail of a stream produces matching keys.
    pub fn dedup_key(&self) -> (EventKind, &str) {
        (self.kind(), self.timestamp.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventPayload {
    Planning(PlanningEvent),
    ToolCall(ToolCallEvent),
    ToolOutput(ToolOutputEvent),
    CodeExecution(CodeExecutionEvent),
    Observation(ObservationEvent),
    Visualization(VisualizationEvent),
    TodosUpdated(TodosUpdatedEvent),
    FinalResult(FinalResultEvent),
    Error(ErrorEvent),
    Complete(CompleteEvent),
    Heartbeat,
    Debug(DebugEvent),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Planning(_) => EventKind::Planning,
            EventPayload::ToolCall(_) => EventKind::ToolCall,
            EventPayload::ToolOutput(_) => EventKind::ToolOutput,
            EventPayload::CodeExecution(_) => EventKind::CodeExecution,
            EventPayload::Observation(_) => EventKind::Observation,
            EventPayload::Visualization(_) => EventKind::Visualization,
            EventPayload::TodosUpdated(_) => EventKind::TodosUpdated,
            EventPayload::FinalResult(_) => EventKind::FinalResult,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::Complete(_) => EventKind::Complete,
            EventPayload::Heartbeat => EventKind::Heartbeat,
            EventPayload::Debug(_) => EventKind::Debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanStep {
    /// Servers send either numeric or string ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub step: String,
    #[serde(default = "default_step_status")]
    pub status: String,
}

fn default_step_status() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanningEvent {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutputEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub output: String,
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeExecutionEvent {
    #[serde(default)]
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

fn default_language() -> String {
    "python".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationEvent {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub has_errors: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualizationEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodosUpdatedEvent {
    #[serde(default)]
    pub todos: Vec<TodoItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResultEvent {
    #[serde(default)]
    pub content: String,
    /// Placeholder message this result completes, when the server knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub error: String,
    #[serde(default)]
    pub recoverable: bool,
    /// Seconds the server asks the client to wait before reconnecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompleteEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEvent {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: DebugLevel,
}

// ---------------------------------------------------------------------------
// Todos
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
    #[serde(default = "now_rfc3339")]
    pub created_at: String,
    #[serde(default = "now_rfc3339")]
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TodoPriority>,
}

impl TodoItem {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            id: id.into(),
            content: content.into(),
            status: TodoStatus::Pending,
            created_at: now.clone(),
            updated_at: now,
            priority: None,
        }
    }

    pub fn with_status(mut self, status: TodoStatus) -> Self {
        self.status = status;
        self
    }
}
