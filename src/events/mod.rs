//! Stream event model and frame decoding.

pub mod codec;
pub mod types;

pub use codec::{decode, DecodeError};
pub use types::{
    CodeExecutionEvent, CompleteEvent, DebugEvent, DebugLevel, ErrorEvent, EventPayload,
    FinalResultEvent, ObservationEvent, PlanStep, PlanningEvent, StreamEvent, TodoItem,
    TodoPriority, TodoStatus, TodosUpdatedEvent, ToolCallEvent, ToolOutputEvent,
    VisualizationEvent,
};
