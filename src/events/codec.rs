//! Frame payload decoding.
//!
//! Turns the text of one push-channel frame into a [`StreamEvent`]. The
//! channel's named-event label wins over whatever tag the payload carries, so
//! framing and content cannot disagree. Decoding never panics; callers log and
//! drop on error and keep the connection.

use std::borrow::Cow;

use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{now_rfc3339, DebugLevel, StreamEvent};
use crate::bus::{EventKind, DEFAULT_WIRE_EVENT};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("'{0}' frame carries non-json text")]
    PlainText(String),
    #[error("malformed json: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("expected a json object, got {0}")]
    NotAnObject(&'static str),
    #[error("frame carries no event_type")]
    MissingEventType,
    #[error("unknown event_type '{0}'")]
    UnknownEventType(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one frame. `hint_event_type` is the SSE `event:` name, if any.
pub fn decode(raw: &str, hint_event_type: Option<&str>) -> Result<StreamEvent, DecodeError> {
    let stripped = strip_data_prefix(raw);
    let body = stripped.trim();
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }

    if !looks_like_json(body) {
        // Unnamed text stays visible as a debug event; a frame that names a
        // kind promised a json payload.
        return match named_hint(hint_event_type) {
            Some(name) => Err(DecodeError::PlainText(name.to_string())),
            None => Ok(StreamEvent::debug(body, DebugLevel::Info)),
        };
    }

    let value: Value = serde_json::from_str(body).map_err(DecodeError::Malformed)?;
    let mut object = match value {
        Value::Object(object) => object,
        other => return Err(DecodeError::NotAnObject(json_type_name(&other))),
    };

    let tag = resolve_tag(hint_event_type, &object)?;
    let kind: EventKind = tag
        .parse()
        .map_err(|_| DecodeError::UnknownEventType(tag.clone()))?;

    object.remove("type");
    object.insert(
        "event_type".to_string(),
        Value::String(kind.as_str().to_string()),
    );
    if matches!(object.get("timestamp"), None | Some(Value::Null)) {
        object.insert("timestamp".to_string(), Value::String(now_rfc3339()));
    }
    stringify_id(&mut object, "session_id");
    stringify_id(&mut object, "step_id");

    serde_json::from_value(Value::Object(object))
        .map_err(|source| DecodeError::InvalidPayload { kind, source })
}

fn strip_data_prefix(raw: &str) -> Cow<'_, str> {
    let trimmed = raw.trim_start();
    if !trimmed.starts_with("data:") {
        return Cow::Borrowed(raw);
    }

    let joined = trimmed
        .lines()
        .map(|line| line.strip_prefix("data:").map(str::trim_start).unwrap_or(line))
        .collect::<Vec<_>>()
        .join("\n");
    Cow::Owned(joined)
}

fn looks_like_json(body: &str) -> bool {
    body.starts_with('{') || body.starts_with('[')
}

/// The hint, unless it is absent, blank, or the default `message` name.
fn named_hint(hint: Option<&str>) -> Option<&str> {
    hint.map(str::trim)
        .filter(|h| !h.is_empty() && *h != DEFAULT_WIRE_EVENT)
}

fn resolve_tag(hint: Option<&str>, object: &Map<String, Value>) -> Result<String, DecodeError> {
    if let Some(hint) = named_hint(hint) {
        return Ok(hint.to_string());
    }

    ["event_type", "type"]
        .iter()
        .filter_map(|key| object.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .ok_or(DecodeError::MissingEventType)
}

fn stringify_id(object: &mut Map<String, Value>, key: &str) {
    if let Some(Value::Number(number)) = object.get(key) {
        let text = number.to_string();
        object.insert(key.to_string(), Value::String(text));
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
