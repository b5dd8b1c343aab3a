use serde::{Deserialize, Serialize};

use super::TransportError;

const FILE_REFERENCE_PREFIX: &str = "@file:";

/// Parameters for one streaming run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_ids: Vec<String>,
}

impl StreamRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_file_ids<I, S>(mut self, file_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_ids = file_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Add every `@file:<uuid>` mentioned in the prompt to `file_ids`.
    pub fn with_prompt_file_references(mut self) -> Self {
        for id in extract_file_references(&self.prompt) {
            if !self.file_ids.contains(&id) {
                self.file_ids.push(id);
            }
        }
        self
    }
}

/// Build the stream URL: `base?prompt=..&session_id=..&model=..&file_ids=a,b`.
///
/// Optional parameters are omitted when absent; `file_ids` is omitted when
/// empty. Values are percent-encoded.
pub fn build_stream_url(base: &str, request: &StreamRequest) -> Result<String, TransportError> {
    let base = base.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(TransportError::InvalidUrl(base.to_string()));
    }

    let mut params = vec![("prompt", request.prompt.clone())];
    if let Some(session_id) = request.session_id.as_deref().filter(|s| !s.is_empty()) {
        params.push(("session_id", session_id.to_string()));
    }
    if let Some(model) = request.model.as_deref().filter(|m| !m.is_empty()) {
        params.push(("model", model.to_string()));
    }
    if !request.file_ids.is_empty() {
        params.push(("file_ids", request.file_ids.join(",")));
    }

    let query = params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    let separator = if base.contains('?') { '&' } else { '?' };
    Ok(format!("{base}{separator}{query}"))
}

/// Collect the ids of `@file:<uuid>` references in a prompt, in order of
/// first appearance. Tokens whose id is not a UUID are ignored.
pub fn extract_file_references(prompt: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut rest = prompt;
    while let Some(start) = rest.find(FILE_REFERENCE_PREFIX) {
        rest = &rest[start + FILE_REFERENCE_PREFIX.len()..];
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
            .unwrap_or(rest.len());
        let candidate = &rest[..end];
        if let Ok(id) = uuid::Uuid::parse_str(candidate) {
            let id = id.to_string();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        rest = &rest[end..];
    }
    ids
}
