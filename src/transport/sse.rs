use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use tracing::{debug, info, trace};

use super::{Transport, TransportError, TransportEvent, TransportStream};
use crate::bus::{is_subscribed_wire_event, DEFAULT_WIRE_EVENT};

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field; `"message"` when the server sent none.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
    /// Server reconnection hint in milliseconds.
    pub retry: Option<u64>,
}

/// Incremental `text/event-stream` parser.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence, so the
/// buffer holds raw bytes until a full line is available.
#[derive(Debug, Default)]
pub struct SseStreamParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    last_id: Option<String>,
    retry: Option<u64>,
}

impl SseStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Id of the last event that carried one; persists across frames.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if let Some(comment) = line.strip_prefix(':') {
            trace!("sse comment: {}", comment.trim());
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            _ => trace!("unknown sse field: {field}"),
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseFrame {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_WIRE_EVENT.to_string()),
            data,
            id: self.last_id.clone(),
            retry,
        })
    }
}

struct FrameState<S> {
    body: S,
    parser: SseStreamParser,
    ready: VecDeque<TransportEvent>,
    finished: bool,
}

/// Turn a raw byte stream into transport events.
///
/// Frames whose event name is not subscribed are dropped here. A chunk that
/// yields no subscribed frame (comments, pings, a partial line) becomes a
/// `KeepAlive`. A body error becomes a terminal `Error { Closed }`; a clean
/// end of body ends the stream.
pub fn frame_stream<S, B, E>(body: S) -> impl Stream<Item = TransportEvent> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: fmt::Display + Send,
{
    let state = FrameState {
        body: Box::pin(body),
        parser: SseStreamParser::new(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let queued = state.ready.len();
                    for frame in state.parser.feed(bytes.as_ref()) {
                        if is_subscribed_wire_event(&frame.event) {
                            state.ready.push_back(TransportEvent::Frame(frame));
                        } else {
                            trace!("ignoring unsubscribed sse event '{}'", frame.event);
                        }
                    }
                    if state.ready.len() == queued && !bytes.as_ref().is_empty() {
                        state.ready.push_back(TransportEvent::KeepAlive);
                    }
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state
                        .ready
                        .push_back(TransportEvent::closed(format!("stream error: {e}")));
                }
                None => {
                    debug!("event stream ended");
                    state.finished = true;
                }
            }
        }
    })
}

/// HTTP `text/event-stream` transport on reqwest.
///
/// Remembers the last event id it saw and sends it as `Last-Event-ID` on the
/// next connect so the server can replay missed events.
pub struct SseTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    connect_timeout: Duration,
    last_event_id: Arc<Mutex<Option<String>>>,
}

impl SseTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
        // No overall timeout: the response body is expected to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        Ok(Self {
            client,
            headers,
            connect_timeout,
            last_event_id: Arc::new(Mutex::new(None)),
        })
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, TransportError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Client(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Client(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self, url: &str) -> Result<TransportStream, TransportError> {
        let mut request = self.client.get(url).headers(self.headers.clone());
        if let Some(last_id) = self.last_event_id() {
            request = request.header("Last-Event-ID", last_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(self.connect_timeout)
            } else {
                TransportError::connection(format!("failed to open event stream: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: body,
            });
        }
        info!("event stream open ({status})");

        let last_event_id = Arc::clone(&self.last_event_id);
        let frames = frame_stream(response.bytes_stream()).inspect(move |event| {
            if let TransportEvent::Frame(SseFrame { id: Some(id), .. }) = event {
                *last_event_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id.clone());
            }
        });

        Ok(Box::pin(
            stream::once(async { TransportEvent::Open }).chain(frames),
        ))
    }
}
