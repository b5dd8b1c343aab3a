//! Scripted transport for driving the connection manager in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::mpsc;

use agentstream_lib::transport::{
    ReadyState, SseFrame, Transport, TransportError, TransportEvent, TransportStream,
};

enum Script {
    Fail(TransportError),
    Stream(mpsc::UnboundedReceiver<TransportEvent>),
}

/// Each `connect` consumes the next scripted outcome. With nothing
/// scripted, connects fail with a retryable connection error.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<VecDeque<Script>>,
    urls: Mutex<Vec<String>>,
    connects: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script a successful connect; the returned handle feeds its stream.
    pub fn push_stream(&self) -> MockServer {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().unwrap().push_back(Script::Stream(rx));
        MockServer { tx }
    }

    pub fn push_failure(&self, error: TransportError) {
        self.scripts.lock().unwrap().push_back(Script::Fail(error));
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<TransportStream, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Stream(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            }))),
            Some(Script::Fail(error)) => Err(error),
            None => Err(TransportError::Connection("no scripted connection".to_string())),
        }
    }
}

/// Server side of one scripted stream. Dropping it ends the stream.
pub struct MockServer {
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl MockServer {
    pub fn open(&self) {
        self.send(TransportEvent::Open);
    }

    /// Send a frame; `event` is the SSE `event:` name.
    pub fn frame(&self, event: &str, data: &str) {
        self.send(TransportEvent::Frame(SseFrame {
            event: event.to_string(),
            data: data.to_string(),
            id: None,
            retry: None,
        }));
    }

    /// Bytes with no subscribed frame, e.g. a `: ping` comment.
    pub fn keep_alive(&self) {
        self.send(TransportEvent::KeepAlive);
    }

    /// Report an error while the channel is still retrying by itself.
    pub fn transient_error(&self, message: &str) {
        self.send(TransportEvent::Error {
            ready_state: ReadyState::Connecting,
            message: message.to_string(),
        });
    }

    /// Irrecoverably close the channel.
    pub fn close(&self, message: &str) {
        self.send(TransportEvent::closed(message));
    }

    fn send(&self, event: TransportEvent) {
        // The driver may already have dropped this stream.
        let _ = self.tx.send(event);
    }
}
