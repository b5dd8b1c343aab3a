use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{BackoffPolicy, CancelSignal, ConnectionStatus, Shared};
use crate::bus::{debounce_elapsed, should_flush_immediately, EventKind, EventQueue};
use crate::events::{decode, EventPayload, StreamEvent};
use crate::transport::{ReadyState, SseFrame, TransportEvent, TransportStream};

/// How one connected stream ended.
enum StreamEnd {
    Reconnect(Duration),
    /// Stopped, completed, or failed terminally.
    Finished,
}

/// What a decoded event asks of the connection, beyond being relayed.
enum Control {
    Continue,
    RetryAfter { wait: Duration, message: String },
    Fatal(String),
}

impl Control {
    fn of(event: &StreamEvent) -> Self {
        match event.payload() {
            EventPayload::Error(err) if err.recoverable => {
                match err.retry_after.map(Duration::try_from_secs_f64) {
                    Some(Ok(wait)) => Control::RetryAfter {
                        wait,
                        message: err.error.clone(),
                    },
                    Some(Err(_)) => {
                        warn!("ignoring invalid retry_after {:?}", err.retry_after);
                        Control::Continue
                    }
                    None => Control::Continue,
                }
            }
            EventPayload::Error(err) => Control::Fatal(err.error.clone()),
            _ => Control::Continue,
        }
    }
}

/// Session task: connect, pump frames, reconnect, until stopped or terminal.
pub(super) struct Driver {
    shared: Arc<Shared>,
    epoch: u64,
    cancel: CancelSignal,
    url: String,
    queue: EventQueue,
    backoff: BackoffPolicy,
    attempts: u32,
    last_event: Instant,
}

impl Driver {
    pub(super) fn new(shared: Arc<Shared>, epoch: u64, cancel: CancelSignal, url: String) -> Self {
        let config = shared.config();
        let queue = EventQueue::new(config.debounce(), config.flush_chunk_size);
        let backoff = config.backoff();
        Self {
            shared,
            epoch,
            cancel,
            url,
            queue,
            backoff,
            attempts: 0,
            last_event: Instant::now(),
        }
    }

    pub(super) async fn run(mut self) {
        let mut delay: Option<Duration> = None;
        loop {
            if let Some(wait) = delay.take() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = time::sleep(wait) => {}
                }
                let resumed = self.shared.publish(&self.cancel, |state| {
                    state.status = ConnectionStatus::Connecting;
                });
                if !resumed {
                    break;
                }
            }

            debug!("session {}: connecting", self.epoch);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.shared.transport().connect(&self.url) => result,
            };

            let end = match connected {
                Ok(stream) => self.pump(stream).await,
                Err(e) if e.is_retryable() => self.on_failure(e.to_string()).await,
                Err(e) => {
                    error!("session {}: cannot open stream: {e}", self.epoch);
                    self.fail(format!("failed to open stream: {e}")).await
                }
            };
            match end {
                StreamEnd::Reconnect(wait) => delay = Some(wait),
                StreamEnd::Finished => break,
            }
        }

        let dropped = self.queue.discard();
        if dropped > 0 {
            debug!("session {}: discarded {dropped} unflushed events", self.epoch);
        }
        self.shared.release(self.epoch);
        debug!("session {}: driver exited", self.epoch);
    }

    async fn pump(&mut self, mut stream: TransportStream) -> StreamEnd {
        let interval = self.shared.config().heartbeat_interval();
        let timeout = self.shared.config().heartbeat_timeout();
        let mut heartbeat = time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.last_event = Instant::now();

        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Finished,
                item = stream.next() => match item {
                    Some(TransportEvent::Open) => self.on_open(),
                    Some(TransportEvent::Frame(frame)) => {
                        if let Some(end) = self.on_frame(frame).await {
                            return end;
                        }
                    }
                    Some(TransportEvent::KeepAlive) => {
                        self.last_event = Instant::now();
                        self.shared.touch(&self.cancel);
                    }
                    Some(TransportEvent::Error { ready_state: ReadyState::Connecting, message }) => {
                        debug!("session {}: transport still connecting: {message}", self.epoch);
                    }
                    Some(TransportEvent::Error { message, .. }) => {
                        return self.on_failure(message).await;
                    }
                    None => return self.on_failure("stream closed".to_string()).await,
                },
                _ = debounce_elapsed(self.queue.deadline()) => {
                    self.queue.flush(self.shared.store()).await;
                }
                _ = heartbeat.tick() => {
                    let idle = self.last_event.elapsed();
                    if idle > timeout {
                        warn!("session {}: no frames for {idle:?}", self.epoch);
                        return self.on_failure(format!("heartbeat timeout after {idle:?}")).await;
                    }
                }
            }
        }
    }

    fn on_open(&mut self) {
        self.attempts = 0;
        self.last_event = Instant::now();
        info!("session {}: stream connected", self.epoch);
        self.shared.publish(&self.cancel, |state| {
            state.status = ConnectionStatus::Connected;
            state.reconnect_attempts = 0;
            state.last_event_time = Some(Utc::now());
            state.error_message = None;
        });
    }

    async fn on_frame(&mut self, frame: SseFrame) -> Option<StreamEnd> {
        self.last_event = Instant::now();
        self.shared.touch(&self.cancel);

        let event = match decode(&frame.data, Some(&frame.event)) {
            Ok(event) => event,
            Err(e) => {
                warn!("session {}: dropping malformed '{}' frame: {e}", self.epoch, frame.event);
                return None;
            }
        };
        if self.cancel.is_cancelled() {
            return Some(StreamEnd::Finished);
        }

        let kind = event.kind();
        debug!("session {}: {kind} event", self.epoch);
        if kind == EventKind::Complete {
            return Some(self.complete(event).await);
        }

        let control = Control::of(&event);
        self.shared.router().dispatch(&event);
        if self.cancel.is_cancelled() {
            return Some(StreamEnd::Finished);
        }

        if kind.is_stored() {
            self.queue.enqueue(event);
        }
        if should_flush_immediately(kind) {
            self.queue.flush(self.shared.store()).await;
        }

        match control {
            Control::Continue => None,
            Control::RetryAfter { wait, message } => {
                info!("session {}: server asked to retry in {wait:?}", self.epoch);
                self.shared.publish(&self.cancel, |state| {
                    state.status = ConnectionStatus::Reconnecting;
                    state.error_message = Some(message);
                });
                Some(StreamEnd::Reconnect(wait))
            }
            Control::Fatal(message) => {
                error!("session {}: server error: {message}", self.epoch);
                self.shared.publish(&self.cancel, |state| {
                    state.status = ConnectionStatus::Error;
                    state.error_message = Some(message);
                });
                Some(StreamEnd::Finished)
            }
        }
    }

    /// Flush, stop cleanly, then tell completion handlers.
    async fn complete(&mut self, event: StreamEvent) -> StreamEnd {
        let report = self.queue.flush(self.shared.store()).await;
        info!(
            "session {}: complete ({} events stored in final flush)",
            self.epoch, report.stored
        );

        self.shared.release(self.epoch);
        self.shared.publish(&self.cancel, |state| {
            state.status = ConnectionStatus::Disconnected;
            state.reconnect_attempts = 0;
            state.error_message = None;
        });
        if !self.cancel.is_cancelled() {
            self.shared.router().dispatch(&event);
        }
        StreamEnd::Finished
    }

    /// The channel is gone: reconnect if the budget allows, else give up.
    async fn on_failure(&mut self, reason: String) -> StreamEnd {
        if self.cancel.is_cancelled() {
            return StreamEnd::Finished;
        }
        self.queue.flush(self.shared.store()).await;

        if !self.backoff.has_attempts_left(self.attempts) {
            error!(
                "session {}: giving up after {} reconnect attempts: {reason}",
                self.epoch, self.attempts
            );
            return self
                .fail(format!(
                    "connection lost after {} reconnect attempts: {reason}",
                    self.attempts
                ))
                .await;
        }

        let wait = self.backoff.delay_for(self.attempts);
        self.attempts += 1;
        warn!(
            "session {}: {reason}; reconnect {}/{} in {wait:?}",
            self.epoch, self.attempts, self.backoff.max_attempts
        );
        let attempts = self.attempts;
        self.shared.publish(&self.cancel, |state| {
            state.status = ConnectionStatus::Reconnecting;
            state.reconnect_attempts = attempts;
            state.error_message = Some(reason);
        });
        StreamEnd::Reconnect(wait)
    }

    /// Terminal failure: state `error`, then one synthetic error event.
    async fn fail(&mut self, message: String) -> StreamEnd {
        let event = StreamEvent::connection_lost(message.clone());
        self.shared.publish(&self.cancel, |state| {
            state.status = ConnectionStatus::Error;
            state.error_message = Some(message);
        });
        if !self.cancel.is_cancelled() {
            self.shared.router().dispatch(&event);
            self.queue.enqueue(event);
            self.queue.flush(self.shared.store()).await;
        }
        StreamEnd::Finished
    }
}
