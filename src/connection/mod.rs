//! Connection manager: owns the push channel's lifecycle.
//!
//! `start()` spawns one driver task per session. The driver owns the
//! transport stream, the heartbeat and debounce timers, and the event queue,
//! and runs them in a single `tokio::select!` loop (see `driver.rs`).
//! `start()` and `stop()` are synchronous: they flip shared state and signal
//! the driver, they never wait on it.
//!
//! # State machine
//!
//! ```text
//! disconnected -> connecting -> connected -> reconnecting -> connecting ...
//!                      |            |
//!                      +-> error <--+          (any) -> disconnected on stop()
//! ```

mod backoff;
mod driver;
mod state;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use backoff::{
    BackoffPolicy, DEFAULT_JITTER, DEFAULT_MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY_MS,
    RECONNECT_MAX_DELAY_MS,
};
pub use state::{ConnectionState, ConnectionStatus};

use crate::bus::{EventKind, EventRouter, HandlerResult, SubscriptionId, Topic};
use crate::config::{ConfigError, StreamConfig};
use crate::events::StreamEvent;
use crate::store::StoreHandle;
use crate::transport::{
    build_stream_url, ReadyState, SseTransport, StreamRequest, Transport, TransportError,
};
use crate::AppError;

use driver::Driver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// A session was already connecting, connected or reconnecting.
    AlreadyActive,
}

/// Cancellation flag plus wakeup for one session's driver.
#[derive(Debug, Clone)]
pub(crate) struct CancelSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

struct SessionHandle {
    epoch: u64,
    cancel: CancelSignal,
    task: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    config: StreamConfig,
    transport: Arc<dyn Transport>,
    router: EventRouter,
    store: StoreHandle,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<SessionHandle>>,
    next_epoch: AtomicU64,
}

impl Shared {
    fn lock_session(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a state change for a running session and notify observers.
    /// Does nothing once the session has been cancelled.
    pub(crate) fn publish<F>(&self, cancel: &CancelSignal, update: F) -> bool
    where
        F: FnOnce(&mut ConnectionState),
    {
        let mut transition = None;
        let changed = self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            let before = state.status;
            update(state);
            transition = Some((before, state.status));
            true
        });
        if !changed {
            return false;
        }

        if let Some((from, to)) = transition {
            if from != to {
                if from.can_transition_to(to) {
                    debug!("connection {from} -> {to}");
                } else {
                    warn!("unexpected connection transition {from} -> {to}");
                }
            }
        }
        self.notify_observers(cancel);
        true
    }

    /// Record liveness without notifying observers.
    pub(crate) fn touch(&self, cancel: &CancelSignal) {
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            state.last_event_time = Some(chrono::Utc::now());
            true
        });
    }

    fn notify_observers(&self, cancel: &CancelSignal) {
        if cancel.is_cancelled() {
            return;
        }
        let snapshot = self.state.borrow().clone();
        self.router.notify_state(&snapshot);
    }

    /// Drop the session slot if it still belongs to `epoch`.
    pub(crate) fn release(&self, epoch: u64) {
        let mut slot = self.lock_session();
        if slot.as_ref().is_some_and(|handle| handle.epoch == epoch) {
            slot.take();
        }
    }

    pub(crate) fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub(crate) fn router(&self) -> &EventRouter {
        &self.router
    }

    pub(crate) fn store(&self) -> &StoreHandle {
        &self.store
    }
}

/// Client side of the agent event stream.
///
/// Must be used from within a tokio runtime: `start()` spawns the session
/// driver. Handlers registered through `on*` run on the driver task, in
/// frame order, and must not block.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Rejects configurations the driver cannot run with (zero heartbeat
    /// interval, non-http base URL, ...).
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn Transport>,
        store: StoreHandle,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::default());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                transport,
                router: EventRouter::new(),
                store,
                state,
                session: Mutex::new(None),
                next_epoch: AtomicU64::new(1),
            }),
        })
    }

    /// Manager over the reqwest SSE transport.
    pub fn with_sse(config: StreamConfig, store: StoreHandle) -> Result<Self, AppError> {
        let transport = SseTransport::new(config.connect_timeout())?;
        Ok(Self::new(config, Arc::new(transport), store)?)
    }

    /// Open the channel for `request`. A no-op while a session is live.
    pub fn start(&self, request: &StreamRequest) -> Result<StartOutcome, TransportError> {
        let shared = &self.shared;
        let mut request = request.clone();
        if request.model.is_none() {
            request.model = shared.config.default_model.clone();
        }
        let url = build_stream_url(&shared.config.base_url, &request)?;

        let cancel = CancelSignal::new();
        let epoch = shared.next_epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut slot = shared.lock_session();
            let status = shared.state.borrow().status;
            if status.is_active() {
                warn!("start() ignored: connection is already {status}");
                return Ok(StartOutcome::AlreadyActive);
            }
            // A session that reached a terminal state may still be unwinding.
            if let Some(previous) = slot.take() {
                previous.cancel.cancel();
            }
            shared.state.send_modify(|state| {
                *state = ConnectionState {
                    status: ConnectionStatus::Connecting,
                    ..ConnectionState::default()
                };
            });
            *slot = Some(SessionHandle {
                epoch,
                cancel: cancel.clone(),
                task: None,
            });
        }
        info!(
            "starting stream session {epoch} (session_id={:?})",
            request.session_id
        );
        shared.notify_observers(&cancel);

        let mut slot = shared.lock_session();
        match slot.as_mut() {
            Some(handle) if handle.epoch == epoch && !cancel.is_cancelled() => {
                let driver = Driver::new(Arc::clone(shared), epoch, cancel, url);
                handle.task = Some(tokio::spawn(driver.run()));
            }
            _ => debug!("session {epoch} was stopped before its driver started"),
        }
        Ok(StartOutcome::Started)
    }

    /// Close the channel and cancel all timers. Safe from any state; a second
    /// call is a no-op and notifies nobody.
    pub fn stop(&self) {
        let session = self.shared.lock_session().take();
        if let Some(session) = &session {
            session.cancel.cancel();
        }

        let changed = self.shared.state.send_if_modified(|state| {
            if state.status == ConnectionStatus::Disconnected {
                return false;
            }
            *state = ConnectionState {
                last_event_time: state.last_event_time,
                ..ConnectionState::default()
            };
            true
        });
        if changed {
            info!("stream stopped");
            let snapshot = self.shared.state.borrow().clone();
            self.shared.router.notify_state(&snapshot);
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.router.subscribe(kind, handler)
    }

    pub fn on_any<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.router.subscribe(Topic::All, handler)
    }

    pub fn on_error<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(EventKind::Error, handler)
    }

    pub fn on_complete<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.on(EventKind::Complete, handler)
    }

    pub fn on_state_change<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionState) -> HandlerResult + Send + Sync + 'static,
    {
        self.shared.router.subscribe_state(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.router.unsubscribe(id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that observes every state change, for async consumers.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.shared.state.borrow().status.ready_state()
    }

    pub fn store(&self) -> &StoreHandle {
        &self.shared.store
    }

    pub fn router(&self) -> &EventRouter {
        &self.shared.router
    }

    pub fn config(&self) -> &StreamConfig {
        &self.shared.config
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.shared.lock_session().take() {
            session.cancel.cancel();
            if let Some(task) = session.task {
                task.abort();
            }
        }
    }
}
