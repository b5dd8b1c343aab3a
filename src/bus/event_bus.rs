use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use super::EventKind;
use crate::connection::ConnectionState;
use crate::events::StreamEvent;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type EventHandler = dyn Fn(&StreamEvent) -> HandlerResult + Send + Sync;
type StateHandler = dyn Fn(&ConnectionState) -> HandlerResult + Send + Sync;

/// What a subscriber listens to: one event kind, or every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kind(EventKind),
    All,
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Topic::Kind(kind)
    }
}

/// Token returned by `subscribe*`; pass it to [`EventRouter::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber<H: ?Sized> {
    id: SubscriptionId,
    active: AtomicBool,
    handler: Box<H>,
}

impl<H: ?Sized> Subscriber<H> {
    fn new(id: SubscriptionId, handler: Box<H>) -> Arc<Self> {
        Arc::new(Self {
            id,
            active: AtomicBool::new(true),
            handler,
        })
    }
}

#[derive(Default)]
struct Routes {
    events: HashMap<Topic, Vec<Arc<Subscriber<EventHandler>>>>,
    state: Vec<Arc<Subscriber<StateHandler>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Routes decoded events to per-kind and wildcard subscribers, and connection
/// state transitions to state observers.
///
/// Handlers run synchronously on the dispatching task, exact-kind handlers
/// first and wildcard handlers second, each group in registration order. A
/// handler that errors or panics is logged and skipped; the rest still run.
/// The routing table is not locked while handlers run, so a handler may
/// subscribe or unsubscribe (itself or others) mid-dispatch.
pub struct EventRouter {
    routes: Mutex<Routes>,
    next_id: AtomicU64,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Routes::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, topic: impl Into<Topic>, handler: F) -> SubscriptionId
    where
        F: Fn(&StreamEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_id();
        let topic = topic.into();
        self.routes()
            .events
            .entry(topic)
            .or_default()
            .push(Subscriber::new(id, Box::new(handler)));
        tracing::trace!("subscription {id:?} added for {topic:?}");
        id
    }

    /// Forward matching events into a channel, for async consumers.
    pub fn subscribe_channel(
        &self,
        topic: impl Into<Topic>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(topic, move |event: &StreamEvent| {
            if tx.send(event.clone()).is_err() {
                tracing::trace!("channel subscriber dropped its receiver");
            }
            Ok(())
        });
        (id, rx)
    }

    pub fn subscribe_state<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ConnectionState) -> HandlerResult + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.routes()
            .state
            .push(Subscriber::new(id, Box::new(handler)));
        id
    }

    /// Remove a subscription. Returns false for unknown or already removed ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut routes = self.routes();
        for subscribers in routes.events.values_mut() {
            if let Some(pos) = subscribers.iter().position(|s| s.id == id) {
                let removed = subscribers.remove(pos);
                removed.active.store(false, Ordering::SeqCst);
                return true;
            }
        }
        if let Some(pos) = routes.state.iter().position(|s| s.id == id) {
            let removed = routes.state.remove(pos);
            removed.active.store(false, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub fn subscriber_count(&self, topic: impl Into<Topic>) -> usize {
        self.routes()
            .events
            .get(&topic.into())
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        let mut routes = self.routes();
        for subscriber in routes.events.values().flatten() {
            subscriber.active.store(false, Ordering::SeqCst);
        }
        for subscriber in &routes.state {
            subscriber.active.store(false, Ordering::SeqCst);
        }
        routes.events.clear();
        routes.state.clear();
    }

    pub fn dispatch(&self, event: &StreamEvent) -> DispatchReport {
        let kind = event.kind();
        let snapshot: Vec<Arc<Subscriber<EventHandler>>> = {
            let routes = self.routes();
            let exact = routes.events.get(&Topic::Kind(kind)).into_iter().flatten();
            let wildcard = routes.events.get(&Topic::All).into_iter().flatten();
            exact.chain(wildcard).cloned().collect()
        };

        let mut report = DispatchReport::default();
        for subscriber in snapshot {
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event)));
            record(&mut report, subscriber.id, kind.as_str(), outcome);
        }
        report
    }

    pub fn notify_state(&self, state: &ConnectionState) -> DispatchReport {
        let snapshot: Vec<Arc<Subscriber<StateHandler>>> = self.routes().state.clone();

        let mut report = DispatchReport::default();
        for subscriber in snapshot {
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(state)));
            record(&mut report, subscriber.id, "state_change", outcome);
        }
        report
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn record(
    report: &mut DispatchReport,
    id: SubscriptionId,
    label: &str,
    outcome: std::thread::Result<HandlerResult>,
) {
    match outcome {
        Ok(Ok(())) => report.delivered += 1,
        Ok(Err(e)) => {
            report.failed += 1;
            tracing::warn!("handler {id:?} failed on {label}: {e}");
        }
        Err(_) => {
            report.failed += 1;
            tracing::error!("handler {id:?} panicked on {label}");
        }
    }
}
