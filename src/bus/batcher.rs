use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::events::StreamEvent;
use crate::store::{ApplyOutcome, StoreHandle};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_CHUNK_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub chunks: usize,
}

/// Pending-event queue between the router and the store.
///
/// `enqueue` only buffers and (re)arms a single debounce deadline; the owner
/// calls [`EventQueue::flush`] once [`EventQueue::deadline`] passes, or right
/// away for terminal events. A flush takes the whole pending queue, so events
/// enqueued after it starts belong to the next flush.
#[derive(Debug)]
pub struct EventQueue {
    pending: VecDeque<StreamEvent>,
    debounce: Duration,
    chunk_size: usize,
    deadline: Option<Instant>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE, DEFAULT_CHUNK_SIZE)
    }
}

impl EventQueue {
    pub fn new(debounce: Duration, chunk_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            debounce,
            chunk_size: chunk_size.max(1),
            deadline: None,
        }
    }

    pub fn enqueue(&mut self, event: StreamEvent) {
        self.pending.push_back(event);
        self.deadline = Some(Instant::now() + self.debounce);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the debounce window closes; `None` when nothing is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drop pending events without touching the store. Returns how many.
    pub fn discard(&mut self) -> usize {
        self.deadline = None;
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Apply everything pending to the store, `chunk_size` events per write
    /// lock, yielding to the runtime between chunks.
    pub async fn flush(&mut self, store: &StoreHandle) -> FlushReport {
        self.deadline = None;
        let batch: Vec<StreamEvent> = self.pending.drain(..).collect();
        let mut report = FlushReport::default();
        if batch.is_empty() {
            return report;
        }

        let total = batch.len();
        let mut remaining = batch.into_iter();
        loop {
            let chunk: Vec<StreamEvent> = remaining.by_ref().take(self.chunk_size).collect();
            if chunk.is_empty() {
                break;
            }

            {
                let mut guard = store.write();
                for event in chunk {
                    match guard.apply_event(event) {
                        ApplyOutcome::Stored => report.stored += 1,
                        ApplyOutcome::Duplicate => report.duplicates += 1,
                        ApplyOutcome::Skipped => report.skipped += 1,
                    }
                }
            }
            report.chunks += 1;

            if !remaining.as_slice().is_empty() {
                tokio::task::yield_now().await;
            }
        }

        tracing::debug!(
            "flushed {total} events in {} chunks ({} stored, {} duplicate)",
            report.chunks,
            report.stored,
            report.duplicates
        );
        report
    }
}

/// Resolves when the queue's debounce deadline passes; never when idle.
pub async fn debounce_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
