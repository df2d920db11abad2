//! Change notification for cache consumers.
//!
//! [`ChangeNotifier`] pairs a session-wide version counter with a
//! fire-and-forget broadcast of [`CacheEvent`]s. Consumers either poll the
//! version to decide when to re-derive dependent views (badge counts,
//! summaries) or subscribe to events. Delivery is at-most-once: events
//! published while nobody listens, or that a lagging subscriber falls behind
//! on, are gone.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

use super::key::CacheKey;

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Tasks,
    History,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A key's entry changed: loading started, data arrived, fetch failed,
    /// or it was restored from disk
    TasksChanged { key: CacheKey },
    /// An optimistic status edit was applied locally
    TaskStatusChanged { key: CacheKey, task_id: String },
    /// Every entry was dropped
    Cleared,
    /// A history range finished loading
    HistoryLoaded { range: String },
}

impl CacheEvent {
    /// `Cleared` concerns every topic.
    pub fn matches(&self, topic: Topic) -> bool {
        match self {
            CacheEvent::TasksChanged { .. } | CacheEvent::TaskStatusChanged { .. } => {
                topic == Topic::Tasks
            }
            CacheEvent::HistoryLoaded { .. } => topic == Topic::History,
            CacheEvent::Cleared => true,
        }
    }
}

pub struct ChangeNotifier {
    version: AtomicU64,
    tx: broadcast::Sender<CacheEvent>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            version: AtomicU64::new(0),
            tx,
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Record a cache mutation, returning the new version.
    pub fn bump(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn publish(&self, event: CacheEvent) {
        // Err only means nobody is subscribed right now
        if self.tx.send(event).is_err() {
            trace!("Cache event published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    /// Run `handler` for every event on `topic` until the notifier is dropped.
    pub fn subscribe_topic<F>(&self, topic: Topic, handler: F) -> JoinHandle<()>
    where
        F: Fn(CacheEvent) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.matches(topic) => handler(event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(?topic, missed = missed, "Cache event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
