//! Subscriber registry and snapshot fan-out.
//!
//! Each subscriber is a bounded channel; the transport task that owns the
//! connection drains it. Publishing never waits on a slow subscriber: a full
//! channel drops that one update, a closed channel removes the subscriber.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::snapshot::TelemetrySnapshot;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 16;

/// Receiving half handed to the connection task. Payloads are UTF-8 JSON.
pub type SubscriberReceiver = mpsc::Receiver<Arc<str>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one publish call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    /// Subscribers whose buffer was full; they miss this update only.
    pub dropped: usize,
    /// Subscribers found disconnected and deregistered.
    pub removed: usize,
}

#[derive(Debug)]
pub struct BroadcastHub {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Arc<str>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
        }
    }

    pub fn register(&self) -> (SubscriberId, SubscriberReceiver) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.buffer);
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id, tx);
            subscribers.len()
        };
        info!(subscriber = %id, count, "Subscriber registered");
        (id, rx)
    }

    pub fn deregister(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subscribers = self.subscribers.lock();
            let removed = subscribers.remove(&id).is_some();
            (removed, subscribers.len())
        };
        if removed {
            info!(subscriber = %id, count, "Subscriber deregistered");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Serialize `snapshot` once and offer it to every subscriber.
    pub fn publish(&self, snapshot: &TelemetrySnapshot) -> Result<PublishReport, HubError> {
        let payload: Arc<str> = Arc::from(serde_json::to_string(snapshot)?);
        let mut report = PublishReport::default();
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.lock();
            for (id, tx) in subscribers.iter() {
                match tx.try_send(Arc::clone(&payload)) {
                    Ok(()) => report.delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(subscriber = %id, "Subscriber lagging; dropping update");
                        report.dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        for id in closed {
            warn!(subscriber = %id, "Send to subscriber failed; deregistering");
            if self.deregister(id) {
                report.removed += 1;
            }
        }

        Ok(report)
    }

    /// Offer `snapshot` to a single subscriber, e.g. right after it connects.
    pub fn publish_to(
        &self,
        id: SubscriberId,
        snapshot: &TelemetrySnapshot,
    ) -> Result<bool, HubError> {
        let payload: Arc<str> = Arc::from(serde_json::to_string(snapshot)?);
        let sent = self
            .subscribers
            .lock()
            .get(&id)
            .map(|tx| tx.try_send(payload).is_ok())
            .unwrap_or(false);
        Ok(sent)
    }
}
