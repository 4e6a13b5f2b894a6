//! Fan-out of snapshots to every attached subscriber.

use super::WatchConfig;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{trace, warn};

/// Unique identifier for a subscriber of one fan-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberId(pub u64);

/// Internal subscriber state.
struct Subscriber<T> {
    sender: Sender<Vec<T>>,
    /// Cleared when the fan-out is torn down so buffered snapshots are not
    /// handed out afterwards.
    active: Arc<AtomicBool>,
}

/// Broadcasts each snapshot to all attached subscribers.
pub struct SnapshotFanout<T> {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber<T>>>,
    /// Counter for generating subscriber IDs.
    next_id: AtomicU64,
    config: WatchConfig,
}

impl<T> SnapshotFanout<T> {
    /// Detach a subscriber. Returns false if it was not attached.
    pub fn detach(&self, id: SubscriberId) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<T: Clone> SnapshotFanout<T> {
    pub fn new(config: WatchConfig) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config,
        }
    }

    /// Attach a new subscriber whose stream starts with `seed()`.
    ///
    /// `seed` runs while the subscriber map is write-locked, so no broadcast
    /// can slip in between reading the initial snapshot and attaching.
    pub fn subscribe<F>(self: &Arc<Self>, seed: F) -> SnapshotStream<T>
    where
        F: FnOnce() -> Vec<T>,
    {
        let mut subscribers = self.subscribers.write();

        let initial = seed();
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = match self.config.buffer_size {
            Some(size) => bounded(size),
            None => unbounded(),
        };
        let active = Arc::new(AtomicBool::new(true));

        subscribers.insert(
            id,
            Subscriber {
                sender,
                active: Arc::clone(&active),
            },
        );
        trace!(subscriber = id.0, "subscriber attached");

        SnapshotStream {
            id,
            initial: Some(initial),
            receiver,
            active,
            fanout: Arc::downgrade(self),
        }
    }

    /// Send `snapshot` to every subscriber. Subscribers that went away or
    /// whose buffer is full are detached.
    pub fn broadcast(&self, snapshot: Vec<T>) {
        let mut to_remove = Vec::new();

        {
            let subscribers = self.subscribers.read();
            for (id, subscriber) in subscribers.iter() {
                match subscriber.sender.try_send(snapshot.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(subscriber = id.0, "subscriber buffer full, detaching");
                        to_remove.push(*id);
                    }
                    Err(TrySendError::Disconnected(_)) => to_remove.push(*id),
                }
            }
        }

        if !to_remove.is_empty() {
            let mut subscribers = self.subscribers.write();
            for id in to_remove {
                if let Some(subscriber) = subscribers.remove(&id) {
                    subscriber.active.store(false, Ordering::SeqCst);
                }
            }
        }
    }
}

impl<T> Drop for SnapshotFanout<T> {
    fn drop(&mut self) {
        for subscriber in self.subscribers.get_mut().values() {
            subscriber.active.store(false, Ordering::SeqCst);
        }
    }
}

/// One subscriber's view: the initial snapshot, then every live snapshot.
///
/// Iteration blocks until the next snapshot arrives and ends once the
/// subscriber is detached or the collection is torn down.
pub struct SnapshotStream<T> {
    id: SubscriberId,
    initial: Option<Vec<T>>,
    receiver: Receiver<Vec<T>>,
    active: Arc<AtomicBool>,
    fanout: Weak<SnapshotFanout<T>>,
}

impl<T> SnapshotStream<T> {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// False once the stream will yield nothing more.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Next snapshot if one is ready (non-blocking).
    pub fn try_next(&mut self) -> Option<Vec<T>> {
        if !self.is_active() {
            return None;
        }
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        let snapshot = self.receiver.try_recv().ok()?;
        self.is_active().then_some(snapshot)
    }

    /// Next snapshot, waiting at most `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Vec<T>> {
        if !self.is_active() {
            return None;
        }
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        match self.receiver.recv_timeout(timeout) {
            Ok(snapshot) => self.is_active().then_some(snapshot),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl<T> Iterator for SnapshotStream<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Vec<T>> {
        if !self.is_active() {
            return None;
        }
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        let snapshot = self.receiver.recv().ok()?;
        self.is_active().then_some(snapshot)
    }
}

impl<T> Drop for SnapshotStream<T> {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.detach(self.id);
        }
    }
}
