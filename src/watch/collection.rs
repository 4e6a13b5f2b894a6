//! Live, multi-subscriber view of one query.

use super::fanout::{SnapshotFanout, SnapshotStream};
use super::observer::ChangeObserver;
use super::WatchConfig;
use crate::error::Result;
use crate::store::{FetchRequest, FromRow, Store};
use std::sync::Arc;

/// A watched query.
///
/// Owns its observer and its fan-out. Dropping the collection unregisters
/// the observer from the store and ends every stream handed out.
pub struct WatchedCollection<T> {
    // Declared first so it unregisters before the fan-out goes away.
    observer: ChangeObserver<T>,
    fanout: Arc<SnapshotFanout<T>>,
}

impl<T> WatchedCollection<T>
where
    T: FromRow + Clone + Send + 'static,
{
    /// Build the collection and start observing `request` on `store`.
    pub fn new(request: FetchRequest, store: Arc<dyn Store>, config: WatchConfig) -> Result<Self> {
        let fanout = Arc::new(SnapshotFanout::new(config));
        let observer = ChangeObserver::new(store, request);
        observer.start(Arc::downgrade(&fanout))?;
        Ok(Self { observer, fanout })
    }

    /// Attach a new subscriber.
    ///
    /// The stream yields the current result set first, then every later
    /// snapshot in the order the store reports them.
    pub fn stream(&self) -> SnapshotStream<T> {
        self.fanout.subscribe(|| self.observer.initial_values())
    }

    /// Current result set, without subscribing.
    pub fn current(&self) -> Vec<T> {
        self.observer.initial_values()
    }

    pub fn request(&self) -> &FetchRequest {
        self.observer.request()
    }

    pub fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }

    pub fn is_observing(&self) -> bool {
        self.observer.is_running()
    }
}
