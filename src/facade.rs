//! The persistence facade handed to application code.

use crate::error::Result;
use crate::store::{
    self, FetchRequest, FromRow, NewRow, Predicate, SortOrder, Store, StoreConfig,
};
use crate::types::{Query, Record, Snapshot, Timestamp};
use crate::watch::{ChangeObserver, SnapshotStream, WatchConfig, WatchedCollection};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Unique identifier for a watch established through a facade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

type WatcherRegistry = Mutex<HashMap<WatchId, WatchedCollection<Record>>>;

/// Creates, deletes and watches records on a store.
///
/// Every write runs as one unit of work on the store. Live watches are kept
/// in a registry keyed by [`WatchId`] until they are cancelled.
pub struct PersistenceFacade {
    store: Arc<dyn Store>,
    /// Live watches by ID.
    watchers: Arc<WatcherRegistry>,
    /// Counter for generating watch IDs.
    next_watch_id: AtomicU64,
    watch_config: WatchConfig,
}

impl PersistenceFacade {
    /// Open the store described by `config`.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Ok(Self::with_store(store::open(&config)?))
    }

    /// Use an already opened store.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            watchers: Arc::new(Mutex::new(HashMap::new())),
            next_watch_id: AtomicU64::new(1),
            watch_config: WatchConfig::default(),
        }
    }

    /// Delivery policy for watches established from now on.
    pub fn with_watch_config(mut self, config: WatchConfig) -> Self {
        self.watch_config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // --- Writes ---

    /// Insert a record at `timestamp`.
    pub fn create(&self, timestamp: Timestamp) -> Result<Record> {
        let record = self.store.transact(|uow| {
            let row = uow.insert(NewRow::at(timestamp))?;
            Record::from_row(&row)
        })?;
        debug!(timestamp = %timestamp, "record created");
        Ok(record)
    }

    /// Delete the record with timestamp `id`. Deleting a missing record
    /// succeeds and does nothing.
    pub fn delete(&self, id: Timestamp) -> Result<()> {
        let request = FetchRequest::new(Predicate::TimestampEq(id), SortOrder::TimestampDescending)
            .with_limit(1);

        let deleted = self.store.transact(|uow| {
            match uow.fetch(&request)?.into_iter().next() {
                Some(row) => uow
                    .delete_where(&Predicate::RowIds(vec![row.id]))
                    .map(|removed| removed > 0),
                None => Ok(false),
            }
        })?;

        debug!(timestamp = %id, deleted, "record delete");
        Ok(())
    }

    /// Delete every record, returning how many were removed.
    ///
    /// Meant for resetting fixtures.
    pub fn destroy_all(&self) -> Result<usize> {
        let removed = self
            .store
            .transact(|uow| uow.delete_where(&Predicate::All))?;
        debug!(removed, "all records destroyed");
        Ok(removed)
    }

    // --- Reads ---

    /// Current result of `query`. Rows that do not convert are dropped the
    /// same way a watch drops them.
    pub fn items(&self, query: Query) -> Result<Snapshot> {
        let rows = self.store.fetch(&query.fetch_request())?;
        Ok(ChangeObserver::<Record>::transform(&rows))
    }

    /// Start watching `query`.
    ///
    /// The returned [`Watch`] yields the current result set and then every
    /// later one. Cancelling or dropping it releases the watch.
    ///
    /// With the default unbounded [`WatchConfig`] every commit queues a full
    /// snapshot until it is read, so keep reading or drop the watch. With a
    /// bound, an overflowing watch goes inactive but stays registered (and
    /// keeps its store observer) until it is dropped or cancelled.
    pub fn watch(&self, query: Query) -> Result<Watch> {
        let collection = WatchedCollection::new(
            query.fetch_request(),
            Arc::clone(&self.store),
            self.watch_config.clone(),
        )?;
        let stream = collection.stream();

        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::SeqCst));
        self.watchers.lock().insert(id, collection);
        debug!(watch = id.0, ?query, "watch established");

        Ok(Watch {
            id,
            stream,
            watchers: Arc::downgrade(&self.watchers),
        })
    }

    /// Release the watch `id`. Returns false if it was not live.
    pub fn cancel(&self, id: WatchId) -> bool {
        release(&self.watchers, id)
    }

    /// Number of live watches.
    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }
}

/// Remove a watch from the registry and tear it down.
fn release(watchers: &WatcherRegistry, id: WatchId) -> bool {
    let removed = watchers.lock().remove(&id);
    // Tear down outside the registry lock.
    match removed {
        Some(collection) => {
            drop(collection);
            debug!(watch = id.0, "watch cancelled");
            true
        }
        None => false,
    }
}

/// A live watch on a query.
///
/// Iterating blocks for the next snapshot. Dropping the watch cancels it.
pub struct Watch {
    id: WatchId,
    stream: SnapshotStream<Record>,
    watchers: Weak<WatcherRegistry>,
}

impl Watch {
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Next snapshot if one is ready (non-blocking).
    pub fn try_next(&mut self) -> Option<Snapshot> {
        self.stream.try_next()
    }

    /// Next snapshot, waiting at most `timeout`.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<Snapshot> {
        self.stream.next_timeout(timeout)
    }

    /// False once the watch has been cancelled.
    pub fn is_active(&self) -> bool {
        self.stream.is_active()
    }

    /// Stop the watch and unregister it from the store.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Iterator for Watch {
    type Item = Snapshot;

    fn next(&mut self) -> Option<Snapshot> {
        self.stream.next()
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(watchers) = self.watchers.upgrade() {
            release(&watchers, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn facade() -> PersistenceFacade {
        PersistenceFacade::open(StoreConfig::in_memory()).unwrap()
    }

    fn records(timestamps: &[i64]) -> Snapshot {
        timestamps.iter().map(|&ts| Record::new(Timestamp(ts))).collect()
    }

    #[test]
    fn test_create_returns_record() {
        let facade = facade();
        let record = facade.create(Timestamp(10)).unwrap();
        assert_eq!(record, Record::new(Timestamp(10)));
        assert_eq!(record.id(), Timestamp(10));
    }

    #[test]
    fn test_create_duplicate_fails() {
        let facade = facade();
        facade.create(Timestamp(10)).unwrap();

        let result = facade.create(Timestamp(10));
        assert!(matches!(result, Err(StoreError::DuplicateTimestamp(_))));
        assert!(result.unwrap_err().is_write_failure());
        assert_eq!(facade.items(Query::All).unwrap(), records(&[10]));
    }

    #[test]
    fn test_delete_removes_only_match() {
        let facade = facade();
        facade.create(Timestamp(1)).unwrap();
        facade.create(Timestamp(2)).unwrap();

        facade.delete(Timestamp(1)).unwrap();
        assert_eq!(facade.items(Query::All).unwrap(), records(&[2]));
    }

    #[test]
    fn test_items_and_watch_drop_the_same_rows() {
        let facade = facade();
        facade.create(Timestamp(3)).unwrap();
        facade
            .store()
            .transact(|uow| uow.insert(NewRow::default()))
            .unwrap();
        facade.create(Timestamp(5)).unwrap();

        let mut watch = facade.watch(Query::All).unwrap();
        let items = facade.items(Query::All).unwrap();
        assert_eq!(items, records(&[5, 3]));
        assert_eq!(watch.try_next(), Some(items));
    }

    #[test]
    fn test_cancel_by_id() {
        let facade = facade();
        let mut watch = facade.watch(Query::All).unwrap();
        assert_eq!(facade.watcher_count(), 1);

        assert!(facade.cancel(watch.id()));
        assert!(!facade.cancel(watch.id()));
        assert_eq!(facade.watcher_count(), 0);

        // Even the unread initial snapshot is withheld after cancellation
        assert!(!watch.is_active());
        assert_eq!(watch.try_next(), None);
    }

    #[test]
    fn test_watch_ids_are_unique() {
        let facade = facade();
        let a = facade.watch(Query::All).unwrap();
        let b = facade.watch(Query::All).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(facade.watcher_count(), 2);

        drop(a);
        assert_eq!(facade.watcher_count(), 1);
        b.cancel();
        assert_eq!(facade.watcher_count(), 0);
    }

    #[test]
    fn test_watch_outliving_facade() {
        let facade = facade();
        let mut watch = facade.watch(Query::All).unwrap();
        drop(facade);

        assert_eq!(watch.next(), None);
    }
}
