//! Bridge from store change notifications to a snapshot fan-out.

use super::fanout::SnapshotFanout;
use crate::error::{Result, StoreError};
use crate::store::{ChangeCallback, FetchRequest, FromRow, NotificationHandle, Row, Store};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Registration lifecycle of an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ObserverState {
    Idle,
    Running(NotificationHandle),
    Stopped,
}

/// Watches one fetch request on a store and pushes converted snapshots to a
/// target fan-out.
///
/// The observer only holds a weak reference to its target; the target's
/// owner controls its lifetime.
pub struct ChangeObserver<T> {
    store: Arc<dyn Store>,
    request: FetchRequest,
    state: Mutex<ObserverState>,
    _value: PhantomData<fn() -> T>,
}

impl<T> ChangeObserver<T> {
    pub fn request(&self) -> &FetchRequest {
        &self.request
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), ObserverState::Running(_))
    }

    /// Unregister from the store. Safe to call more than once.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let ObserverState::Running(handle) = *state {
            self.store.unregister(handle);
            debug!(handle = handle.0, "observer stopped");
        }
        *state = ObserverState::Stopped;
    }
}

impl<T> ChangeObserver<T>
where
    T: FromRow + Clone + Send + 'static,
{
    /// Build an observer for `request`. Nothing is registered until
    /// [`start`](Self::start).
    pub fn new(store: Arc<dyn Store>, request: FetchRequest) -> Self {
        Self {
            store,
            request,
            state: Mutex::new(ObserverState::Idle),
            _value: PhantomData,
        }
    }

    /// Register with the store and deliver every change to `target`.
    ///
    /// An observer starts at most once; later calls fail with
    /// [`StoreError::ObserverAlreadyStarted`].
    pub fn start(&self, target: Weak<SnapshotFanout<T>>) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ObserverState::Idle {
            return Err(StoreError::ObserverAlreadyStarted);
        }

        let callback: ChangeCallback =
            Box::new(move |rows: &[Row]| Self::on_store_changed(&target, rows));
        let handle = self
            .store
            .register_change_notification(self.request.clone(), callback);
        *state = ObserverState::Running(handle);

        debug!(handle = handle.0, request = ?self.request, "observer started");
        Ok(())
    }

    /// Current result set read straight from the store.
    ///
    /// A failed fetch yields an empty snapshot.
    pub fn initial_values(&self) -> Vec<T> {
        match self.store.fetch(&self.request) {
            Ok(rows) => Self::transform(&rows),
            Err(e) => {
                warn!(error = %e, request = ?self.request, "initial fetch failed");
                Vec::new()
            }
        }
    }

    /// Convert rows, dropping the ones that do not convert.
    pub fn transform(rows: &[Row]) -> Vec<T> {
        rows.iter()
            .filter_map(|row| match T::from_row(row) {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(row = %row.id, error = %e, "dropping unconvertible row");
                    None
                }
            })
            .collect()
    }

    fn on_store_changed(target: &Weak<SnapshotFanout<T>>, rows: &[Row]) {
        if let Some(target) = target.upgrade() {
            target.broadcast(Self::transform(rows));
        }
    }
}

impl<T> Drop for ChangeObserver<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
