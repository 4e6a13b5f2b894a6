//! Change-notification registry for the embedded engine.

use super::{ChangeCallback, FetchRequest, NotificationHandle, Row};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// One registered request.
struct Registration {
    request: FetchRequest,
    callback: ChangeCallback,
    /// Last result set delivered (or the baseline taken at registration).
    last: Option<Vec<Row>>,
}

/// Tracks live registrations and re-evaluates them after each commit.
///
/// The registration map lock is held while callbacks run, so
/// [`unregister`](Self::unregister) waits for an in-flight delivery and no
/// callback fires for a handle after it has been removed.
pub struct NotificationRegistry {
    registrations: Mutex<HashMap<NotificationHandle, Registration>>,
    /// Counter for generating handles.
    next_id: AtomicU64,
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback. `baseline` is the result set the caller already
    /// knows about; a commit that leaves it unchanged does not notify.
    pub fn register(
        &self,
        request: FetchRequest,
        callback: ChangeCallback,
        baseline: Option<Vec<Row>>,
    ) -> NotificationHandle {
        let handle = NotificationHandle(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.registrations.lock().insert(
            handle,
            Registration {
                request,
                callback,
                last: baseline,
            },
        );
        handle
    }

    /// Remove a registration. Returns false if it was not registered.
    pub fn unregister(&self, handle: NotificationHandle) -> bool {
        self.registrations.lock().remove(&handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-run every registered request through `evaluate` and invoke the
    /// callbacks whose result set changed.
    pub fn notify<F>(&self, evaluate: F)
    where
        F: Fn(&FetchRequest) -> Vec<Row>,
    {
        let mut registrations = self.registrations.lock();
        for (handle, registration) in registrations.iter_mut() {
            let rows = evaluate(&registration.request);
            if registration.last.as_ref() == Some(&rows) {
                continue;
            }
            trace!(handle = handle.0, rows = rows.len(), "result set changed");
            (registration.callback)(&rows);
            registration.last = Some(rows);
        }
    }
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Predicate, RowId, SortOrder};
    use crate::types::Timestamp;
    use std::sync::Arc;

    fn request() -> FetchRequest {
        FetchRequest::new(Predicate::All, SortOrder::TimestampDescending)
    }

    fn counting_callback(counter: Arc<AtomicU64>) -> ChangeCallback {
        Box::new(move |_rows: &[Row]| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_register_unregister() {
        let registry = NotificationRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));

        let handle = registry.register(request(), counting_callback(counter.clone()), None);
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(handle));
        assert!(!registry.unregister(handle));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_notify_only_on_change() {
        let registry = NotificationRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));
        registry.register(request(), counting_callback(counter.clone()), Some(vec![]));

        // Unchanged from baseline
        registry.notify(|_| vec![]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        let rows = vec![Row {
            id: RowId(1),
            timestamp: Some(Timestamp(1)),
        }];
        registry.notify(|_| rows.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Same rows again
        registry.notify(|_| rows.clone());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_callback_not_invoked() {
        let registry = NotificationRegistry::new();
        let counter = Arc::new(AtomicU64::new(0));
        let handle = registry.register(request(), counting_callback(counter.clone()), None);
        registry.unregister(handle);

        registry.notify(|_| vec![]);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
