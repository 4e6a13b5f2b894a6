//! Storage collaborator behind the facade.
//!
//! The facade never talks to a concrete engine. It needs four things from a
//! store:
//! - serialized units of work that insert and delete rows atomically
//! - a synchronous fetch for a [`FetchRequest`]
//! - change notifications for a registered request, delivered with the full
//!   new result set
//! - a way to unregister those notifications
//!
//! [`EmbeddedStore`] is the engine shipped with the crate. It keeps rows in
//! memory and, unless configured as in-memory, mirrors every committed unit
//! of work into an append-only [`Journal`].
//!
//! # Example
//!
//! ```ignore
//! let store = store::open(&StoreConfig::in_memory())?;
//! let row = store.transact(|uow| uow.insert(NewRow::at(Timestamp::now())))?;
//! let all = store.fetch(&Query::All.fetch_request())?;
//! ```

mod embedded;
mod journal;
mod notify;

pub use embedded::{EmbeddedStore, StoreConfig};
pub use journal::{Journal, JournalEntry, JournalOp};
pub use notify::NotificationRegistry;

use crate::error::{Result, StoreError};
use crate::types::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Engine-assigned identifier of a stored row.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RowId({})", self.0)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A raw row as the engine stores it.
///
/// The timestamp column is nullable at the engine level; value types decide
/// whether they can be built from such a row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub timestamp: Option<Timestamp>,
}

/// Input for inserting a row (before an id is assigned).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NewRow {
    pub timestamp: Option<Timestamp>,
}

impl NewRow {
    pub fn at(timestamp: Timestamp) -> Self {
        Self {
            timestamp: Some(timestamp),
        }
    }
}

/// Conversion from a raw row into a value type.
///
/// Must be pure. A failure only drops that row from a snapshot.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Result<Self>;
}

/// Row filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    All,
    TimestampEq(Timestamp),
    RowIds(Vec<RowId>),
}

impl Predicate {
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::All => true,
            Predicate::TimestampEq(ts) => row.timestamp == Some(*ts),
            Predicate::RowIds(ids) => ids.contains(&row.id),
        }
    }
}

/// Result ordering. Rows without a timestamp always sort last.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    TimestampAscending,
    TimestampDescending,
}

impl SortOrder {
    pub fn compare(self, a: &Row, b: &Row) -> Ordering {
        let by_timestamp = match (a.timestamp, b.timestamp) {
            (Some(x), Some(y)) => match self {
                SortOrder::TimestampAscending => x.cmp(&y),
                SortOrder::TimestampDescending => y.cmp(&x),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_timestamp.then_with(|| a.id.cmp(&b.id))
    }
}

/// Engine-level description of what to fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub predicate: Predicate,
    pub sort: SortOrder,
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new(predicate: Predicate, sort: SortOrder) -> Self {
        Self {
            predicate,
            sort,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the request against a set of rows.
    pub fn apply<'a>(&self, rows: impl IntoIterator<Item = &'a Row>) -> Vec<Row> {
        let mut matched: Vec<Row> = rows
            .into_iter()
            .filter(|row| self.predicate.matches(row))
            .cloned()
            .collect();
        matched.sort_by(|a, b| self.sort.compare(a, b));
        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Callback invoked with the full new result set of a registered request.
pub type ChangeCallback = Box<dyn Fn(&[Row]) + Send + Sync>;

/// Handle returned by [`Store::register_change_notification`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NotificationHandle(pub u64);

/// Operations available inside one unit of work.
pub trait UnitOfWork {
    /// Insert a row. Fails with [`StoreError::DuplicateTimestamp`] if a live
    /// row already has the same timestamp.
    fn insert(&mut self, row: NewRow) -> Result<Row>;

    /// Delete every matching row, returning how many were removed.
    fn delete_where(&mut self, predicate: &Predicate) -> Result<usize>;

    /// Fetch as seen from inside this unit of work.
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>>;
}

/// An abstract storage engine.
pub trait Store: Send + Sync {
    /// Run `work` as one serialized, atomic unit of work. If it returns an
    /// error nothing it did is applied.
    fn perform(&self, work: &mut dyn FnMut(&mut dyn UnitOfWork) -> Result<()>) -> Result<()>;

    /// Read the current result set for a request.
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<Row>>;

    /// Invoke `callback` with the new result set every time a committed unit
    /// of work changes the result of `request`.
    fn register_change_notification(
        &self,
        request: FetchRequest,
        callback: ChangeCallback,
    ) -> NotificationHandle;

    /// Stop notifications for `handle`. Once this returns the callback is not
    /// running and will not run again.
    fn unregister(&self, handle: NotificationHandle);
}

impl dyn Store {
    /// Run a unit of work that produces a value.
    pub fn transact<R>(&self, work: impl FnOnce(&mut dyn UnitOfWork) -> Result<R>) -> Result<R> {
        let mut work = Some(work);
        let mut output = None;
        self.perform(&mut |uow| {
            let work = work
                .take()
                .ok_or_else(|| StoreError::WriteFailed("unit of work ran twice".into()))?;
            output = Some(work(uow)?);
            Ok(())
        })?;
        output.ok_or_else(|| StoreError::WriteFailed("unit of work did not run".into()))
    }
}

/// Open the engine described by `config`.
pub fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(EmbeddedStore::open(config.clone())?))
}
