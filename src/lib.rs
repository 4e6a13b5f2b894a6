//! # Record Facade
//!
//! A persistence facade over timestamped records: application code creates,
//! deletes and watches records without depending on a storage engine.
//!
//! ## Core Concepts
//!
//! - **Records**: immutable values keyed by their timestamp
//! - **Store**: the engine behind the facade (units of work, fetches and
//!   change notifications)
//! - **Watches**: live streams that yield the full current result set of a
//!   query, first on attach and then after every change
//!
//! ## Example
//!
//! ```ignore
//! use record_facade::{PersistenceFacade, Query, StoreConfig, Timestamp};
//!
//! let facade = PersistenceFacade::open(StoreConfig::in_memory())?;
//! let mut watch = facade.watch(Query::All)?;
//! assert!(watch.next().unwrap().is_empty());
//!
//! let record = facade.create(Timestamp::now())?;
//! assert_eq!(watch.next().unwrap(), vec![record]);
//!
//! facade.delete(record.id())?;
//! watch.cancel();
//! ```

pub mod error;
pub mod facade;
pub mod store;
pub mod types;
pub mod watch;

// Re-exports
pub use error::{Result, StoreError};
pub use facade::{PersistenceFacade, Watch, WatchId};
pub use store::{
    ChangeCallback, EmbeddedStore, FetchRequest, FromRow, NewRow, NotificationHandle, Predicate,
    Row, RowId, SortOrder, Store, StoreConfig, UnitOfWork,
};
pub use types::*;
pub use watch::{ChangeObserver, SnapshotStream, WatchConfig, WatchedCollection};
