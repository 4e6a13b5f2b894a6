//! Live snapshot streams over store queries.
//!
//! A [`WatchedCollection`] owns a [`ChangeObserver`] registered with the
//! store and a [`SnapshotFanout`] the observer pushes into. Every call to
//! [`WatchedCollection::stream`] attaches an independent subscriber that sees
//! the current result set first and then each new full snapshot:
//!
//! ```ignore
//! let collection = WatchedCollection::<Record>::new(
//!     Query::All.fetch_request(),
//!     store.clone(),
//!     WatchConfig::default(),
//! )?;
//!
//! for snapshot in collection.stream() {
//!     println!("{} records", snapshot.len());
//! }
//! ```

mod collection;
mod fanout;
mod observer;

pub use collection::WatchedCollection;
pub use fanout::{SnapshotFanout, SnapshotStream, SubscriberId};
pub use observer::ChangeObserver;

/// Configuration for snapshot delivery.
///
/// Every buffered item is a full snapshot, so an unbounded subscriber that
/// is never read holds memory proportional to commits times result size.
/// Read or drop streams promptly, or set a bound.
#[derive(Clone, Debug, Default)]
pub struct WatchConfig {
    /// Max buffered snapshots per subscriber before it is detached
    /// (None = unbounded).
    ///
    /// A detached subscriber's stream ends, but the collection it came from
    /// keeps observing the store until the collection itself is dropped.
    pub buffer_size: Option<usize>,
}
