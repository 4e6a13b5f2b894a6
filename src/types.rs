//! Core value types for the facade.

use crate::error::{Result, StoreError};
use crate::store::{FetchRequest, FromRow, Predicate, Row, SortOrder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted record, keyed by its timestamp.
///
/// Two records are the same record exactly when their timestamps match, so
/// `id` is not stored separately.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: Timestamp,
}

impl Record {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    /// Identity of the record.
    pub fn id(&self) -> Timestamp {
        self.timestamp
    }
}

impl FromRow for Record {
    fn from_row(row: &Row) -> Result<Self> {
        row.timestamp
            .map(Record::new)
            .ok_or_else(|| StoreError::ConversionFailed(format!("row {} has no timestamp", row.id)))
    }
}

/// Full ordered result set of a query at one point in time.
pub type Snapshot = Vec<Record>;

/// What to fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Query {
    /// Every record, newest first.
    All,
}

impl Query {
    /// Lower the query into the engine-level request.
    pub fn fetch_request(self) -> FetchRequest {
        match self {
            Query::All => FetchRequest::new(Predicate::All, SortOrder::TimestampDescending),
        }
    }
}
