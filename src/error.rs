//! Error types for the persistence facade.

use crate::types::Timestamp;
use thiserror::Error;

/// Main error type for store and facade operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store write failed: {0}")]
    WriteFailed(String),

    #[error("Store fetch failed: {0}")]
    FetchFailed(String),

    #[error("Row conversion failed: {0}")]
    ConversionFailed(String),

    #[error("A record with timestamp {0:?} already exists")]
    DuplicateTimestamp(Timestamp),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Change observer was already started")]
    ObserverAlreadyStarted,
}

impl StoreError {
    /// True for errors that mean a write did not reach the store.
    pub fn is_write_failure(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_)
                | StoreError::WriteFailed(_)
                | StoreError::DuplicateTimestamp(_)
                | StoreError::Serialization(_)
                | StoreError::Deserialization(_)
                | StoreError::Corruption(_)
                | StoreError::ChecksumMismatch { .. }
                | StoreError::Locked
                | StoreError::InvalidFormat(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
