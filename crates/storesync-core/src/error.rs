//! Error types for Storesync

use thiserror::Error;

use crate::types::CollectionName;

/// Main error type for Storesync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Real-time channel unreachable or dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// Incoming snapshot failed shape validation for one collection
    #[error("Invalid snapshot for {collection}: {reason}")]
    Validation {
        /// The collection that was rejected
        collection: CollectionName,
        /// Why the value was rejected
        reason: String,
    },

    /// A pull or push was requested while another one holds the sync gate
    #[error("Sync already in flight")]
    Busy,

    /// Full-sync HTTP service error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Device identity could not be loaded or persisted
    #[error("Identity error: {0}")]
    Identity(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Failures expected to clear on their own. They are logged as warnings;
    /// everything else is logged as an error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Connection(_) | SyncError::Http(_) | SyncError::Busy
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Http(e.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
