//! Storage engine error types
//!
//! Per-operation relational errors surface as typed errors; schema errors
//! during open are fatal and leave the store closed. Transient conditions
//! are not retried here: the storage engine is synchronous.

use thiserror::Error;

use crate::blobstore::BlobStoreError;
use crate::revision::RevisionError;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage engine errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The engine is not open.
    #[error("storage engine is closed")]
    Closed,

    /// The engine is open and cannot be reconfigured in place.
    #[error("storage engine is already open: {0}")]
    AlreadyOpen(String),

    /// Document or revision absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The document exists but its winning revision is a tombstone.
    #[error("document {doc_id} is deleted at {rev_id}")]
    Deleted { doc_id: String, rev_id: String },

    /// Put against a non-leaf parent, or an implicit create while a
    /// non-deleted leaf exists.
    #[error("revision conflict for document {0}")]
    Conflict(String),

    /// A validation callback rejected a forced insert.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Body or identifier validation failure.
    #[error(transparent)]
    Validation(#[from] RevisionError),

    /// Attachment blob failure.
    #[error(transparent)]
    Blob(#[from] BlobStoreError),

    /// The underlying filesystem or database is out of space.
    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    /// Stored data that should be well-formed is not.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other relational-store failure.
    #[error("database error: {0}")]
    Database(rusqlite::Error),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(e, _) = &err {
            if e.code == rusqlite::ErrorCode::DiskFull {
                return Self::InsufficientStorage(err.to_string());
            }
        }
        Self::Database(err)
    }
}

impl StorageError {
    /// Shorthand used by lookup paths.
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
