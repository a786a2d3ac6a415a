//! Blob store error types

use thiserror::Error;

/// Result type for blob store operations
pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

/// Blob store errors
#[derive(Debug, Error)]
pub enum BlobStoreError {
    /// A key was not exactly 20 bytes (SHA-1 length).
    #[error("blob key must be 20 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// No blob is registered under the given key.
    #[error("no blob for key {0}")]
    BlobNotFound(String),

    /// Could not allocate a fresh filename for a new blob.
    #[error("no free filename for key {0}")]
    NoFilenameGenerated(String),

    /// The writer has already been finished or cancelled.
    #[error("blob writer already finished")]
    WriterFinished,

    /// `install()` requires a finished writer.
    #[error("blob writer not finished")]
    WriterNotFinished,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}
