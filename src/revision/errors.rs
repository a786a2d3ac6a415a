//! Revision validation error types

use thiserror::Error;

/// Result type for revision parsing and validation
pub type RevisionResult<T> = Result<T, RevisionError>;

/// Errors raised while parsing or validating revision data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RevisionError {
    /// Revision ID is not of the form `<generation>-<suffix>`
    #[error("invalid revision id: {0:?}")]
    InvalidRevisionId(String),

    /// Document ID is empty or uses a reserved prefix
    #[error("invalid document id: {0:?}")]
    InvalidDocumentId(String),

    /// Document body contains a key reserved for the wire protocol
    #[error("document body may not contain reserved field {0:?}")]
    ReservedField(String),

    /// Attachment encoding is not one of the supported values
    #[error("unknown attachment encoding: {0:?}")]
    UnknownEncoding(String),
}
