//! Replication error types
//!
//! Failures split into transient (retried with capped exponential backoff)
//! and terminal (the replicator sets its error and stops). Network-level
//! failures and 5xx statuses are transient; other HTTP statuses are
//! terminal; malformed remote payloads are terminal upstream errors.

use thiserror::Error;

use crate::storage::StorageError;

/// Result type for replication operations
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Replication errors
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Bad replication options (URL without scheme, bad headers, ...).
    #[error("invalid replication configuration: {0}")]
    Configuration(String),

    /// The remote sent something the protocol does not allow.
    #[error("malformed remote response: {0}")]
    Upstream(String),

    /// A network-level failure worth retrying.
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// An HTTP error status from the remote.
    #[error("remote returned {status} for {context}")]
    HttpStatus { status: u16, context: String },

    /// Local persistence failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The replicator was asked to stop.
    #[error("replication stopped")]
    Stopped,
}

impl ReplicationError {
    /// True when retrying with backoff is appropriate.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(_) => true,
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn http(status: reqwest::StatusCode, context: impl Into<String>) -> Self {
        Self::HttpStatus {
            status: status.as_u16(),
            context: context.into(),
        }
    }
}

impl From<reqwest::Error> for ReplicationError {
    fn from(err: reqwest::Error) -> Self {
        // Connection, timeout and body-read failures are all transient;
        // protocol-level statuses are classified where the status is known.
        Self::TransientNetwork(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ReplicationError::TransientNetwork("reset".into()).is_transient());
        assert!(ReplicationError::HttpStatus {
            status: 503,
            context: "x".into()
        }
        .is_transient());
        assert!(!ReplicationError::HttpStatus {
            status: 404,
            context: "x".into()
        }
        .is_transient());
        assert!(!ReplicationError::Upstream("bad json".into()).is_transient());
    }
}
