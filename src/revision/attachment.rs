//! Attachment metadata
//!
//! An attachment is identified by (revision sequence, filename). The blob
//! content itself lives in the blob store, addressed by the SHA-1 `key`;
//! two attachments with identical content share one blob file.

use crate::blobstore::BlobKey;

use super::errors::{RevisionError, RevisionResult};

/// On-the-wire encoding of an attachment's stored bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentEncoding {
    /// Raw bytes.
    #[default]
    None,
    /// gzip-compressed bytes; `encoded_length` is the stored size.
    Gzip,
}

impl AttachmentEncoding {
    /// Wire-protocol name, or `None` for the identity encoding.
    pub fn as_wire(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Gzip => Some("gzip"),
        }
    }

    /// Parses the wire-protocol `encoding` field.
    pub fn from_wire(value: Option<&str>) -> RevisionResult<Self> {
        match value {
            None => Ok(Self::None),
            Some("gzip") => Ok(Self::Gzip),
            Some(other) => Err(RevisionError::UnknownEncoding(other.to_string())),
        }
    }

    /// Stable integer used in the attachments table.
    pub(crate) fn as_db(&self) -> i64 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
        }
    }

    pub(crate) fn from_db(value: i64) -> Self {
        if value == 1 {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

/// Metadata for one saved attachment.
#[derive(Debug, Clone)]
pub struct Attachment {
    /// Filename, unique within its revision.
    pub name: String,
    /// MIME type as reported when the attachment was saved.
    pub content_type: Option<String>,
    /// Length of the decoded content in bytes.
    pub length: u64,
    /// Encoding of the stored bytes.
    pub encoding: AttachmentEncoding,
    /// Stored size when `encoding` is not `None`.
    pub encoded_length: Option<u64>,
    /// Generation at which the attachment was introduced.
    pub revpos: u64,
    /// SHA-1 of the stored content; the blob store address.
    pub key: BlobKey,
}

impl Attachment {
    /// Number of bytes actually on disk for this attachment.
    pub fn on_disk_length(&self) -> u64 {
        match self.encoding {
            AttachmentEncoding::None => self.length,
            AttachmentEncoding::Gzip => self.encoded_length.unwrap_or(self.length),
        }
    }
}
