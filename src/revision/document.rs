//! Document revisions and body validation

use std::collections::BTreeMap;

use serde_json::Value;

use super::attachment::Attachment;
use super::errors::{RevisionError, RevisionResult};
use super::rev_id::RevisionId;

/// A document body: a JSON object with no reserved (`_`-prefixed) keys.
///
/// Reserved fields (`_id`, `_rev`, `_attachments`, ...) live outside the
/// body; they are added and stripped at the wire-protocol boundary.
pub type Body = serde_json::Map<String, Value>;

/// Checks that a body carries no reserved keys.
pub fn validate_body(body: &Body) -> RevisionResult<()> {
    for key in body.keys() {
        if key.starts_with('_') {
            return Err(RevisionError::ReservedField(key.clone()));
        }
    }
    Ok(())
}

/// Checks a document ID: non-empty, and `_`-prefixed only for the reserved
/// `_design/` and `_local/` namespaces.
pub fn validate_document_id(doc_id: &str) -> RevisionResult<()> {
    if doc_id.is_empty() {
        return Err(RevisionError::InvalidDocumentId(doc_id.to_string()));
    }
    if doc_id.starts_with('_')
        && !doc_id.starts_with("_design/")
        && !doc_id.starts_with("_local/")
    {
        return Err(RevisionError::InvalidDocumentId(doc_id.to_string()));
    }
    Ok(())
}

/// One node of a document's revision tree.
///
/// Revisions are immutable once inserted; only the `current` flag on the
/// stored row changes as children appear. A revision with no body that is
/// not deleted is a "missing" revision: either a remote ancestor stub or a
/// body compacted away.
#[derive(Debug, Clone)]
pub struct DocumentRevision {
    doc_id: String,
    rev_id: RevisionId,
    sequence: i64,
    deleted: bool,
    body: Option<Body>,
    attachments: BTreeMap<String, Attachment>,
}

impl DocumentRevision {
    pub(crate) fn new(
        doc_id: String,
        rev_id: RevisionId,
        sequence: i64,
        deleted: bool,
        body: Option<Body>,
        attachments: BTreeMap<String, Attachment>,
    ) -> Self {
        Self {
            doc_id,
            rev_id,
            sequence,
            deleted,
            body,
            attachments,
        }
    }

    /// The document this revision belongs to.
    #[inline]
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// This revision's identifier.
    #[inline]
    pub fn rev_id(&self) -> &RevisionId {
        &self.rev_id
    }

    /// The local sequence number assigned at insertion.
    #[inline]
    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    /// True for tombstone revisions.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// The body, if present. Tombstones and compacted or stub ancestors
    /// have none.
    #[inline]
    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// True when this revision should have a body but it is not stored.
    #[inline]
    pub fn is_missing(&self) -> bool {
        !self.deleted && self.body.is_none()
    }

    /// Attachment metadata by name.
    #[inline]
    pub fn attachments(&self) -> &BTreeMap<String, Attachment> {
        &self.attachments
    }

    /// Looks up one attachment by name.
    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments.get(name)
    }
}
