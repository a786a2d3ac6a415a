//! Revision identity and document revision types
//!
//! A document is a tree of revisions. Each revision is identified by a
//! `<generation>-<suffix>` revision ID; sibling revisions are ordered by
//! generation first, then lexicographically on the suffix. These types are
//! pure data containers: tree maintenance lives in the storage engine.

mod attachment;
mod document;
mod errors;
mod rev_id;

pub use attachment::{Attachment, AttachmentEncoding};
pub use document::{validate_body, validate_document_id, Body, DocumentRevision};
pub use errors::{RevisionError, RevisionResult};
pub use rev_id::{collate_rev_ids, RevisionId};
