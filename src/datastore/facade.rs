//! The datastore facade

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::revision::{Body, DocumentRevision, RevisionId};
use crate::storage::{
    AllDocsOptions, AttachmentInput, ForcedRevision, PutOutcome, StorageEngine, StorageError,
    StorageResult,
};

use super::events::{DatastoreEvent, EventBus};

/// The core interaction point for CRUD over a pool of heterogeneous JSON
/// documents.
///
/// Each document is a tree of revisions; replication can branch that tree,
/// and the branches surface as conflicted documents for caller-side
/// resolution. All methods delegate to single engine transactions and post
/// a notification on success.
pub struct Datastore {
    engine: Arc<StorageEngine>,
    events: Arc<EventBus>,
}

impl Datastore {
    /// Wraps an open engine with its event bus.
    pub fn new(engine: Arc<StorageEngine>, events: Arc<EventBus>) -> Self {
        Self { engine, events }
    }

    /// Datastore name.
    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// The underlying storage engine.
    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// The bus this datastore posts notifications on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // =====================================================================
    // CRUD
    // =====================================================================

    /// Creates a document. A fresh UUID-based ID is assigned when `doc_id`
    /// is `None`.
    pub fn create_document(
        &self,
        doc_id: Option<String>,
        body: Body,
        attachments: Vec<AttachmentInput>,
    ) -> StorageResult<DocumentRevision> {
        let doc_id = doc_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let outcome = self
            .engine
            .put(&doc_id, body, attachments, None, false, false)?;
        self.post_updated(&outcome, None);
        Ok(outcome.revision)
    }

    /// Updates a document with a new child revision of `prev`.
    pub fn update_document(
        &self,
        prev: &DocumentRevision,
        body: Body,
        attachments: Vec<AttachmentInput>,
    ) -> StorageResult<DocumentRevision> {
        let outcome = self.engine.put(
            prev.doc_id(),
            body,
            attachments,
            Some(prev.rev_id()),
            false,
            false,
        )?;
        self.post_updated(&outcome, None);
        Ok(outcome.revision)
    }

    /// Deletes `prev`, returning its tombstone child.
    pub fn delete_document(&self, prev: &DocumentRevision) -> StorageResult<DocumentRevision> {
        let outcome = self.engine.delete(prev.doc_id(), prev.rev_id())?;
        self.post_updated(&outcome, None);
        Ok(outcome.revision)
    }

    /// Deletes a document and all its live leaf revisions.
    pub fn delete_document_by_id(&self, doc_id: &str) -> StorageResult<Vec<DocumentRevision>> {
        let tombstones = self.engine.delete_by_id(doc_id)?;
        self.events.post(&DatastoreEvent::DocumentsDeleted {
            deleted_revs: tombstones.clone(),
        });
        Ok(tombstones)
    }

    /// Returns a document's current winning revision.
    ///
    /// A document whose winner is a tombstone reports `Deleted`, not
    /// `NotFound`.
    pub fn get_document(&self, doc_id: &str) -> StorageResult<DocumentRevision> {
        let winner = self.engine.get(doc_id, None)?;
        if winner.is_deleted() {
            return Err(StorageError::Deleted {
                doc_id: doc_id.to_string(),
                rev_id: winner.rev_id().to_string(),
            });
        }
        Ok(winner)
    }

    /// Returns a specific revision of a document. Old revisions may have
    /// had their bodies compacted away.
    pub fn get_document_rev(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
    ) -> StorageResult<DocumentRevision> {
        self.engine.get(doc_id, Some(rev_id))
    }

    /// Unpaginated read of every document's winning revision.
    pub fn get_all_documents(&self) -> StorageResult<Vec<DocumentRevision>> {
        self.get_all_documents_range(0, None, false)
    }

    /// Winning revisions ordered by document ID, `offset`/`limit` applied.
    pub fn get_all_documents_range(
        &self,
        offset: usize,
        limit: Option<usize>,
        descending: bool,
    ) -> StorageResult<Vec<DocumentRevision>> {
        let rows = self.engine.all_docs(&AllDocsOptions {
            offset,
            limit,
            descending,
            ..Default::default()
        })?;
        Ok(rows.into_iter().filter_map(|r| r.revision).collect())
    }

    /// Winning revisions for an explicit ID list, positionally: unknown
    /// IDs yield `None`.
    pub fn get_documents_with_ids(
        &self,
        doc_ids: &[String],
    ) -> StorageResult<Vec<Option<DocumentRevision>>> {
        let rows = self.engine.all_docs(&AllDocsOptions {
            keys: Some(doc_ids.to_vec()),
            ..Default::default()
        })?;
        Ok(rows.into_iter().map(|r| r.revision).collect())
    }

    /// Every document ID with a live winning revision.
    pub fn get_all_document_ids(&self) -> StorageResult<Vec<String>> {
        self.engine.all_document_ids()
    }

    /// Number of documents with a live winning revision.
    pub fn document_count(&self) -> StorageResult<u64> {
        self.engine.document_count()
    }

    /// The history of `revision`: each revision on its branch, from it to
    /// the root of the tree.
    pub fn get_revision_history(
        &self,
        revision: &DocumentRevision,
    ) -> StorageResult<Vec<DocumentRevision>> {
        self.engine
            .revision_history(revision.doc_id(), revision.rev_id())
    }

    // =====================================================================
    // Replication-side entry points
    // =====================================================================

    /// Inserts a pulled revision with its history and posts the change
    /// notification carrying the replication source.
    pub fn force_insert(
        &self,
        rev: ForcedRevision,
        history: &[RevisionId],
        source: Option<&Url>,
    ) -> StorageResult<DocumentRevision> {
        let outcome = self.engine.force_insert(rev, history, source)?;
        self.post_updated(&outcome, source.cloned());
        Ok(outcome.revision)
    }

    // =====================================================================
    // Maintenance
    // =====================================================================

    /// Directory for an extension to keep its data for this datastore.
    pub fn extension_data_folder(&self, extension_name: &str) -> PathBuf {
        self.engine
            .dir()
            .join(format!("{}_extensions", self.engine.name()))
            .join(extension_name)
    }

    /// Compacts the store: prunes old revision bodies and unreferenced
    /// attachment blobs.
    pub fn compact(&self) -> StorageResult<()> {
        self.engine.compact()
    }

    /// Posts `DatabaseClosing` and closes the engine. Subscribers must
    /// drop their references; the manager holds only weak ones.
    pub fn close(&self) {
        self.events.post(&DatastoreEvent::DatabaseClosing {
            name: self.engine.name().to_string(),
        });
        self.engine.close();
    }

    fn post_updated(&self, outcome: &PutOutcome, source: Option<Url>) {
        debug!(
            doc_id = outcome.revision.doc_id(),
            rev = %outcome.revision.rev_id(),
            "posting document update"
        );
        self.events.post(&DatastoreEvent::DocumentUpdated {
            rev: outcome.revision.clone(),
            winner: outcome.winner.clone(),
            source,
        });
    }
}
