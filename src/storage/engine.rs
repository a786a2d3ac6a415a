//! The storage engine
//!
//! Durable substrate for the revision forest, over SQLite (B-tree + WAL).
//! The engine is synchronous and single-writer: every operation serializes
//! on one connection behind a mutex, matching SQLite's single-writer
//! semantics. Change visibility follows insertion order per document.
//!
//! State machine: Closed -> Opening -> Open -> Closing -> Closed. Schema
//! failures during open roll the establishing transaction back and leave
//! the store closed. Deleting the on-disk files is only legal from Closed;
//! the manager enforces that no open handle exists.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};

use crate::blobstore::{BlobReader, BlobStore};
use crate::revision::{
    validate_body, validate_document_id, Attachment, Body, DocumentRevision, RevisionId,
};

use super::attachments::{self, AttachmentInput};
use super::collation::register_collations;
use super::errors::{StorageError, StorageResult};
use super::force_insert::ForcedRevision;
use super::schema;

/// Lifecycle states of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// Callback consulted before a forced insert is applied. Returning an
/// error message rejects the revision with `Forbidden`.
pub type ValidationFn = Arc<dyn Fn(&ForcedRevision) -> Result<(), String> + Send + Sync>;

/// Hooks bracketing every write transaction. A platform adapter uses
/// these to toggle file protection while the engine touches disk.
pub trait WriteHooks: Send + Sync {
    fn before_write(&self) {}
    fn after_write(&self) {}
}

struct Inner {
    state: EngineState,
    conn: Option<Connection>,
}

/// Result of a write: the new revision plus the document's winner after
/// the transaction committed (often the same revision).
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub revision: DocumentRevision,
    pub winner: DocumentRevision,
}

/// A revision row as stored, before hydration into a `DocumentRevision`.
#[derive(Debug, Clone)]
pub(crate) struct RevRow {
    pub sequence: i64,
    pub revid: String,
    pub parent: Option<i64>,
    pub current: bool,
    pub deleted: bool,
    pub json: Option<Vec<u8>>,
}

/// The durable revision-tree store.
pub struct StorageEngine {
    name: String,
    dir: PathBuf,
    blobs: BlobStore,
    key_fingerprint: Option<[u8; 32]>,
    inner: Mutex<Inner>,
    validation: RwLock<Option<ValidationFn>>,
    write_hooks: RwLock<Option<Arc<dyn WriteHooks>>>,
}

impl StorageEngine {
    /// Opens (creating if needed) the store `name` under `dir`.
    ///
    /// `key_fingerprint` identifies the at-rest encryption key in use, if
    /// any; it is compared on re-open and never persisted.
    pub fn open(
        dir: impl Into<PathBuf>,
        name: impl Into<String>,
        key_fingerprint: Option<[u8; 32]>,
    ) -> StorageResult<Self> {
        let dir = dir.into();
        let name = name.into();
        fs::create_dir_all(&dir)?;

        let db_path = Self::db_path_for(&dir, &name);
        let mut conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        register_collations(&conn)?;

        // The single establishing transaction: any migration failure rolls
        // the whole store back and we report closed.
        let tx = conn.transaction()?;
        schema::migrate(&tx)?;
        tx.commit()?;

        let blobs = BlobStore::open(dir.join(format!("{name}_attachments")))?;
        info!(name = %name, path = %db_path.display(), "storage engine open");
        Ok(Self {
            name,
            dir,
            blobs,
            key_fingerprint,
            inner: Mutex::new(Inner {
                state: EngineState::Open,
                conn: Some(conn),
            }),
            validation: RwLock::new(None),
            write_hooks: RwLock::new(None),
        })
    }

    fn db_path_for(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.sqlite"))
    }

    /// Store name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the store's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The attachment blob store.
    pub fn blob_store(&self) -> &BlobStore {
        &self.blobs
    }

    /// Fingerprint of the encryption key the store was opened with.
    pub fn key_fingerprint(&self) -> Option<[u8; 32]> {
        self.key_fingerprint
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    /// Installs the validation callback consulted by forced inserts.
    pub fn set_validation(&self, validation: Option<ValidationFn>) {
        *self.validation.write() = validation;
    }

    pub(crate) fn validation(&self) -> Option<ValidationFn> {
        self.validation.read().clone()
    }

    /// Installs the platform write hooks.
    pub fn set_write_hooks(&self, hooks: Option<Arc<dyn WriteHooks>>) {
        *self.write_hooks.write() = hooks;
    }

    /// Closes the engine. Idempotent; in-flight operations finish first
    /// because they hold the connection lock.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Open {
            return;
        }
        inner.state = EngineState::Closing;
        inner.conn = None;
        inner.state = EngineState::Closed;
        info!(name = %self.name, "storage engine closed");
    }

    /// Removes the on-disk files of a closed store.
    pub fn delete_files(dir: &Path, name: &str) -> StorageResult<()> {
        let db_path = Self::db_path_for(dir, name);
        for suffix in ["", "-wal", "-shm"] {
            let mut p = db_path.as_os_str().to_owned();
            p.push(suffix);
            let p = PathBuf::from(p);
            if p.exists() {
                fs::remove_file(&p)?;
            }
        }
        let attachments = dir.join(format!("{name}_attachments"));
        if attachments.exists() {
            fs::remove_dir_all(&attachments)?;
        }
        let extensions = dir.join(format!("{name}_extensions"));
        if extensions.exists() {
            fs::remove_dir_all(&extensions)?;
        }
        Ok(())
    }

    /// Runs `f` with the connection, failing when closed.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut inner = self.inner.lock();
        if inner.state != EngineState::Open {
            return Err(StorageError::Closed);
        }
        let conn = inner.conn.as_mut().ok_or(StorageError::Closed)?;
        f(conn)
    }

    /// Runs `f` inside a transaction, rolling back on any error. The
    /// write hooks bracket the whole transaction on every exit path.
    pub(crate) fn in_transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let hooks = self.write_hooks.read().clone();
        if let Some(hooks) = &hooks {
            hooks.before_write();
        }
        let result = self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        });
        if let Some(hooks) = &hooks {
            hooks.after_write();
        }
        result
    }

    // =====================================================================
    // Local CRUD
    // =====================================================================

    /// Inserts a new revision.
    ///
    /// With `prev_rev_id`, the new revision is its child; putting against a
    /// non-leaf parent fails `Conflict` unless `allow_conflict`. Without
    /// `prev_rev_id` this is a create: generation 1, and any existing
    /// non-deleted leaf fails `Conflict`.
    pub fn put(
        &self,
        doc_id: &str,
        body: Body,
        attachments: Vec<AttachmentInput>,
        prev_rev_id: Option<&RevisionId>,
        allow_conflict: bool,
        deleted: bool,
    ) -> StorageResult<PutOutcome> {
        validate_document_id(doc_id)?;
        validate_body(&body)?;

        self.in_transaction(|conn| {
            let doc_row = get_or_create_doc_row(conn, doc_id)?;

            let (new_rev, parent_seq) = match prev_rev_id {
                Some(prev) => {
                    let row = rev_row(conn, doc_row, &prev.to_string())?
                        .ok_or_else(|| StorageError::not_found(format!("{doc_id} {prev}")))?;
                    if !row.current && !allow_conflict {
                        return Err(StorageError::Conflict(doc_id.to_string()));
                    }
                    if deleted && row.deleted {
                        // Deleting an already-deleted leaf.
                        return Err(StorageError::Conflict(doc_id.to_string()));
                    }
                    (prev.child(deleted, &body), Some(row.sequence))
                }
                None => {
                    let has_live_leaf: Option<i64> = conn
                        .query_row(
                            "SELECT sequence FROM revs \
                             WHERE doc_id = ?1 AND current = 1 AND deleted = 0 LIMIT 1",
                            params![doc_row],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if has_live_leaf.is_some() {
                        return Err(StorageError::Conflict(doc_id.to_string()));
                    }
                    (RevisionId::first(deleted, &body), None)
                }
            };

            let body_bytes = if deleted {
                None
            } else {
                Some(serde_json::to_vec(&body).map_err(|e| StorageError::Corrupt(e.to_string()))?)
            };
            let sequence = insert_rev(
                conn,
                doc_row,
                &new_rev.to_string(),
                parent_seq,
                true,
                deleted,
                body_bytes.as_deref(),
            )
            .map_err(|err| map_constraint_to_conflict(err, doc_id))?;
            if let Some(parent_seq) = parent_seq {
                conn.execute(
                    "UPDATE revs SET current = 0 WHERE sequence = ?1",
                    params![parent_seq],
                )?;
            }

            if !deleted {
                for input in attachments {
                    self.attach_input(conn, sequence, new_rev.generation(), parent_seq, input)?;
                }
            }

            let revision = load_revision(conn, doc_id, sequence)?;
            let winner = winner_revision(conn, doc_id, doc_row)?
                .ok_or_else(|| StorageError::Corrupt(format!("no winner for {doc_id}")))?;
            debug!(doc_id, rev = %revision.rev_id(), "put revision");
            Ok(PutOutcome { revision, winner })
        })
    }

    fn attach_input(
        &self,
        conn: &Connection,
        sequence: i64,
        generation: u64,
        parent_seq: Option<i64>,
        input: AttachmentInput,
    ) -> StorageResult<()> {
        match input {
            AttachmentInput::New {
                name,
                content_type,
                data,
            } => {
                let key = self.blobs.store(conn, &data)?;
                attachments::insert_row(
                    conn,
                    sequence,
                    &Attachment {
                        name,
                        content_type,
                        length: data.len() as u64,
                        encoding: Default::default(),
                        encoded_length: None,
                        revpos: generation,
                        key,
                    },
                )?;
            }
            AttachmentInput::Stub { name } => {
                let parent_seq = parent_seq.ok_or_else(|| {
                    StorageError::not_found(format!("attachment stub {name:?} has no parent"))
                })?;
                if !attachments::copy_from_ancestors(conn, Some(parent_seq), sequence, &name)? {
                    return Err(StorageError::not_found(format!("attachment {name:?}")));
                }
            }
        }
        Ok(())
    }

    /// Returns the named revision, or the document's winner.
    ///
    /// The winner may be a tombstone; callers that care distinguish via
    /// [`DocumentRevision::is_deleted`].
    pub fn get(
        &self,
        doc_id: &str,
        rev_id: Option<&RevisionId>,
    ) -> StorageResult<DocumentRevision> {
        self.with_conn(|conn| {
            let doc_row = doc_row_id(conn, doc_id)?
                .ok_or_else(|| StorageError::not_found(doc_id.to_string()))?;
            match rev_id {
                Some(rev_id) => {
                    let row = rev_row(conn, doc_row, &rev_id.to_string())?
                        .ok_or_else(|| StorageError::not_found(format!("{doc_id} {rev_id}")))?;
                    load_revision(conn, doc_id, row.sequence)
                }
                None => winner_revision(conn, doc_id, doc_row)?
                    .ok_or_else(|| StorageError::not_found(doc_id.to_string())),
            }
        })
    }

    /// Creates a tombstone child of `prev_rev_id`.
    pub fn delete(&self, doc_id: &str, prev_rev_id: &RevisionId) -> StorageResult<PutOutcome> {
        self.put(doc_id, Body::new(), Vec::new(), Some(prev_rev_id), false, true)
    }

    /// Tombstones every current non-deleted leaf of `doc_id`, in one
    /// transaction. Returns the new tombstones.
    pub fn delete_by_id(&self, doc_id: &str) -> StorageResult<Vec<DocumentRevision>> {
        validate_document_id(doc_id)?;
        self.in_transaction(|conn| {
            let doc_row = doc_row_id(conn, doc_id)?
                .ok_or_else(|| StorageError::not_found(doc_id.to_string()))?;
            let leaves = current_rows(conn, doc_row)?;
            let mut tombstones = Vec::new();
            for leaf in leaves.into_iter().filter(|l| !l.deleted) {
                let prev = RevisionId::from_str(&leaf.revid)
                    .map_err(|_| StorageError::Corrupt(format!("revid {:?}", leaf.revid)))?;
                let body = Body::new();
                let tombstone_rev = prev.child(true, &body);
                let sequence = insert_rev(
                    conn,
                    doc_row,
                    &tombstone_rev.to_string(),
                    Some(leaf.sequence),
                    true,
                    true,
                    None,
                )?;
                conn.execute(
                    "UPDATE revs SET current = 0 WHERE sequence = ?1",
                    params![leaf.sequence],
                )?;
                tombstones.push(load_revision(conn, doc_id, sequence)?);
            }
            if tombstones.is_empty() {
                return Err(StorageError::Deleted {
                    doc_id: doc_id.to_string(),
                    rev_id: winner_revision(conn, doc_id, doc_row)?
                        .map(|w| w.rev_id().to_string())
                        .unwrap_or_default(),
                });
            }
            debug!(doc_id, count = tombstones.len(), "deleted all leaves");
            Ok(tombstones)
        })
    }

    /// All current (leaf) revisions of a document; more than one means the
    /// document is conflicted.
    pub fn open_revisions(&self, doc_id: &str) -> StorageResult<Vec<DocumentRevision>> {
        self.with_conn(|conn| {
            let doc_row = doc_row_id(conn, doc_id)?
                .ok_or_else(|| StorageError::not_found(doc_id.to_string()))?;
            let rows = current_rows(conn, doc_row)?;
            rows.into_iter()
                .map(|row| load_revision(conn, doc_id, row.sequence))
                .collect()
        })
    }

    /// Reader for a saved attachment's blob.
    pub fn attachment_reader(&self, attachment: &Attachment) -> StorageResult<BlobReader> {
        self.with_conn(|conn| Ok(self.blobs.read(conn, &attachment.key)?))
    }

    /// Attachment metadata rows for one revision, by name.
    pub fn attachments_for_sequence(
        &self,
        sequence: i64,
    ) -> StorageResult<BTreeMap<String, Attachment>> {
        self.with_conn(|conn| attachments::for_sequence(conn, sequence))
    }

    // =====================================================================
    // Compaction
    // =====================================================================

    /// Nulls out the bodies of non-leaf, non-deleted revisions, then
    /// garbage-collects blobs no attachment row references.
    pub fn compact(&self) -> StorageResult<()> {
        let pruned = self.in_transaction(|conn| {
            let pruned = conn.execute(
                "UPDATE revs SET json = NULL \
                 WHERE current = 0 AND deleted = 0 AND json IS NOT NULL",
                [],
            )?;
            Ok(pruned)
        })?;
        // GC runs outside the transaction: file deletion cannot roll back.
        let removed = self.with_conn(|conn| {
            let keep = attachments::live_keys(conn)?;
            Ok(self.blobs.gc(conn, &keep)?)
        })?;
        info!(bodies_pruned = pruned, blobs_removed = removed, "compacted");
        Ok(())
    }

    // =====================================================================
    // Counters
    // =====================================================================

    /// Number of documents whose winner is not deleted.
    pub fn document_count(&self) -> StorageResult<u64> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT doc_id) FROM revs WHERE current = 1 AND deleted = 0",
                [],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
    }

    /// Highest sequence number assigned so far.
    pub fn last_sequence(&self) -> StorageResult<i64> {
        self.with_conn(|conn| {
            let n: Option<i64> =
                conn.query_row("SELECT MAX(sequence) FROM revs", [], |row| row.get(0))?;
            Ok(n.unwrap_or(0))
        })
    }

    /// The store's public UUID (shared with replication peers).
    pub fn public_uuid(&self) -> StorageResult<String> {
        self.with_conn(|conn| {
            schema::info_value(conn, "publicUUID")?
                .ok_or_else(|| StorageError::Corrupt("missing publicUUID".into()))
        })
    }

    /// The store's private UUID (checkpoint identity component).
    pub fn private_uuid(&self) -> StorageResult<String> {
        self.with_conn(|conn| {
            schema::info_value(conn, "privateUUID")?
                .ok_or_else(|| StorageError::Corrupt("missing privateUUID".into()))
        })
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        let state = self.inner.lock().state;
        if state == EngineState::Open {
            warn!(name = %self.name, "storage engine dropped while open");
        }
    }
}

// =========================================================================
// Row helpers (free functions over a connection; usable inside or outside
// a transaction)
// =========================================================================

pub(crate) fn doc_row_id(conn: &Connection, docid: &str) -> StorageResult<Option<i64>> {
    let id = conn
        .query_row(
            "SELECT doc_id FROM docs WHERE docid = ?1",
            params![docid],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn get_or_create_doc_row(conn: &Connection, docid: &str) -> StorageResult<i64> {
    if let Some(id) = doc_row_id(conn, docid)? {
        return Ok(id);
    }
    conn.execute("INSERT INTO docs (docid) VALUES (?1)", params![docid])?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn rev_row(
    conn: &Connection,
    doc_row: i64,
    revid: &str,
) -> StorageResult<Option<RevRow>> {
    let row = conn
        .query_row(
            "SELECT sequence, revid, parent, current, deleted, json \
             FROM revs WHERE doc_id = ?1 AND revid = ?2",
            params![doc_row, revid],
            map_rev_row,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn current_rows(conn: &Connection, doc_row: i64) -> StorageResult<Vec<RevRow>> {
    let mut stmt = conn.prepare(
        "SELECT sequence, revid, parent, current, deleted, json \
         FROM revs WHERE doc_id = ?1 AND current = 1 ORDER BY revid DESC",
    )?;
    let rows = stmt.query_map(params![doc_row], map_rev_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

fn map_rev_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RevRow> {
    Ok(RevRow {
        sequence: row.get(0)?,
        revid: row.get(1)?,
        parent: row.get(2)?,
        current: row.get(3)?,
        deleted: row.get(4)?,
        json: row.get(5)?,
    })
}

pub(crate) fn insert_rev(
    conn: &Connection,
    doc_row: i64,
    revid: &str,
    parent: Option<i64>,
    current: bool,
    deleted: bool,
    json: Option<&[u8]>,
) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO revs (doc_id, revid, parent, current, deleted, json) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![doc_row, revid, parent, current, deleted, json],
    )?;
    Ok(conn.last_insert_rowid())
}

/// The winner: the non-deleted current revision with the highest rev ID,
/// or the highest deleted one when every leaf is a tombstone.
pub(crate) fn winner_row(conn: &Connection, doc_row: i64) -> StorageResult<Option<RevRow>> {
    let row = conn
        .query_row(
            "SELECT sequence, revid, parent, current, deleted, json \
             FROM revs WHERE doc_id = ?1 AND current = 1 \
             ORDER BY deleted ASC, revid DESC LIMIT 1",
            params![doc_row],
            map_rev_row,
        )
        .optional()?;
    Ok(row)
}

pub(crate) fn winner_revision(
    conn: &Connection,
    docid: &str,
    doc_row: i64,
) -> StorageResult<Option<DocumentRevision>> {
    match winner_row(conn, doc_row)? {
        Some(row) => Ok(Some(load_revision(conn, docid, row.sequence)?)),
        None => Ok(None),
    }
}

/// Hydrates a full `DocumentRevision` (body + attachment metadata) from its
/// sequence.
pub(crate) fn load_revision(
    conn: &Connection,
    docid: &str,
    sequence: i64,
) -> StorageResult<DocumentRevision> {
    let row = conn
        .query_row(
            "SELECT sequence, revid, parent, current, deleted, json \
             FROM revs WHERE sequence = ?1",
            params![sequence],
            map_rev_row,
        )
        .optional()?
        .ok_or_else(|| StorageError::not_found(format!("sequence {sequence}")))?;
    revision_from_row(conn, docid, &row)
}

pub(crate) fn revision_from_row(
    conn: &Connection,
    docid: &str,
    row: &RevRow,
) -> StorageResult<DocumentRevision> {
    let rev_id = RevisionId::from_str(&row.revid)
        .map_err(|_| StorageError::Corrupt(format!("revid {:?}", row.revid)))?;
    let body: Option<Body> = match &row.json {
        Some(bytes) => Some(
            serde_json::from_slice(bytes)
                .map_err(|e| StorageError::Corrupt(format!("body of {docid}: {e}")))?,
        ),
        None => None,
    };
    let atts = if row.deleted {
        BTreeMap::new()
    } else {
        attachments::for_sequence(conn, row.sequence)?
    };
    Ok(DocumentRevision::new(
        docid.to_string(),
        rev_id,
        row.sequence,
        row.deleted,
        body,
        atts,
    ))
}

fn map_constraint_to_conflict(err: StorageError, doc_id: &str) -> StorageError {
    if let StorageError::Database(rusqlite::Error::SqliteFailure(e, _)) = &err {
        if e.code == rusqlite::ErrorCode::ConstraintViolation {
            return StorageError::Conflict(doc_id.to_string());
        }
    }
    err
}
