//! Remote-side insertion
//!
//! `force_insert` attaches a pulled revision to the tree together with its
//! full ancestry. Ancestors the store has never seen become body-less stub
//! rows; only the newest revision carries a body and attachments. The
//! operation is idempotent and all-or-nothing within one transaction.
//!
//! Invariants maintained:
//! - Every revision's generation is its parent's generation + 1.
//! - After the insert, `current = 1` exactly on the leaves.
//! - Out-of-order pulls across documents are safe because each insert
//!   supplies its whole history.

use rusqlite::{params, Connection};
use tracing::{debug, warn};
use url::Url;

use crate::revision::{
    validate_body, validate_document_id, Attachment, AttachmentEncoding, Body, RevisionError,
    RevisionId,
};

use super::attachments::{self, PulledAttachment, PulledAttachmentContent};
use super::engine::{
    doc_row_id, get_or_create_doc_row, insert_rev, load_revision, rev_row, winner_revision,
    PutOutcome, StorageEngine,
};
use super::errors::{StorageError, StorageResult};

/// A revision arriving from a remote peer, with its attachment payloads.
#[derive(Debug)]
pub struct ForcedRevision {
    pub doc_id: String,
    pub rev_id: RevisionId,
    pub deleted: bool,
    pub body: Body,
    pub attachments: Vec<PulledAttachment>,
}

impl StorageEngine {
    /// Inserts `rev` with its ancestry.
    ///
    /// `history` lists revision IDs newest first and must include
    /// `rev.rev_id` itself as its head. `source` names the remote the
    /// revision was pulled from; it is recorded in logs only.
    pub fn force_insert(
        &self,
        mut rev: ForcedRevision,
        history: &[RevisionId],
        source: Option<&Url>,
    ) -> StorageResult<PutOutcome> {
        validate_document_id(&rev.doc_id)?;
        validate_body(&rev.body)?;
        validate_history(&rev, history)?;

        if let Some(validation) = self.validation() {
            if let Err(reason) = validation(&rev) {
                warn!(doc_id = %rev.doc_id, rev = %rev.rev_id, %reason, "forced insert rejected");
                return Err(StorageError::Forbidden(reason));
            }
        }

        let attachments = std::mem::take(&mut rev.attachments);
        self.in_transaction(|conn| {
            let doc_row = get_or_create_doc_row(conn, &rev.doc_id)?;

            // Idempotence: the leaf may already be present, possibly as a
            // body-less stub from an earlier conflicted pull.
            if let Some(existing) = rev_row(conn, doc_row, &rev.rev_id.to_string())? {
                if existing.json.is_none() && !rev.deleted {
                    self.fill_stub(conn, existing.sequence, &rev, attachments)?;
                } else {
                    debug!(doc_id = %rev.doc_id, rev = %rev.rev_id, "forced insert already present");
                }
                let revision = load_revision(conn, &rev.doc_id, existing.sequence)?;
                let winner = winner_revision(conn, &rev.doc_id, doc_row)?.ok_or_else(|| {
                    StorageError::Corrupt(format!("no winner for {}", rev.doc_id))
                })?;
                return Ok(PutOutcome { revision, winner });
            }

            // Walk the history oldest to newest, attaching missing nodes.
            // A missing oldest ancestor starts a new root.
            let mut parent_seq: Option<i64> = None;
            let mut new_seq: i64 = 0;
            for (i, rev_id) in history.iter().enumerate().rev() {
                let rev_id_str = rev_id.to_string();
                match rev_row(conn, doc_row, &rev_id_str)? {
                    Some(existing) => {
                        parent_seq = Some(existing.sequence);
                    }
                    None => {
                        let is_newest = i == 0;
                        let body_bytes = if is_newest && !rev.deleted {
                            Some(serde_json::to_vec(&rev.body).map_err(|e| {
                                StorageError::Corrupt(format!("body of {}: {e}", rev.doc_id))
                            })?)
                        } else {
                            None
                        };
                        let seq = insert_rev(
                            conn,
                            doc_row,
                            &rev_id_str,
                            parent_seq,
                            is_newest,
                            is_newest && rev.deleted,
                            body_bytes.as_deref(),
                        )?;
                        if is_newest {
                            new_seq = seq;
                        }
                        parent_seq = Some(seq);
                    }
                }
            }

            // Any revision that now has a child is interior: drop its
            // current flag.
            conn.execute(
                "UPDATE revs SET current = 0 WHERE doc_id = ?1 AND current = 1 \
                 AND sequence IN \
                     (SELECT parent FROM revs WHERE doc_id = ?1 AND parent IS NOT NULL)",
                params![doc_row],
            )?;

            if !rev.deleted {
                self.attach_pulled(conn, new_seq, &rev, attachments)?;
            }

            let revision = load_revision(conn, &rev.doc_id, new_seq)?;
            let winner = winner_revision(conn, &rev.doc_id, doc_row)?
                .ok_or_else(|| StorageError::Corrupt(format!("no winner for {}", rev.doc_id)))?;
            debug!(
                doc_id = %rev.doc_id,
                rev = %rev.rev_id,
                source = source.map(|u| u.as_str()).unwrap_or("-"),
                "forced insert applied"
            );
            Ok(PutOutcome { revision, winner })
        })
    }

    /// A prior pull left this revision as a body-less stub; fill in the
    /// body and attachments now that they have arrived.
    fn fill_stub(
        &self,
        conn: &Connection,
        sequence: i64,
        rev: &ForcedRevision,
        attachments: Vec<PulledAttachment>,
    ) -> StorageResult<()> {
        let body_bytes = serde_json::to_vec(&rev.body)
            .map_err(|e| StorageError::Corrupt(format!("body of {}: {e}", rev.doc_id)))?;
        conn.execute(
            "UPDATE revs SET json = ?1 WHERE sequence = ?2",
            params![body_bytes, sequence],
        )?;
        if attachments::for_sequence(conn, sequence)?.is_empty() {
            self.attach_pulled(conn, sequence, rev, attachments)?;
        }
        debug!(doc_id = %rev.doc_id, rev = %rev.rev_id, "filled stub revision");
        Ok(())
    }

    fn attach_pulled(
        &self,
        conn: &Connection,
        sequence: i64,
        rev: &ForcedRevision,
        attachments: Vec<PulledAttachment>,
    ) -> StorageResult<()> {
        let parent_seq: Option<i64> = conn.query_row(
            "SELECT parent FROM revs WHERE sequence = ?1",
            params![sequence],
            |row| row.get(0),
        )?;
        for att in attachments {
            let encoding = att.encoding;
            let att_length = att.length;
            match att.content {
                PulledAttachmentContent::Inline(ref data) => {
                    let key = self.blob_store().store(conn, data)?;
                    let (length, encoded_length) =
                        att_lengths(encoding, att_length, data.len() as u64);
                    attachments::insert_row(
                        conn,
                        sequence,
                        &Attachment {
                            name: att.name.clone(),
                            content_type: att.content_type.clone(),
                            length,
                            encoding: att.encoding,
                            encoded_length,
                            revpos: att.revpos,
                            key,
                        },
                    )?;
                }
                PulledAttachmentContent::Streamed(writer) => {
                    let stored = writer.length();
                    let (length, encoded_length) = att_lengths(encoding, att_length, stored);
                    // Installation happens inside this transaction: the
                    // filename row and the file move commit together.
                    let key = writer.install(conn)?;
                    attachments::insert_row(
                        conn,
                        sequence,
                        &Attachment {
                            name: att.name,
                            content_type: att.content_type,
                            length,
                            encoding: att.encoding,
                            encoded_length,
                            revpos: att.revpos,
                            key,
                        },
                    )?;
                }
                PulledAttachmentContent::Stub => {
                    if !attachments::copy_from_ancestors(conn, parent_seq, sequence, &att.name)? {
                        return Err(StorageError::not_found(format!(
                            "attachment {:?} of {}",
                            att.name, rev.doc_id
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Drops the candidates already present in the store, preserving order.
    ///
    /// A revision counts as present only when its content is: a body-less
    /// stub left by an earlier conflicted pull still needs fetching.
    pub fn find_missing(
        &self,
        candidates: Vec<(String, RevisionId)>,
    ) -> StorageResult<Vec<(String, RevisionId)>> {
        self.with_conn(|conn| {
            let mut missing = Vec::with_capacity(candidates.len());
            for (doc_id, rev_id) in candidates {
                let present = match doc_row_id(conn, &doc_id)? {
                    Some(doc_row) => rev_row(conn, doc_row, &rev_id.to_string())?
                        .map(|row| row.json.is_some() || row.deleted)
                        .unwrap_or(false),
                    None => false,
                };
                if !present {
                    missing.push((doc_id, rev_id));
                }
            }
            Ok(missing)
        })
    }
}

fn validate_history(rev: &ForcedRevision, history: &[RevisionId]) -> StorageResult<()> {
    let head = history.first().ok_or_else(|| {
        StorageError::Validation(RevisionError::InvalidRevisionId("empty history".into()))
    })?;
    if head != &rev.rev_id {
        return Err(StorageError::Validation(RevisionError::InvalidRevisionId(
            format!("history head {head} does not match revision {}", rev.rev_id),
        )));
    }
    for (i, entry) in history.iter().enumerate() {
        let expected = rev.rev_id.generation().saturating_sub(i as u64);
        if expected == 0 || entry.generation() != expected {
            return Err(StorageError::Validation(RevisionError::InvalidRevisionId(
                format!("history entry {entry} out of order"),
            )));
        }
    }
    Ok(())
}

/// Decoded/stored length bookkeeping for a pulled attachment.
fn att_lengths(encoding: AttachmentEncoding, att_length: u64, stored: u64) -> (u64, Option<u64>) {
    match encoding {
        AttachmentEncoding::None => (stored, None),
        AttachmentEncoding::Gzip => (att_length, Some(stored)),
    }
}
