//! Read-side queries over the revision forest
//!
//! - `changes_since`: revisions with `sequence > since`, in sequence order.
//! - `all_docs`: the winning revision per document, with offset/limit/
//!   range/descending and an explicit-ID mode that reports missing IDs.
//! - `revision_history`: the path from a revision to its root.
//! - `possible_ancestors`: ancestor candidates with bodies present, used by
//!   the puller to fill `atts_since`.

use std::str::FromStr;

use rusqlite::{params, Connection};

use crate::revision::{DocumentRevision, RevisionId};

use super::engine::{
    current_rows, doc_row_id, rev_row, revision_from_row, winner_row, RevRow, StorageEngine,
};
use super::errors::{StorageError, StorageResult};

/// Options for [`StorageEngine::changes_since`].
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    /// Include conflicted non-winner leaves (the `style=all_docs` view).
    pub include_conflicts: bool,
    /// Hydrate bodies and attachment metadata; otherwise revisions carry
    /// identity only.
    pub include_bodies: bool,
    /// Cap on the number of rows returned.
    pub limit: Option<usize>,
}

/// One row of a changes feed.
#[derive(Debug, Clone)]
pub struct Change {
    pub revision: DocumentRevision,
    /// True when the document has more than one leaf.
    pub conflicted: bool,
}

/// Options for [`StorageEngine::all_docs`].
#[derive(Debug, Clone, Default)]
pub struct AllDocsOptions {
    pub offset: usize,
    pub limit: Option<usize>,
    pub descending: bool,
    /// Inclusive lower bound on document ID.
    pub start_key: Option<String>,
    /// Inclusive upper bound on document ID.
    pub end_key: Option<String>,
    /// Explicit document ID list; unknown IDs yield `not_found` rows.
    pub keys: Option<Vec<String>>,
}

/// One row of an `all_docs` listing.
#[derive(Debug, Clone)]
pub struct AllDocsRow {
    pub doc_id: String,
    pub revision: Option<DocumentRevision>,
    /// `Some("not_found")` for unknown explicit IDs.
    pub error: Option<&'static str>,
}

impl StorageEngine {
    /// Streams revisions with `sequence > since`, ordered by sequence.
    ///
    /// Without `include_conflicts`, only each document's winner appears.
    /// `filter` drops rows after hydration.
    pub fn changes_since(
        &self,
        since: i64,
        options: &ChangesOptions,
        filter: Option<&dyn Fn(&DocumentRevision) -> bool>,
    ) -> StorageResult<Vec<Change>> {
        self.with_conn(|conn| {
            // Ordered by document then revid descending so the winner is
            // the first row of each document group.
            let mut stmt = conn.prepare(
                "SELECT revs.sequence, revs.revid, revs.parent, revs.current, \
                        revs.deleted, revs.json, docs.docid, revs.doc_id \
                 FROM revs JOIN docs ON revs.doc_id = docs.doc_id \
                 WHERE revs.sequence > ?1 AND revs.current = 1 \
                 ORDER BY revs.doc_id, revs.deleted ASC, revs.revid DESC",
            )?;
            let rows = stmt.query_map(params![since], |row| {
                let rev = RevRow {
                    sequence: row.get(0)?,
                    revid: row.get(1)?,
                    parent: row.get(2)?,
                    current: row.get(3)?,
                    deleted: row.get(4)?,
                    json: row.get(5)?,
                };
                let docid: String = row.get(6)?;
                let doc_row: i64 = row.get(7)?;
                Ok((rev, docid, doc_row))
            })?;

            let mut changes: Vec<(Change, i64)> = Vec::new();
            let mut last_doc: Option<i64> = None;
            let mut doc_leaf_count = 0usize;
            for row in rows {
                let (rev, docid, doc_row) = row?;
                let is_first_of_doc = last_doc != Some(doc_row);
                if is_first_of_doc {
                    last_doc = Some(doc_row);
                    doc_leaf_count = leaf_count(conn, doc_row)?;
                } else if !options.include_conflicts {
                    continue;
                }
                let revision = self.hydrate(conn, &docid, &rev, options.include_bodies)?;
                if let Some(filter) = filter {
                    if !filter(&revision) {
                        continue;
                    }
                }
                changes.push((
                    Change {
                        revision,
                        conflicted: doc_leaf_count > 1,
                    },
                    rev.sequence,
                ));
            }

            changes.sort_by_key(|(_, seq)| *seq);
            let mut out: Vec<Change> = changes.into_iter().map(|(c, _)| c).collect();
            if let Some(limit) = options.limit {
                out.truncate(limit);
            }
            Ok(out)
        })
    }

    /// The winning revision per document.
    pub fn all_docs(&self, options: &AllDocsOptions) -> StorageResult<Vec<AllDocsRow>> {
        self.with_conn(|conn| {
            if let Some(keys) = &options.keys {
                let mut out = Vec::with_capacity(keys.len());
                for key in keys {
                    match doc_row_id(conn, key)? {
                        Some(doc_row) => match winner_row(conn, doc_row)? {
                            Some(row) => out.push(AllDocsRow {
                                doc_id: key.clone(),
                                revision: Some(revision_from_row(conn, key, &row)?),
                                error: None,
                            }),
                            None => out.push(not_found_row(key)),
                        },
                        None => out.push(not_found_row(key)),
                    }
                }
                return Ok(out);
            }

            let order = if options.descending { "DESC" } else { "ASC" };
            let mut stmt = conn.prepare(&format!(
                "SELECT doc_id, docid FROM docs \
                 WHERE (?1 IS NULL OR docid >= ?1) AND (?2 IS NULL OR docid <= ?2) \
                 ORDER BY docid {order}"
            ))?;
            let rows = stmt.query_map(
                params![options.start_key, options.end_key],
                |row| {
                    let doc_row: i64 = row.get(0)?;
                    let docid: String = row.get(1)?;
                    Ok((doc_row, docid))
                },
            )?;

            let mut out = Vec::new();
            let mut skipped = 0usize;
            for row in rows {
                let (doc_row, docid) = row?;
                let Some(winner) = winner_row(conn, doc_row)? else {
                    continue;
                };
                if winner.deleted {
                    continue;
                }
                if skipped < options.offset {
                    skipped += 1;
                    continue;
                }
                out.push(AllDocsRow {
                    doc_id: docid.clone(),
                    revision: Some(revision_from_row(conn, &docid, &winner)?),
                    error: None,
                });
                if let Some(limit) = options.limit {
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            Ok(out)
        })
    }

    /// Every document ID whose winner is not deleted, ascending.
    pub fn all_document_ids(&self) -> StorageResult<Vec<String>> {
        let rows = self.all_docs(&AllDocsOptions::default())?;
        Ok(rows.into_iter().map(|r| r.doc_id).collect())
    }

    /// The path from `rev_id` back to its root, newest first. Bodies may be
    /// missing on compacted or stub ancestors.
    pub fn revision_history(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
    ) -> StorageResult<Vec<DocumentRevision>> {
        self.with_conn(|conn| {
            let doc_row = doc_row_id(conn, doc_id)?
                .ok_or_else(|| StorageError::not_found(doc_id.to_string()))?;
            let start = rev_row(conn, doc_row, &rev_id.to_string())?
                .ok_or_else(|| StorageError::not_found(format!("{doc_id} {rev_id}")))?;

            let mut history = Vec::new();
            let mut cursor = Some(start);
            while let Some(row) = cursor {
                let parent = row.parent;
                history.push(revision_from_row(conn, doc_id, &row)?);
                cursor = match parent {
                    Some(parent_seq) => row_by_sequence(conn, parent_seq)?,
                    None => None,
                };
            }
            Ok(history)
        })
    }

    /// Ancestor candidates of `rev_id` whose bodies are present, by
    /// decreasing revision ID, at most `limit`.
    pub fn possible_ancestors(
        &self,
        doc_id: &str,
        rev_id: &RevisionId,
        limit: usize,
    ) -> StorageResult<Vec<RevisionId>> {
        self.with_conn(|conn| {
            let Some(doc_row) = doc_row_id(conn, doc_id)? else {
                return Ok(Vec::new());
            };
            let mut stmt = conn.prepare(
                "SELECT revid FROM revs \
                 WHERE doc_id = ?1 AND json IS NOT NULL \
                 ORDER BY revid DESC",
            )?;
            let rows = stmt.query_map(params![doc_row], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                let revid = row?;
                let candidate = RevisionId::from_str(&revid)
                    .map_err(|_| StorageError::Corrupt(format!("revid {revid:?}")))?;
                if candidate.generation() < rev_id.generation() {
                    out.push(candidate);
                    if out.len() >= limit {
                        break;
                    }
                }
            }
            Ok(out)
        })
    }

    fn hydrate(
        &self,
        conn: &Connection,
        docid: &str,
        row: &RevRow,
        include_bodies: bool,
    ) -> StorageResult<DocumentRevision> {
        if include_bodies {
            revision_from_row(conn, docid, row)
        } else {
            let mut slim = row.clone();
            slim.json = None;
            // Skip attachment hydration too; identity-only rows are what
            // the feed consumers forward.
            let rev_id = RevisionId::from_str(&slim.revid)
                .map_err(|_| StorageError::Corrupt(format!("revid {:?}", slim.revid)))?;
            Ok(DocumentRevision::new(
                docid.to_string(),
                rev_id,
                slim.sequence,
                slim.deleted,
                None,
                Default::default(),
            ))
        }
    }
}

fn leaf_count(conn: &Connection, doc_row: i64) -> StorageResult<usize> {
    Ok(current_rows(conn, doc_row)?.len())
}

fn row_by_sequence(conn: &Connection, sequence: i64) -> StorageResult<Option<RevRow>> {
    use rusqlite::OptionalExtension;
    let row = conn
        .query_row(
            "SELECT sequence, revid, parent, current, deleted, json \
             FROM revs WHERE sequence = ?1",
            params![sequence],
            |row| {
                Ok(RevRow {
                    sequence: row.get(0)?,
                    revid: row.get(1)?,
                    parent: row.get(2)?,
                    current: row.get(3)?,
                    deleted: row.get(4)?,
                    json: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn not_found_row(key: &str) -> AllDocsRow {
    AllDocsRow {
        doc_id: key.to_string(),
        revision: None,
        error: Some("not_found"),
    }
}
