//! Local documents and replication checkpoints
//!
//! Local documents are stored by ID alone: single revision, never
//! replicated. Replication checkpoints live in the `replicators` table,
//! keyed by the replicator's stable identity, with the opaque remote
//! sequence wrapped as `{"seq": <value>}`.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::revision::{validate_body, Body};

use super::engine::StorageEngine;
use super::errors::{StorageError, StorageResult};

/// A local (non-replicated) document.
#[derive(Debug, Clone)]
pub struct LocalDocument {
    pub doc_id: String,
    pub rev_id: String,
    pub body: Body,
}

impl StorageEngine {
    /// Reads a local document.
    pub fn get_local(&self, doc_id: &str) -> StorageResult<LocalDocument> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT revid, json FROM localdocs WHERE docid = ?1",
                    params![doc_id],
                    |row| {
                        let revid: String = row.get(0)?;
                        let json: Option<Vec<u8>> = row.get(1)?;
                        Ok((revid, json))
                    },
                )
                .optional()?
                .ok_or_else(|| StorageError::not_found(doc_id.to_string()))?;
            let body = match row.1 {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Corrupt(format!("local doc {doc_id}: {e}")))?,
                None => Body::new(),
            };
            Ok(LocalDocument {
                doc_id: doc_id.to_string(),
                rev_id: row.0,
                body,
            })
        })
    }

    /// Writes a local document, replacing any existing revision. Returns
    /// the new revision ID.
    pub fn put_local(&self, doc_id: &str, body: Body) -> StorageResult<String> {
        validate_body(&body)?;
        self.in_transaction(|conn| {
            let prev_gen = local_generation(conn, doc_id)?;
            let revid = format!("{}-local", prev_gen + 1);
            let bytes = serde_json::to_vec(&body)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            conn.execute(
                "INSERT INTO localdocs (docid, revid, json) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(docid) DO UPDATE SET revid = excluded.revid, json = excluded.json",
                params![doc_id, revid, bytes],
            )?;
            Ok(revid)
        })
    }

    /// Removes a local document.
    pub fn delete_local(&self, doc_id: &str) -> StorageResult<()> {
        self.in_transaction(|conn| {
            let n = conn.execute("DELETE FROM localdocs WHERE docid = ?1", params![doc_id])?;
            if n == 0 {
                return Err(StorageError::not_found(doc_id.to_string()));
            }
            Ok(())
        })
    }

    /// Reads the checkpoint document for `replicator_id`, if any.
    ///
    /// The returned value is the `{"seq": <opaque>}` object.
    pub fn checkpoint(&self, replicator_id: &str, push: bool) -> StorageResult<Option<Value>> {
        self.with_conn(|conn| {
            let stored: Option<Option<String>> = conn
                .query_row(
                    "SELECT last_sequence FROM replicators WHERE remote = ?1 AND push = ?2",
                    params![replicator_id, push],
                    |row| row.get(0),
                )
                .optional()?;
            match stored.flatten() {
                Some(text) => {
                    let value = serde_json::from_str(&text).map_err(|e| {
                        StorageError::Corrupt(format!("checkpoint for {replicator_id}: {e}"))
                    })?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
    }

    /// Durably records the checkpoint for `replicator_id`.
    pub fn set_checkpoint(
        &self,
        replicator_id: &str,
        push: bool,
        sequence: &Value,
    ) -> StorageResult<()> {
        let doc = serde_json::json!({ "seq": sequence }).to_string();
        self.in_transaction(|conn| {
            upsert_checkpoint(conn, replicator_id, push, &doc)?;
            debug!(replicator_id, %doc, "checkpoint persisted");
            Ok(())
        })
    }
}

fn local_generation(conn: &Connection, doc_id: &str) -> StorageResult<u64> {
    let revid: Option<String> = conn
        .query_row(
            "SELECT revid FROM localdocs WHERE docid = ?1",
            params![doc_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(revid
        .and_then(|r| r.split_once('-').and_then(|(g, _)| g.parse().ok()))
        .unwrap_or(0))
}

fn upsert_checkpoint(
    conn: &Connection,
    replicator_id: &str,
    push: bool,
    doc: &str,
) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO replicators (remote, push, last_sequence) VALUES (?1, ?2, ?3) \
         ON CONFLICT(remote, push) DO UPDATE SET last_sequence = excluded.last_sequence",
        params![replicator_id, push, doc],
    )?;
    Ok(())
}
