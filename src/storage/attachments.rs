//! Attachment row persistence
//!
//! Attachment metadata lives in the `attachments` table keyed by
//! (revision sequence, filename); content lives in the blob store. A child
//! revision that keeps an attachment gets its own row copied from the
//! parent sequence, pointing at the same blob key.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::blobstore::{BlobKey, BlobWriter};
use crate::revision::{Attachment, AttachmentEncoding};

use super::errors::{StorageError, StorageResult};

/// Attachment payload supplied with a local put.
#[derive(Debug)]
pub enum AttachmentInput {
    /// New content to stream into the blob store.
    New {
        name: String,
        content_type: Option<String>,
        data: Vec<u8>,
    },
    /// Keep the parent revision's attachment of the same name.
    Stub { name: String },
}

impl AttachmentInput {
    pub fn name(&self) -> &str {
        match self {
            Self::New { name, .. } => name,
            Self::Stub { name } => name,
        }
    }
}

/// Attachment arriving through replication, already associated with its
/// wire metadata.
#[derive(Debug)]
pub struct PulledAttachment {
    pub name: String,
    pub content_type: Option<String>,
    pub length: u64,
    pub encoding: AttachmentEncoding,
    pub encoded_length: Option<u64>,
    pub revpos: u64,
    pub content: PulledAttachmentContent,
}

/// Where a pulled attachment's bytes are.
#[derive(Debug)]
pub enum PulledAttachmentContent {
    /// Decoded inline data from the document JSON.
    Inline(Vec<u8>),
    /// A finished (not yet installed) blob writer from a multipart part.
    Streamed(BlobWriter),
    /// Not transferred: the remote knows we already hold it; copy the row
    /// from an ancestor revision.
    Stub,
}

/// Inserts one attachment row for `sequence`.
pub(crate) fn insert_row(
    conn: &Connection,
    sequence: i64,
    att: &Attachment,
) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO attachments \
             (sequence, filename, key, type, length, revpos, encoding, encoded_length) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sequence,
            att.name,
            att.key.as_bytes().as_slice(),
            att.content_type,
            att.length as i64,
            att.revpos as i64,
            att.encoding.as_db(),
            att.encoded_length.map(|l| l as i64),
        ],
    )?;
    Ok(())
}

/// All attachment metadata for one revision, by name.
pub(crate) fn for_sequence(
    conn: &Connection,
    sequence: i64,
) -> StorageResult<BTreeMap<String, Attachment>> {
    let mut stmt = conn.prepare(
        "SELECT filename, key, type, length, revpos, encoding, encoded_length \
         FROM attachments WHERE sequence = ?1",
    )?;
    let rows = stmt.query_map(params![sequence], |row| {
        let name: String = row.get(0)?;
        let key: Vec<u8> = row.get(1)?;
        let content_type: Option<String> = row.get(2)?;
        let length: i64 = row.get(3)?;
        let revpos: i64 = row.get(4)?;
        let encoding: i64 = row.get(5)?;
        let encoded_length: Option<i64> = row.get(6)?;
        Ok((name, key, content_type, length, revpos, encoding, encoded_length))
    })?;

    let mut out = BTreeMap::new();
    for row in rows {
        let (name, key, content_type, length, revpos, encoding, encoded_length) = row?;
        let key = BlobKey::from_bytes(&key)
            .map_err(|_| StorageError::Corrupt(format!("attachment key for {name:?}")))?;
        out.insert(
            name.clone(),
            Attachment {
                name,
                content_type,
                length: length as u64,
                encoding: AttachmentEncoding::from_db(encoding),
                encoded_length: encoded_length.map(|l| l as u64),
                revpos: revpos as u64,
                key,
            },
        );
    }
    Ok(out)
}

/// Copies the named attachment row from `from_sequence` to `to_sequence`,
/// preserving key and revpos. Returns false when the parent has no such
/// attachment.
pub(crate) fn copy_row(
    conn: &Connection,
    from_sequence: i64,
    to_sequence: i64,
    name: &str,
) -> StorageResult<bool> {
    let copied = conn.execute(
        "INSERT INTO attachments \
             (sequence, filename, key, type, length, revpos, encoding, encoded_length) \
         SELECT ?1, filename, key, type, length, revpos, encoding, encoded_length \
         FROM attachments WHERE sequence = ?2 AND filename = ?3",
        params![to_sequence, from_sequence, name],
    )?;
    Ok(copied == 1)
}

/// Walks the parent chain starting at `sequence` looking for an attachment
/// row named `name`; copies the first hit onto `to_sequence`.
pub(crate) fn copy_from_ancestors(
    conn: &Connection,
    mut sequence: Option<i64>,
    to_sequence: i64,
    name: &str,
) -> StorageResult<bool> {
    while let Some(seq) = sequence {
        if copy_row(conn, seq, to_sequence, name)? {
            return Ok(true);
        }
        sequence = conn
            .query_row(
                "SELECT parent FROM revs WHERE sequence = ?1",
                params![seq],
                |row| row.get::<_, Option<i64>>(0),
            )
            .optional()?
            .flatten();
    }
    Ok(false)
}

/// The set of blob keys still referenced by any attachment row.
pub(crate) fn live_keys(conn: &Connection) -> StorageResult<std::collections::HashSet<BlobKey>> {
    let mut stmt = conn.prepare("SELECT DISTINCT key FROM attachments")?;
    let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
    let mut keys = std::collections::HashSet::new();
    for row in rows {
        let bytes = row?;
        let key = BlobKey::from_bytes(&bytes)
            .map_err(|_| StorageError::Corrupt("attachment key length".into()))?;
        keys.insert(key);
    }
    Ok(keys)
}
