//! Persistent schema and migrations
//!
//! The schema version lives in `PRAGMA user_version`. Migrations are
//! idempotent and version-gated: each runs only when the stored version is
//! below its number, and all of them execute inside the single transaction
//! that establishes the store, so a failure rolls the database back to its
//! prior version and the engine reports closed.
//!
//! Versions 1..6 establish the base schema. Version 100 rewrites legacy
//! plain-text checkpoint values into `{"seq": <value>}` documents. Version
//! 200 adds the `blob_filenames` table and back-fills a filename for every
//! attachment key already on disk under the legacy key-named layout.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::errors::StorageResult;

/// Schema version written by the newest migration.
pub const SCHEMA_VERSION: i32 = 200;

/// Runs all outstanding migrations on `conn` (which must be inside the
/// store-establishing transaction).
pub fn migrate(conn: &Connection) -> StorageResult<()> {
    let start = user_version(conn)?;
    if start >= SCHEMA_VERSION {
        debug!(version = start, "schema up to date");
        return Ok(());
    }
    if start < 1 {
        migration_001_documents(conn)?;
    }
    if start < 2 {
        migration_002_local_documents(conn)?;
    }
    if start < 3 {
        migration_003_views(conn)?;
    }
    if start < 4 {
        migration_004_attachments(conn)?;
    }
    if start < 5 {
        migration_005_replicators(conn)?;
    }
    if start < 6 {
        migration_006_info(conn)?;
    }
    if start < 100 {
        migration_100_checkpoint_json(conn)?;
    }
    if start < 200 {
        migration_200_blob_filenames(conn)?;
    }
    set_user_version(conn, SCHEMA_VERSION)?;
    info!(from = start, to = SCHEMA_VERSION, "schema migrated");
    Ok(())
}

pub(crate) fn user_version(conn: &Connection) -> StorageResult<i32> {
    let v: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(v)
}

fn set_user_version(conn: &Connection, version: i32) -> StorageResult<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// v1: documents and their revision forest.
fn migration_001_documents(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE docs (
             doc_id INTEGER PRIMARY KEY,
             docid TEXT UNIQUE NOT NULL
         );
         CREATE INDEX docs_docid ON docs(docid);
         CREATE TABLE revs (
             sequence INTEGER PRIMARY KEY AUTOINCREMENT,
             doc_id INTEGER NOT NULL REFERENCES docs(doc_id),
             revid TEXT NOT NULL COLLATE revid,
             parent INTEGER REFERENCES revs(sequence),
             current BOOLEAN NOT NULL DEFAULT 0,
             deleted BOOLEAN NOT NULL DEFAULT 0,
             json BLOB,
             UNIQUE (doc_id, revid)
         );
         CREATE INDEX revs_current ON revs(doc_id, current);
         CREATE INDEX revs_parent ON revs(parent);",
    )?;
    Ok(())
}

/// v2: non-replicated local documents.
fn migration_002_local_documents(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE localdocs (
             docid TEXT PRIMARY KEY NOT NULL,
             revid TEXT NOT NULL,
             json BLOB
         );",
    )?;
    Ok(())
}

/// v3: view metadata and map rows for the query collaborator.
fn migration_003_views(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE views (
             view_id INTEGER PRIMARY KEY,
             name TEXT UNIQUE NOT NULL,
             version TEXT,
             lastsequence INTEGER DEFAULT 0
         );
         CREATE TABLE maps (
             view_id INTEGER NOT NULL REFERENCES views(view_id),
             sequence INTEGER NOT NULL REFERENCES revs(sequence),
             key TEXT NOT NULL COLLATE json,
             value TEXT
         );
         CREATE INDEX maps_keys ON maps(view_id, key COLLATE json);",
    )?;
    Ok(())
}

/// v4: attachment rows keyed by (revision sequence, filename).
fn migration_004_attachments(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE attachments (
             sequence INTEGER NOT NULL REFERENCES revs(sequence),
             filename TEXT NOT NULL,
             key BLOB NOT NULL,
             type TEXT,
             length INTEGER NOT NULL,
             revpos INTEGER DEFAULT 0,
             encoding INTEGER DEFAULT 0,
             encoded_length INTEGER
         );
         CREATE INDEX attachments_by_sequence ON attachments(sequence, filename);",
    )?;
    Ok(())
}

/// v5: replication checkpoints.
fn migration_005_replicators(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE replicators (
             remote TEXT NOT NULL,
             push BOOLEAN NOT NULL DEFAULT 0,
             last_sequence TEXT,
             UNIQUE (remote, push)
         );",
    )?;
    Ok(())
}

/// v6: store identity.
fn migration_006_info(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE info (
             key TEXT PRIMARY KEY,
             value TEXT
         );",
    )?;
    conn.execute(
        "INSERT INTO info (key, value) VALUES ('privateUUID', ?1), ('publicUUID', ?2)",
        params![
            Uuid::new_v4().to_string(),
            Uuid::new_v4().to_string()
        ],
    )?;
    Ok(())
}

/// v100: wrap legacy plain checkpoint sequences as `{"seq": <value>}`.
fn migration_100_checkpoint_json(conn: &Connection) -> StorageResult<()> {
    let mut rewrites: Vec<(String, bool, String)> = Vec::new();
    {
        let mut stmt =
            conn.prepare("SELECT remote, push, last_sequence FROM replicators")?;
        let rows = stmt.query_map([], |row| {
            let remote: String = row.get(0)?;
            let push: bool = row.get(1)?;
            let last: Option<String> = row.get(2)?;
            Ok((remote, push, last))
        })?;
        for row in rows {
            let (remote, push, last) = row?;
            let Some(last) = last else { continue };
            let already_wrapped = serde_json::from_str::<Value>(&last)
                .ok()
                .and_then(|v| v.as_object().map(|o| o.contains_key("seq")))
                .unwrap_or(false);
            if !already_wrapped {
                let wrapped = serde_json::json!({ "seq": last }).to_string();
                rewrites.push((remote, push, wrapped));
            }
        }
    }
    for (remote, push, wrapped) in rewrites {
        conn.execute(
            "UPDATE replicators SET last_sequence = ?1 WHERE remote = ?2 AND push = ?3",
            params![wrapped, remote, push],
        )?;
    }
    Ok(())
}

/// v200: the key-to-filename table, back-filled for the legacy layout in
/// which each blob file was named by the hex of its key.
fn migration_200_blob_filenames(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE blob_filenames (
             key BLOB PRIMARY KEY,
             filename TEXT UNIQUE NOT NULL
         );",
    )?;
    let mut keys: Vec<Vec<u8>> = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT DISTINCT key FROM attachments")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        for row in rows {
            keys.push(row?);
        }
    }
    for key in keys {
        let filename = format!("{}.blob", hex::encode(&key));
        conn.execute(
            "INSERT OR IGNORE INTO blob_filenames (key, filename) VALUES (?1, ?2)",
            params![key, filename],
        )?;
    }
    Ok(())
}

/// Reads an `info` table value.
pub(crate) fn info_value(conn: &Connection, key: &str) -> StorageResult<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM info WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}
