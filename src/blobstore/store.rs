//! The blob store proper
//!
//! Invariants:
//! - The `blob_filenames` table is the authoritative index; a blob exists
//!   iff its key has a row. Files without a row are orphans, tolerated
//!   until the next GC pass.
//! - Keys are exactly 20 bytes (SHA-1 of the stored content).
//! - A writer's blob is not observable until `install()` commits.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::errors::{BlobStoreError, BlobStoreResult};
use super::key::BlobKey;
use super::reader::BlobReader;
use super::writer::BlobWriter;

/// Attempts at picking a fresh random filename before giving up.
const FILENAME_ATTEMPTS: usize = 10;

/// A persistent content-addressed store for arbitrary-size data blobs.
///
/// The store owns a directory of blob files plus a temp subdirectory for
/// in-flight writers. The key-to-filename rows live in the owning database,
/// so filename allocation participates in its transactions.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    temp_dir: PathBuf,
}

impl BlobStore {
    /// Opens (creating if needed) a blob store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> BlobStoreResult<Self> {
        let root = root.into();
        let temp_dir = root.join("tmp");
        fs::create_dir_all(&temp_dir)?;
        Ok(Self { root, temp_dir })
    }

    /// Directory holding the blob files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub(crate) fn path_for_filename(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    /// Stores `data`, returning its key. Storing bytes already present is a
    /// no-op returning the existing key.
    ///
    /// On a write failure the freshly inserted filename row is removed so
    /// the index never points at a missing file.
    pub fn store(&self, conn: &Connection, data: &[u8]) -> BlobStoreResult<BlobKey> {
        let key = BlobKey::for_content(data);
        if self.filename_for_key(conn, &key)?.is_some() {
            return Ok(key);
        }
        let filename = self.insert_filename_row(conn, &key)?;
        let path = self.path_for_filename(&filename);
        if let Err(err) = fs::write(&path, data) {
            // Roll the index back by hand; the caller's transaction may
            // still commit other work.
            let _ = conn.execute(
                "DELETE FROM blob_filenames WHERE key = ?1",
                params![key.as_bytes().as_slice()],
            );
            return Err(err.into());
        }
        debug!(key = %key, len = data.len(), "stored blob");
        Ok(key)
    }

    /// Opens a streaming writer staged in the store's temp directory.
    pub fn open_writer(&self) -> BlobStoreResult<BlobWriter> {
        BlobWriter::create(self.clone())
    }

    /// Returns a reader for the blob at `key`.
    pub fn read(&self, conn: &Connection, key: &BlobKey) -> BlobStoreResult<BlobReader> {
        let filename = self
            .filename_for_key(conn, key)?
            .ok_or_else(|| BlobStoreError::BlobNotFound(key.to_hex()))?;
        BlobReader::open(self.path_for_filename(&filename))
    }

    /// Number of blobs registered in the database.
    pub fn count(&self, conn: &Connection) -> BlobStoreResult<u64> {
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM blob_filenames", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Deletes every blob whose key is not in `keep`, then removes disk
    /// files no retained row points at.
    ///
    /// Returns the number of index rows removed. Do not roll back the
    /// enclosing transaction after calling this: deleted files are gone.
    pub fn gc(&self, conn: &Connection, keep: &HashSet<BlobKey>) -> BlobStoreResult<usize> {
        let mut kept_files: HashSet<String> = HashSet::new();
        let mut doomed: Vec<(BlobKey, String)> = Vec::new();
        {
            let mut stmt = conn.prepare("SELECT key, filename FROM blob_filenames")?;
            let rows = stmt.query_map([], |row| {
                let key: Vec<u8> = row.get(0)?;
                let filename: String = row.get(1)?;
                Ok((key, filename))
            })?;
            for row in rows {
                let (key_bytes, filename) = row?;
                let key = BlobKey::from_bytes(&key_bytes)
                    .map_err(|_| BlobStoreError::InvalidKeyLength(key_bytes.len()))?;
                if keep.contains(&key) {
                    kept_files.insert(filename);
                } else {
                    doomed.push((key, filename));
                }
            }
        }

        for (key, _) in &doomed {
            conn.execute(
                "DELETE FROM blob_filenames WHERE key = ?1",
                params![key.as_bytes().as_slice()],
            )?;
        }

        // Sweep the directory: anything not referenced by a retained row
        // goes, which also collects orphans from interrupted writes.
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if kept_files.contains(&name) {
                continue;
            }
            if let Err(err) = fs::remove_file(entry.path()) {
                warn!(file = %name, %err, "failed to remove blob file during gc");
            } else {
                removed += 1;
            }
        }
        debug!(
            rows_deleted = doomed.len(),
            files_removed = removed,
            "blob store gc complete"
        );
        Ok(doomed.len())
    }

    /// Looks up the filename registered for `key`.
    pub(crate) fn filename_for_key(
        &self,
        conn: &Connection,
        key: &BlobKey,
    ) -> BlobStoreResult<Option<String>> {
        let filename = conn
            .query_row(
                "SELECT filename FROM blob_filenames WHERE key = ?1",
                params![key.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(filename)
    }

    /// Allocates a fresh random filename for `key` and inserts its row.
    pub(crate) fn insert_filename_row(
        &self,
        conn: &Connection,
        key: &BlobKey,
    ) -> BlobStoreResult<String> {
        for _ in 0..FILENAME_ATTEMPTS {
            let filename = generate_filename();
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO blob_filenames (key, filename) VALUES (?1, ?2)",
                params![key.as_bytes().as_slice(), &filename],
            )?;
            if inserted == 1 {
                return Ok(filename);
            }
            // Either the key raced in (fine, reuse it) or the random name
            // collided (try another).
            if let Some(existing) = self.filename_for_key(conn, key)? {
                return Ok(existing);
            }
        }
        Err(BlobStoreError::NoFilenameGenerated(key.to_hex()))
    }
}

fn generate_filename() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}.blob", hex::encode(bytes))
}
