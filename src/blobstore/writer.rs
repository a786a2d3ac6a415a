//! Streaming blob writer
//!
//! Lets a large attachment be streamed into the store asynchronously, e.g.
//! from a network download, without holding it in memory. Running SHA-1,
//! SHA-256 and MD5 digests are maintained as data is appended; `finish()`
//! seals them and fixes the blob key.
//!
//! Lifecycle: `append`* -> `finish` -> `install` (inside a database
//! transaction) or `cancel`. Dropping an uninstalled writer removes its
//! temp file on any exit path.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use md5::Md5;
use rusqlite::Connection;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tracing::debug;
use uuid::Uuid;

use super::errors::{BlobStoreError, BlobStoreResult};
use super::key::BlobKey;
use super::store::BlobStore;

/// Incremental writer for one blob.
#[derive(Debug)]
pub struct BlobWriter {
    store: BlobStore,
    temp_path: PathBuf,
    file: Option<File>,
    length: u64,
    sha1: Sha1,
    sha256: Sha256,
    md5: Md5,
    digests: Option<Digests>,
    installed: bool,
}

#[derive(Debug, Clone)]
struct Digests {
    key: BlobKey,
    sha256: [u8; 32],
    md5: [u8; 16],
}

impl BlobWriter {
    pub(crate) fn create(store: BlobStore) -> BlobStoreResult<Self> {
        let temp_path = store
            .temp_dir()
            .join(format!("{}.blobtmp", Uuid::new_v4().simple()));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        Ok(Self {
            store,
            temp_path,
            file: Some(file),
            length: 0,
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            md5: Md5::new(),
            digests: None,
            installed: false,
        })
    }

    /// Appends data to the blob. Call this when new data is available.
    pub fn append(&mut self, data: &[u8]) -> BlobStoreResult<()> {
        let file = self.file.as_mut().ok_or(BlobStoreError::WriterFinished)?;
        file.write_all(data)?;
        self.sha1.update(data);
        self.sha256.update(data);
        self.md5.update(data);
        self.length += data.len() as u64;
        Ok(())
    }

    /// Seals the digests after all data has been appended and returns the
    /// blob key.
    pub fn finish(&mut self) -> BlobStoreResult<BlobKey> {
        let file = self.file.take().ok_or(BlobStoreError::WriterFinished)?;
        file.sync_all()?;
        drop(file);
        let sha1: [u8; 20] = self.sha1.finalize_reset().into();
        let key = BlobKey::from_bytes(&sha1)?;
        let sha256: [u8; 32] = self.sha256.finalize_reset().into();
        let md5: [u8; 16] = self.md5.finalize_reset().into();
        self.digests = Some(Digests { key, sha256, md5 });
        Ok(key)
    }

    /// Bytes appended so far.
    #[inline]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The blob key; available after `finish()`.
    pub fn key(&self) -> Option<BlobKey> {
        self.digests.as_ref().map(|d| d.key)
    }

    /// SHA-256 of the content; available after `finish()`.
    pub fn sha256_digest(&self) -> Option<[u8; 32]> {
        self.digests.as_ref().map(|d| d.sha256)
    }

    /// Raw MD5 digest; available after `finish()`.
    pub fn md5_digest(&self) -> Option<[u8; 16]> {
        self.digests.as_ref().map(|d| d.md5)
    }

    /// CouchDB-compatible digest string, `md5-<base64>`.
    pub fn md5_digest_string(&self) -> Option<String> {
        self.digests
            .as_ref()
            .map(|d| format!("md5-{}", data_encoding::BASE64.encode(&d.md5)))
    }

    /// `sha1-<base64>` digest string.
    pub fn sha1_digest_string(&self) -> Option<String> {
        self.digests.as_ref().map(|d| d.key.digest_string())
    }

    /// Installs the finished blob into the store.
    ///
    /// Must run while `conn` is inside a transaction: the filename row and
    /// the file move become visible together. If a file already exists at
    /// the destination (stale from a rolled-back prior attempt) it is
    /// replaced.
    pub fn install(mut self, conn: &Connection) -> BlobStoreResult<BlobKey> {
        let key = self
            .digests
            .as_ref()
            .ok_or(BlobStoreError::WriterNotFinished)?
            .key;

        if self.store.filename_for_key(conn, &key)?.is_some() {
            // Identical content already installed; drop the temp copy.
            self.installed = true;
            fs::remove_file(&self.temp_path)?;
            return Ok(key);
        }

        let store = self.store.clone();
        let filename = store.insert_filename_row(conn, &key)?;
        let dest = store.path_for_filename(&filename);
        if dest.exists() {
            fs::remove_file(&dest)?;
        }
        fs::rename(&self.temp_path, &dest)?;
        self.installed = true;
        debug!(key = %key, len = self.length, "installed blob");
        Ok(key)
    }

    /// Abandons the blob, removing the temp file.
    pub fn cancel(mut self) {
        self.file = None;
        self.remove_temp();
        self.installed = true;
    }

    fn remove_temp(&self) {
        let _ = fs::remove_file(&self.temp_path);
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if !self.installed {
            self.file = None;
            self.remove_temp();
        }
    }
}
