//! Datastore manager
//!
//! Opens datastores under one directory and tracks the live ones by weak
//! reference, so a datastore's lifetime is owned by its callers and the
//! manager never keeps a store open by itself.
//!
//! Re-opening a store that is still open with a different encryption key
//! fingerprint is rejected; deleting a store's files requires it closed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use crate::revision::RevisionError;
use crate::storage::{key_fingerprint, KeyProvider, StorageEngine, StorageError, StorageResult};

use super::events::EventBus;
use super::facade::Datastore;

/// Factory and registry for [`Datastore`]s under one root directory.
pub struct DatastoreManager {
    dir: PathBuf,
    events: Arc<EventBus>,
    open: Mutex<HashMap<String, Weak<Datastore>>>,
}

impl DatastoreManager {
    /// Creates a manager rooted at `dir` (created if absent).
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            events: Arc::new(EventBus::new()),
            open: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of every store this manager opens.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The bus shared by every datastore this manager opens.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Opens (or returns the already-open) datastore `name`.
    ///
    /// `key` supplies the at-rest encryption key; opening a live store
    /// under a different key fails `AlreadyOpen`.
    pub fn open_datastore(
        &self,
        name: &str,
        key: &dyn KeyProvider,
    ) -> StorageResult<Arc<Datastore>> {
        validate_name(name)?;
        let fingerprint = key_fingerprint(key);
        let mut open = self.open.lock();
        if let Some(existing) = open.get(name).and_then(Weak::upgrade) {
            if existing.engine().key_fingerprint() != fingerprint {
                return Err(StorageError::AlreadyOpen(name.to_string()));
            }
            return Ok(existing);
        }

        let engine = Arc::new(StorageEngine::open(&self.dir, name, fingerprint)?);
        let datastore = Arc::new(Datastore::new(engine, self.events.clone()));
        open.insert(name.to_string(), Arc::downgrade(&datastore));
        info!(name, "datastore opened");
        Ok(datastore)
    }

    /// Deletes the on-disk files of a closed datastore.
    pub fn delete_datastore(&self, name: &str) -> StorageResult<()> {
        validate_name(name)?;
        let mut open = self.open.lock();
        if let Some(existing) = open.get(name).and_then(Weak::upgrade) {
            if existing.engine().state() != crate::storage::EngineState::Closed {
                return Err(StorageError::AlreadyOpen(name.to_string()));
            }
        }
        open.remove(name);
        StorageEngine::delete_files(&self.dir, name)?;
        info!(name, "datastore deleted");
        Ok(())
    }
}

fn validate_name(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(StorageError::Validation(RevisionError::InvalidDocumentId(
            format!("datastore name {name:?}"),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::storage::{FixedKey, NoEncryption};

    use super::*;

    #[test]
    fn test_open_returns_same_instance() {
        let dir = TempDir::new().unwrap();
        let manager = DatastoreManager::new(dir.path()).unwrap();
        let a = manager.open_datastore("db", &NoEncryption).unwrap();
        let b = manager.open_datastore("db", &NoEncryption).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_reopen_with_different_key_rejected() {
        let dir = TempDir::new().unwrap();
        let manager = DatastoreManager::new(dir.path()).unwrap();
        let _open = manager.open_datastore("db", &FixedKey([1; 32])).unwrap();
        assert!(matches!(
            manager.open_datastore("db", &FixedKey([2; 32])),
            Err(StorageError::AlreadyOpen(_))
        ));
    }

    #[test]
    fn test_delete_requires_closed() {
        let dir = TempDir::new().unwrap();
        let manager = DatastoreManager::new(dir.path()).unwrap();
        let ds = manager.open_datastore("db", &NoEncryption).unwrap();
        assert!(matches!(
            manager.delete_datastore("db"),
            Err(StorageError::AlreadyOpen(_))
        ));

        ds.close();
        manager.delete_datastore("db").unwrap();
        assert!(!dir.path().join("db.sqlite").exists());
    }

    #[test]
    fn test_dropping_handles_allows_reopen() {
        let dir = TempDir::new().unwrap();
        let manager = DatastoreManager::new(dir.path()).unwrap();
        {
            let ds = manager.open_datastore("db", &FixedKey([1; 32])).unwrap();
            ds.close();
        }
        // Handle dropped; a different key is fine now.
        manager.open_datastore("db", &FixedKey([2; 32])).unwrap();
    }

    #[test]
    fn test_name_validation() {
        let dir = TempDir::new().unwrap();
        let manager = DatastoreManager::new(dir.path()).unwrap();
        assert!(manager.open_datastore("ok_name-1", &NoEncryption).is_ok());
        assert!(manager.open_datastore("../escape", &NoEncryption).is_err());
        assert!(manager.open_datastore("", &NoEncryption).is_err());
    }
}
