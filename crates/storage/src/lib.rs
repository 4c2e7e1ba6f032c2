pub mod cache;
pub mod database;
pub mod retention;

pub use cache::{CacheOptions, DatabaseCache};
pub use database::{
    record_key, ApprovalUse, CandidateOptions, Database, Document, FailPolicy, FailStep,
    FailSweep, ServerSweep,
};
pub use retention::{PruneReport, RetentionPolicy};

use arbor_types::NodeError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage is not initialized")]
    NotInitialized,
}

impl From<StorageError> for NodeError {
    fn from(err: StorageError) -> Self {
        NodeError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One collection per entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Servers,
    Banlist,
    BehaviorCandidates,
    BehaviorFails,
    BehaviorDelays,
    Approval,
    Cache,
    Data,
}

impl Collection {
    pub const ALL: [Collection; 8] = [
        Collection::Servers,
        Collection::Banlist,
        Collection::BehaviorCandidates,
        Collection::BehaviorFails,
        Collection::BehaviorDelays,
        Collection::Approval,
        Collection::Cache,
        Collection::Data,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Servers => "servers",
            Collection::Banlist => "banlist",
            Collection::BehaviorCandidates => "behavior_candidates",
            Collection::BehaviorFails => "behavior_fails",
            Collection::BehaviorDelays => "behavior_delays",
            Collection::Approval => "approval",
            Collection::Cache => "cache",
            Collection::Data => "data",
        }
    }
}

/// Merge function handed to [`Storage::update`]. Returning `None` deletes the key.
pub type MergeFn<'a> = dyn FnMut(Option<&[u8]>) -> Option<Vec<u8>> + 'a;

/// Raw document store. Values are opaque bytes keyed by string inside a collection.
pub trait Storage: Send + Sync {
    fn init(&self) -> Result<()>;
    /// Flush and close. A later `init` reopens the same data.
    fn deinit(&self) -> Result<()>;
    /// Close and delete all data.
    fn destroy(&self) -> Result<()>;

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>>;
    fn insert(&self, collection: Collection, key: &str, value: Vec<u8>) -> Result<()>;
    fn remove(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>>;
    fn scan_prefix(&self, collection: Collection, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    /// Atomic read-modify-write of one key.
    fn update(
        &self,
        collection: Collection,
        key: &str,
        merge: &mut MergeFn<'_>,
    ) -> Result<Option<Vec<u8>>>;
    fn clear(&self, collection: Collection) -> Result<()>;
    fn len(&self, collection: Collection) -> Result<usize>;
    /// Monotonically increasing id, unique for the lifetime of the store.
    fn generate_id(&self) -> Result<u64>;
}

/// Backend selected by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Sled { path: PathBuf },
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sled {
            path: PathBuf::from("./data/db"),
        }
    }
}

impl StorageConfig {
    /// Build and initialize the configured backend.
    pub fn open(&self) -> Result<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = match self {
            StorageConfig::Sled { path } => Arc::new(SledStorage::new(path)),
            StorageConfig::Memory => Arc::new(MemoryStorage::default()),
        };
        storage.init()?;
        Ok(storage)
    }
}

/// Sled-backed implementation, one tree per collection.
pub struct SledStorage {
    path: PathBuf,
    db: RwLock<Option<Db>>,
}

impl SledStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            db: RwLock::new(None),
        }
    }

    /// Create and initialize in one step.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = Self::new(path);
        storage.init()?;
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tree(&self, collection: Collection) -> Result<Tree> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        Ok(db.open_tree(collection.name())?)
    }
}

impl Storage for SledStorage {
    fn init(&self) -> Result<()> {
        let mut guard = self.db.write();
        if guard.is_some() {
            return Ok(());
        }
        let db = sled::Config::default()
            .path(&self.path)
            .mode(sled::Mode::HighThroughput)
            .open()?;
        for collection in Collection::ALL {
            db.open_tree(collection.name())?;
        }
        info!("Opened sled storage at {}", self.path.display());
        *guard = Some(db);
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        if let Some(db) = self.db.write().take() {
            db.flush()?;
            debug!("Closed sled storage at {}", self.path.display());
        }
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        drop(self.db.write().take());
        if self.path.exists() {
            std::fs::remove_dir_all(&self.path)?;
        }
        info!("Destroyed sled storage at {}", self.path.display());
        Ok(())
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(collection)?.get(key)?.map(|v| v.to_vec()))
    }

    fn insert(&self, collection: Collection, key: &str, value: Vec<u8>) -> Result<()> {
        self.tree(collection)?.insert(key, value)?;
        Ok(())
    }

    fn remove(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree(collection)?.remove(key)?.map(|v| v.to_vec()))
    }

    fn scan_prefix(&self, collection: Collection, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.tree(collection)?.scan_prefix(prefix.as_bytes()) {
            let (key, value) = item?;
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(entries)
    }

    fn update(
        &self,
        collection: Collection,
        key: &str,
        merge: &mut MergeFn<'_>,
    ) -> Result<Option<Vec<u8>>> {
        let updated = self
            .tree(collection)?
            .update_and_fetch(key, |current| merge(current))?;
        Ok(updated.map(|v| v.to_vec()))
    }

    fn clear(&self, collection: Collection) -> Result<()> {
        self.tree(collection)?.clear()?;
        Ok(())
    }

    fn len(&self, collection: Collection) -> Result<usize> {
        Ok(self.tree(collection)?.len())
    }

    fn generate_id(&self) -> Result<u64> {
        let guard = self.db.read();
        let db = guard.as_ref().ok_or(StorageError::NotInitialized)?;
        Ok(db.generate_id()?)
    }
}

/// In-memory implementation for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<Collection, BTreeMap<String, Vec<u8>>>>,
    next_id: AtomicU64,
}

impl Storage for MemoryStorage {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        self.collections.write().clear();
        Ok(())
    }

    fn get(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .and_then(|c| c.get(key).cloned()))
    }

    fn insert(&self, collection: Collection, key: &str, value: Vec<u8>) -> Result<()> {
        self.collections
            .write()
            .entry(collection)
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, collection: Collection, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .collections
            .write()
            .get_mut(&collection)
            .and_then(|c| c.remove(key)))
    }

    fn scan_prefix(&self, collection: Collection, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let collections = self.collections.read();
        let Some(entries) = collections.get(&collection) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn update(
        &self,
        collection: Collection,
        key: &str,
        merge: &mut MergeFn<'_>,
    ) -> Result<Option<Vec<u8>>> {
        let mut collections = self.collections.write();
        let entries = collections.entry(collection).or_default();
        match merge(entries.get(key).map(Vec::as_slice)) {
            Some(value) => {
                entries.insert(key.to_string(), value.clone());
                Ok(Some(value))
            }
            None => {
                entries.remove(key);
                Ok(None)
            }
        }
    }

    fn clear(&self, collection: Collection) -> Result<()> {
        self.collections.write().remove(&collection);
        Ok(())
    }

    fn len(&self, collection: Collection) -> Result<usize> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .map(BTreeMap::len)
            .unwrap_or(0))
    }

    fn generate_id(&self) -> Result<u64> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(storage: &dyn Storage) {
        storage.insert(Collection::Data, "a", b"1".to_vec()).unwrap();
        storage.insert(Collection::Data, "ab", b"2".to_vec()).unwrap();
        storage.insert(Collection::Data, "b", b"3".to_vec()).unwrap();
        storage.insert(Collection::Cache, "a", b"x".to_vec()).unwrap();

        assert_eq!(storage.get(Collection::Data, "a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.scan_prefix(Collection::Data, "a").unwrap().len(), 2);
        assert_eq!(storage.len(Collection::Data).unwrap(), 3);

        let merged = storage
            .update(Collection::Data, "a", &mut |current| {
                let mut value = current.map(<[u8]>::to_vec).unwrap_or_default();
                value.push(b'!');
                Some(value)
            })
            .unwrap();
        assert_eq!(merged, Some(b"1!".to_vec()));

        let deleted = storage
            .update(Collection::Data, "b", &mut |_| None)
            .unwrap();
        assert!(deleted.is_none());
        assert!(storage.get(Collection::Data, "b").unwrap().is_none());

        storage.clear(Collection::Data).unwrap();
        assert_eq!(storage.len(Collection::Data).unwrap(), 0);
        assert_eq!(storage.len(Collection::Cache).unwrap(), 1);

        let first = storage.generate_id().unwrap();
        let second = storage.generate_id().unwrap();
        assert!(second > first);
    }

    #[test]
    fn memory_storage_primitives() {
        exercise(&MemoryStorage::default());
    }

    #[test]
    fn sled_storage_primitives() {
        let dir = TempDir::new().unwrap();
        let storage = SledStorage::open(dir.path().join("db")).unwrap();
        exercise(&storage);
    }

    #[test]
    fn sled_lifecycle_survives_reinit_and_destroy_removes_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        let storage = SledStorage::open(&path).unwrap();
        storage
            .insert(Collection::Servers, "localhost:1", b"{}".to_vec())
            .unwrap();

        storage.deinit().unwrap();
        assert!(matches!(
            storage.get(Collection::Servers, "localhost:1"),
            Err(StorageError::NotInitialized)
        ));
        assert!(path.exists());

        storage.init().unwrap();
        assert!(storage
            .get(Collection::Servers, "localhost:1")
            .unwrap()
            .is_some());

        storage.destroy().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn config_selects_backend() {
        let storage = StorageConfig::Memory.open().unwrap();
        storage.insert(Collection::Data, "k", b"v".to_vec()).unwrap();
        assert_eq!(storage.len(Collection::Data).unwrap(), 1);

        let parsed: StorageConfig =
            serde_json::from_str(r#"{"backend":"sled","path":"/tmp/x"}"#).unwrap();
        assert_eq!(
            parsed,
            StorageConfig::Sled {
                path: PathBuf::from("/tmp/x")
            }
        );
    }
}
