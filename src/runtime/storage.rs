//! Durable key/value storage and atomic write operations
//!
//! The engine persists stack frames and interpreter snapshots through the
//! [`KvStore`] trait. [`FileStore`] maps keys onto files below a root
//! directory and makes every write atomic via temp files and renames;
//! [`MemoryStore`] keeps everything in process for tests and embedding.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::EngineConfig;
use super::error::{StoreError, StoreResult};

/// Durable byte store used for stack frames and interpreter snapshots.
///
/// Each `write` must replace the whole value atomically: readers observe
/// either the previous bytes or the new bytes, never a mix.
pub trait KvStore {
    /// Read the value stored under `key`.
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;
    /// Replace the value stored under `key`.
    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()>;
    /// Remove `key`; removing an absent key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;
}

impl<T: KvStore + ?Sized> KvStore for &T {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).read(key)
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        (**self).write(key, bytes)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key)
    }
}

impl<T: KvStore + ?Sized> KvStore for Arc<T> {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        (**self).read(key)
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        (**self).write(key, bytes)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        (**self).delete(key)
    }
}

/// In-process store backed by a hash map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Stored keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl KvStore for MemoryStore {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries.read().get(key).cloned())
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        validate_key(key)?;
        self.entries.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        self.entries.write().remove(key);
        Ok(())
    }
}

/// File-backed store: one file per key below a root directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a new file store rooted at `root`
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the directory holding per-session stacks and snapshots
    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    /// Resolve a storage key to its file path
    pub fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> StoreResult<()> {
        let temp_path = path.with_extension("tmp");
        let failed = |detail: String| StoreError::AtomicWriteFailed {
            path: path.to_path_buf(),
            detail,
        };

        // Write to temporary file
        let mut file = File::create(&temp_path)
            .map_err(|e| failed(format!("create {:?}: {}", temp_path, e)))?;
        file.write_all(data)
            .map_err(|e| failed(format!("write: {}", e)))?;
        file.sync_all()
            .map_err(|e| failed(format!("sync: {}", e)))?;
        drop(file);

        // Rename atomically
        fs::rename(&temp_path, path)
            .map_err(|e| failed(format!("rename from {:?}: {}", temp_path, e)))?;

        // Sync parent directory
        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new().read(true).open(parent)?;
            dir.sync_all()?;
        }

        Ok(())
    }
}

impl KvStore for FileStore {
    fn read(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn write(&self, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.write_atomic(&path, bytes)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keys are `/`-separated relative paths without `.` or `..` segments.
fn validate_key(key: &str) -> StoreResult<()> {
    let invalid = key.is_empty()
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        || Path::new(key)
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Initialize storage directories for a new engine root
pub fn init_storage(root: &Path) -> StoreResult<()> {
    let store = FileStore::new(root.to_path_buf());
    fs::create_dir_all(root)?;
    fs::create_dir_all(store.sessions_dir())?;
    Ok(())
}

/// Write engine configuration
pub fn write_config(config: &EngineConfig) -> StoreResult<()> {
    let store = FileStore::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config)?;
    store.write_atomic(&store.config_path(), &json)
}

/// Load engine configuration
pub fn load_config(root: &Path) -> StoreResult<EngineConfig> {
    let store = FileStore::new(root.to_path_buf());
    let data = fs::read(store.config_path())
        .map_err(|e| StoreError::ConfigError(format!("{:?}: {}", store.config_path(), e)))?;
    let mut config: EngineConfig = serde_json::from_slice(&data)?;
    config.root = root.to_path_buf();
    Ok(config)
}
