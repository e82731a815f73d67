//! Key/value storage capability.
//!
//! The tracker keeps two scopes, mirroring a browser's local and session
//! storage: [`StorageScope::Durable`] survives restarts, [`StorageScope::Session`]
//! lives as long as the host's browsing session. Each scope is backed by any
//! [`Storage`] implementation chosen at construction.
//!
//! Callers never see storage failures. [`BestEffortStorage`] logs and
//! swallows them; the identity manager keeps its own in-memory copy, so a
//! broken backend only means state is not remembered across page loads.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use pixel_core::{PixelError, Result};
use tracing::{debug, warn};

/// Minimal storage capability: string keys to string values.
pub trait Storage: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write a value.
    fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Delete a value. Deleting a missing key succeeds.
    fn remove(&self, key: &str) -> Result<()>;
}

/// Which storage scope a value lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageScope {
    /// Survives restarts (visitor ID, identity, UTM).
    Durable,
    /// Lives for the browsing session (session ID, last activity).
    Session,
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Durable => f.write_str("durable"),
            Self::Session => f.write_str("session"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryStorage
// ─────────────────────────────────────────────────────────────────────────────

/// In-process storage. Used for the session scope and in tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _ = self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _ = self.entries.lock().remove(key);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FileStorage
// ─────────────────────────────────────────────────────────────────────────────

/// Durable storage backed by a single JSON object on disk.
///
/// The whole document is rewritten on every mutation (write to a sibling
/// temp file, then rename).
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStorage {
    /// Open (or lazily create) the store at `path`.
    ///
    /// A missing file starts empty. An unreadable or corrupt file also starts
    /// empty (with a warning) and is replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt storage file, starting empty");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "unreadable storage file, starting empty"
                );
                BTreeMap::new()
            }
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let unavailable = |e: std::io::Error| PixelError::StorageUnavailable(e.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(unavailable)?;
        std::fs::rename(&tmp, &self.path).map_err(unavailable)
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        let _ = entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BestEffortStorage
// ─────────────────────────────────────────────────────────────────────────────

/// Wraps a [`Storage`] so that every failure becomes a logged no-op.
#[derive(Clone)]
pub struct BestEffortStorage {
    inner: Arc<dyn Storage>,
    scope: StorageScope,
}

impl fmt::Debug for BestEffortStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BestEffortStorage")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl BestEffortStorage {
    /// Wrap `inner` for the given scope.
    pub fn new(inner: Arc<dyn Storage>, scope: StorageScope) -> Self {
        Self { inner, scope }
    }

    /// Read a value; failures read as absent.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.inner.get(key) {
            Ok(value) => value,
            Err(e) => {
                debug!(scope = %self.scope, key, error = %e, "storage read failed");
                None
            }
        }
    }

    /// Read and deserialize a JSON value; failures and garbage read as absent.
    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(scope = %self.scope, key, error = %e, "stored value is not valid JSON");
                None
            }
        }
    }

    /// Write a value. Returns whether the write reached the backend.
    pub fn set(&self, key: &str, value: &str) -> bool {
        match self.inner.set(key, value) {
            Ok(()) => true,
            Err(e) => {
                debug!(scope = %self.scope, key, error = %e, "storage write failed");
                false
            }
        }
    }

    /// Serialize and write a JSON value.
    pub fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw),
            Err(e) => {
                debug!(scope = %self.scope, key, error = %e, "value not serializable");
                false
            }
        }
    }

    /// Delete a value. Returns whether the delete reached the backend.
    pub fn remove(&self, key: &str) -> bool {
        match self.inner.remove(key) {
            Ok(()) => true,
            Err(e) => {
                debug!(scope = %self.scope, key, error = %e, "storage delete failed");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Backend that rejects everything, like storage in a locked-down browser.
    pub(crate) struct UnavailableStorage;

    impl Storage for UnavailableStorage {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(PixelError::StorageUnavailable("disabled".into()))
        }
        fn set(&self, _key: &str, _value: &str) -> Result<()> {
            Err(PixelError::StorageUnavailable("quota exceeded".into()))
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Err(PixelError::StorageUnavailable("disabled".into()))
        }
    }

    #[test]
    fn memory_storage_roundtrip() {
        let store = MemoryStorage::new();
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        store.remove("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("storage.json");

        let store = FileStorage::open(&path);
        store.set("pixel_visitor_id", "v-1").unwrap();
        drop(store);

        let reopened = FileStorage::open(&path);
        assert_eq!(reopened.get("pixel_visitor_id").unwrap().as_deref(), Some("v-1"));
    }

    #[test]
    fn file_storage_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        let store = FileStorage::open(&path);
        store.set("a", "1").unwrap();
        store.remove("a").unwrap();
        assert_eq!(FileStorage::open(&path).get("a").unwrap(), None);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = FileStorage::open(&path);
        assert_eq!(store.get("anything").unwrap(), None);
        store.set("fresh", "yes").unwrap();
        assert_eq!(FileStorage::open(&path).get("fresh").unwrap().as_deref(), Some("yes"));
    }

    #[test]
    fn best_effort_swallows_failures() {
        let store = BestEffortStorage::new(Arc::new(UnavailableStorage), StorageScope::Durable);
        assert_eq!(store.get("k"), None);
        assert!(!store.set("k", "v"));
        assert!(!store.remove("k"));
        assert!(!store.set_json("k", &serde_json::json!({"a": 1})));
    }

    #[test]
    fn best_effort_json_ignores_garbage() {
        let backend = Arc::new(MemoryStorage::new());
        backend.set("utm", "{{{").unwrap();
        let store = BestEffortStorage::new(backend, StorageScope::Durable);
        assert_eq!(store.get_json::<serde_json::Value>("utm"), None);
    }
}
