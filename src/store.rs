//! Key-value persistence behind the upload cache and the uploaded markers.
//!
//! The host decides where state lives. [`MemoryStore`] is process-local,
//! [`JsonFileStore`] keeps a single JSON object on disk and rewrites it
//! atomically (temp file in the same directory, then rename) so a crash
//! mid-write never leaves a truncated cache behind.

use crate::error::BlockshotError;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// String → string store. Values are JSON documents.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, BlockshotError>;

    fn set(&self, key: &str, value: String) -> Result<(), BlockshotError>;

    fn remove(&self, key: &str) -> Result<(), BlockshotError>;

    /// All keys starting with `prefix`, in sorted order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlockshotError>;
}

fn poisoned(path: &Path) -> BlockshotError {
    BlockshotError::Store {
        path: path.to_path_buf(),
        detail: "store lock poisoned".into(),
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, BlockshotError> {
        let entries = self.entries.lock().map_err(|_| poisoned(Path::new(":memory:")))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), BlockshotError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned(Path::new(":memory:")))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BlockshotError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned(Path::new(":memory:")))?;
        entries.remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlockshotError> {
        let entries = self.entries.lock().map_err(|_| poisoned(Path::new(":memory:")))?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// A JSON object on disk, loaded once and rewritten on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, BlockshotError> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text).map_err(|e| BlockshotError::Store {
                path: path.clone(),
                detail: format!("invalid JSON: {e}"),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(BlockshotError::Store {
                    path,
                    detail: e.to_string(),
                })
            }
        };
        debug!("Store {}: {} entries", path.display(), entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), BlockshotError> {
        let store_err = |detail: String| BlockshotError::Store {
            path: self.path.clone(),
            detail,
        };

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| store_err(e.to_string()))?;

        let json = serde_json::to_string_pretty(entries).map_err(|e| store_err(e.to_string()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| store_err(e.to_string()))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| store_err(e.to_string()))?;
        tmp.persist(&self.path)
            .map_err(|e| store_err(e.error.to_string()))?;
        Ok(())
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, BlockshotError> {
        let entries = self.entries.lock().map_err(|_| poisoned(&self.path))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), BlockshotError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned(&self.path))?;
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), BlockshotError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned(&self.path))?;
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlockshotError> {
        let entries = self.entries.lock().map_err(|_| poisoned(&self.path))?;
        Ok(entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_basics() {
        let store = MemoryStore::new();
        store.set("cache:a", "1".into()).unwrap();
        store.set("cache:b", "2".into()).unwrap();
        store.set("uploaded:x", "3".into()).unwrap();
        assert_eq!(store.get("cache:a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.keys_with_prefix("cache:").unwrap(), vec!["cache:a", "cache:b"]);
        store.remove("cache:a").unwrap();
        assert_eq!(store.get("cache:a").unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = JsonFileStore::open(&path).unwrap();
        store.set("k", "{\"v\":1}".into()).unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("{\"v\":1}"));
        reopened.remove("k").unwrap();
        assert_eq!(JsonFileStore::open(&path).unwrap().get("k").unwrap(), None);
    }

    #[test]
    fn corrupt_file_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(BlockshotError::Store { .. })
        ));
    }
}
