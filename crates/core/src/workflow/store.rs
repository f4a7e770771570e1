//! Durable session store used to persist paused workflows.
//!
//! Records are JSON values keyed by `(session_id, key)`.

use crate::supervisor::snapshot::sanitize_id;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to (de)serialize record {key}: {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value persistence scoped by session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Write a record, replacing any previous value.
    async fn save(&self, session_id: &str, key: &str, value: &Value) -> Result<(), StoreError>;

    async fn load(&self, session_id: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Remove a record. Returns `true` if it existed.
    async fn delete(&self, session_id: &str, key: &str) -> Result<bool, StoreError>;

    /// Keys stored for a session, sorted.
    async fn list(&self, session_id: &str) -> Result<Vec<String>, StoreError>;
}

/// Stores each record as `<root>/<session>/<key>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(sanitize_id(session_id))
    }

    fn record_path(&self, session_id: &str, key: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("{}.json", sanitize_id(key)))
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn save(&self, session_id: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

        let path = self.record_path(session_id, key);
        let json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
            key: key.to_string(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
        fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
        Ok(())
    }

    async fn load(&self, session_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.record_path(session_id, key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path)(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                key: key.to_string(),
                source,
            })
    }

    async fn delete(&self, session_id: &str, key: &str) -> Result<bool, StoreError> {
        let path = self.record_path(session_id, key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    async fn list(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.session_dir(session_id);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&dir))? {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                keys.push(key.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral daemons.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn save(&self, session_id: &str, key: &str, value: &Value) -> Result<(), StoreError> {
        self.records
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .records
            .lock()
            .get(session_id)
            .and_then(|session| session.get(key))
            .cloned())
    }

    async fn delete(&self, session_id: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .get_mut(session_id)
            .is_some_and(|session| session.remove(key).is_some()))
    }

    async fn list(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .records
            .lock()
            .get(session_id)
            .map(|session| session.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_json_file_store_lifecycle() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());

        assert!(store.load("s-1", "wf-1").await.unwrap().is_none());
        store.save("s-1", "wf-1", &json!({"phase": 2})).await.unwrap();
        store.save("s-1", "wf-0", &json!({"phase": 0})).await.unwrap();

        assert!(temp_dir.path().join("s-1/wf-1.json").exists());
        assert_eq!(store.load("s-1", "wf-1").await.unwrap(), Some(json!({"phase": 2})));
        assert_eq!(store.list("s-1").await.unwrap(), vec!["wf-0", "wf-1"]);
        assert!(store.list("s-2").await.unwrap().is_empty());

        assert!(store.delete("s-1", "wf-1").await.unwrap());
        assert!(!store.delete("s-1", "wf-1").await.unwrap());
        assert_eq!(store.list("s-1").await.unwrap(), vec!["wf-0"]);
    }

    #[tokio::test]
    async fn test_json_file_store_sanitizes_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());

        store.save("../escape", "a/b", &json!(1)).await.unwrap();
        assert!(temp_dir.path().join(".._escape/a_b.json").exists());
        assert_eq!(store.load("../escape", "a/b").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(temp_dir.path());
        std::fs::create_dir_all(temp_dir.path().join("s")).unwrap();
        std::fs::write(temp_dir.path().join("s/k.json"), "{not json").unwrap();

        let err = store.load("s", "k").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization { .. }));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.save("s", "b", &json!("two")).await.unwrap();
        store.save("s", "a", &json!("one")).await.unwrap();

        assert_eq!(store.list("s").await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.load("s", "a").await.unwrap(), Some(json!("one")));
        assert!(store.delete("s", "a").await.unwrap());
        assert!(!store.delete("s", "a").await.unwrap());
        assert!(!store.delete("other", "a").await.unwrap());
    }
}
