//! Key/value directory backing the dev registry.
//!
//! Each key is owned by exactly one writer (the worker of that name), so the
//! store needs no locking. Readers must tolerate keys appearing, vanishing or
//! changing between calls.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid worker name {0:?}: use letters, digits, '.', '_' or '-'")]
    InvalidName(String),
    #[error("registry io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Names double as file names, so only a conservative character set is allowed.
pub fn validate_name(name: &str) -> Result<(), RegistryError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidName(name.to_string()))
    }
}

#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), RegistryError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, RegistryError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, RegistryError>;

    async fn keys(&self) -> Result<Vec<String>, RegistryError>;
}

/// One JSON file per worker in a directory shared by every local process.
#[derive(Debug, Clone)]
pub struct FileRegistryStore {
    dir: PathBuf,
}

impl FileRegistryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", key, ENTRY_EXTENSION))
    }

    fn io_error(path: &Path, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl RegistryStore for FileRegistryStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), RegistryError> {
        validate_name(key)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?;

        // Write-then-rename so concurrent readers never observe a partial file.
        let path = self.entry_path(key);
        let tmp = self
            .dir
            .join(format!(".{}.{:016x}.tmp", key, rand::random::<u64>()));
        tokio::fs::write(&tmp, &value)
            .await
            .map_err(|e| Self::io_error(&tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io_error(&path, e));
        }
        debug!(key, path = %path.display(), "registry entry written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, RegistryError> {
        validate_name(key)?;
        let path = self.entry_path(key);
        match tokio::fs::read(&path).await {
            Ok(content) => Ok(Some(Bytes::from(content))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        validate_name(key)?;
        let path = self.entry_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, RegistryError> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&self.dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_name(stem).is_ok() {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process store with the same contract, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryRegistryStore {
    entries: Mutex<HashMap<String, Bytes>>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn put(&self, key: &str, value: Bytes) -> Result<(), RegistryError> {
        validate_name(key)?;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, RegistryError> {
        validate_name(key)?;
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, RegistryError> {
        validate_name(key)?;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Ok(entries.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, RegistryError> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("worker-a").is_ok());
        assert!(validate_name("my_worker.v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("../etc/passwd").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("has space").is_err());
    }

    #[tokio::test]
    async fn test_file_store_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path().join("registry"));

        assert_eq!(store.get("worker-a").await.unwrap(), None);
        assert!(store.keys().await.unwrap().is_empty());

        store
            .put("worker-a", Bytes::from_static(b"{\"v\":1}"))
            .await
            .unwrap();
        store
            .put("worker-a", Bytes::from_static(b"{\"v\":2}"))
            .await
            .unwrap();
        assert_eq!(
            store.get("worker-a").await.unwrap(),
            Some(Bytes::from_static(b"{\"v\":2}"))
        );
        assert_eq!(store.keys().await.unwrap(), vec!["worker-a".to_string()]);

        assert!(store.delete("worker-a").await.unwrap());
        assert!(!store.delete("worker-a").await.unwrap());
        assert_eq!(store.get("worker-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_store_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        std::fs::write(dir.path().join(".b.0000.tmp"), "partial").unwrap();
        let store = FileRegistryStore::new(dir.path());
        store.put("b", Bytes::from_static(b"{}")).await.unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path());
        let err = store
            .put("../escape", Bytes::from_static(b"{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidName(_)));
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryRegistryStore::new();
        store.put("b", Bytes::from_static(b"2")).await.unwrap();
        store.put("a", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(
            store.keys().await.unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
