//! Storage backends holding seal state.
//!
//! The seal layer only needs a flat key/value namespace. Keys are `/`
//! separated paths such as `core/seal-config`; values are opaque bytes.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::{SealError, SealResult};
use tokio::fs;

/// Flat key/value storage
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a value
    async fn get(&self, key: &str) -> SealResult<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one
    async fn put(&self, key: &str, value: Vec<u8>) -> SealResult<()>;

    /// Remove a value; returns whether it existed
    async fn delete(&self, key: &str) -> SealResult<bool>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> SealResult<Vec<String>>;
}

/// JSON helpers over any backend
#[async_trait]
pub trait StorageExt: StorageBackend {
    /// Read and decode a JSON record
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> SealResult<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and write a JSON record
    async fn put_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> SealResult<()> {
        self.put(key, serde_json::to_vec(value)?).await
    }
}

impl<S: StorageBackend + ?Sized> StorageExt for S {}

/// Process-local storage.
///
/// Clones share the same map, which is how several nodes of one test
/// cluster see a single shared store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryBackend {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.read().clone()
    }

    /// Replace the whole contents
    pub fn restore(&self, entries: BTreeMap<String, Vec<u8>>) {
        *self.data.write() = entries;
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> SealResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> SealResult<()> {
        self.data.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> SealResult<bool> {
        Ok(self.data.write().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> SealResult<Vec<String>> {
        Ok(self
            .data
            .read()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// One file per key under a base directory
#[derive(Debug, Clone)]
pub struct FileBackend {
    base_path: PathBuf,
}

impl FileBackend {
    /// Store files under `base_path`; the directory is created on first write
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Root directory
    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn key_path(&self, key: &str) -> SealResult<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(SealError::invalid_request(format!(
                "invalid storage key {key:?}"
            )));
        }
        let mut path = self.base_path.clone();
        path.push(format!("{key}.dat"));
        Ok(path)
    }

    fn key_for(&self, path: &std::path::Path) -> Option<String> {
        let rel = path.strip_prefix(&self.base_path).ok()?;
        let mut key = rel.to_string_lossy().to_string();
        if std::path::MAIN_SEPARATOR != '/' {
            key = key.replace(std::path::MAIN_SEPARATOR, "/");
        }
        key.strip_suffix(".dat").map(str::to_string)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &str) -> SealResult<Option<Vec<u8>>> {
        let path = self.key_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SealError::storage(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> SealResult<()> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                SealError::storage(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        // Write-then-rename so readers never see a torn record
        let tmp = path.with_extension("dat.tmp");
        fs::write(&tmp, &value)
            .await
            .map_err(|e| SealError::storage(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| SealError::storage(format!("failed to move {}: {e}", path.display())))
    }

    async fn delete(&self, key: &str) -> SealResult<bool> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SealError::storage(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    async fn list(&self, prefix: &str) -> SealResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut stack = vec![self.base_path.clone()];

        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(SealError::storage(format!(
                        "failed to list {}: {e}",
                        dir.display()
                    )))
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !file_type.is_file()
                    || path.extension().and_then(|e| e.to_str()) != Some("dat")
                {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn exercise(backend: &dyn StorageBackend) {
        assert_eq!(backend.get("core/seal-config").await.unwrap(), None);

        backend.put("core/seal-config", b"one".to_vec()).await.unwrap();
        backend.put("core/seal-config", b"two".to_vec()).await.unwrap();
        backend.put("logical/secret/foo", b"bar".to_vec()).await.unwrap();
        assert_eq!(
            backend.get("core/seal-config").await.unwrap(),
            Some(b"two".to_vec())
        );

        assert_eq!(
            backend.list("core/").await.unwrap(),
            vec!["core/seal-config".to_string()]
        );
        assert_eq!(backend.list("").await.unwrap().len(), 2);

        assert!(backend.delete("core/seal-config").await.unwrap());
        assert!(!backend.delete("core/seal-config").await.unwrap());
        assert_eq!(backend.get("core/seal-config").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_in_memory_backend() {
        exercise(&InMemoryBackend::new()).await;
    }

    #[tokio::test]
    async fn test_file_backend() {
        let dir = TempDir::new().unwrap();
        exercise(&FileBackend::new(dir.path())).await;
    }

    #[tokio::test]
    async fn test_in_memory_clones_share_data() {
        let a = InMemoryBackend::new();
        let b = a.clone();
        a.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_file_backend_survives_reopen() {
        let dir = TempDir::new().unwrap();
        FileBackend::new(dir.path())
            .put_json("core/recovery-config", &vec![1u32, 2, 3])
            .await
            .unwrap();

        let reopened = FileBackend::new(dir.path());
        let value: Option<Vec<u32>> = reopened.get_json("core/recovery-config").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn test_file_backend_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path());
        assert!(backend.put("../escape", vec![]).await.is_err());
        assert!(backend.get("core//x").await.is_err());
    }
}
