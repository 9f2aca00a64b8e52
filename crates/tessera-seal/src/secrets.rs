//! Logical data encrypted under the root key.
//!
//! Only reachable while a node is unsealed. Used to prove that data written
//! before a migration is still readable afterwards.

use crate::storage::{StorageBackend, StorageExt};
use rand::rngs::OsRng;
use serde_json::Value;
use std::sync::Arc;
use tessera_core::{RootKey, SealError, SealResult, SealedBlob};

const LOGICAL_PREFIX: &str = "logical/";
const LOGICAL_CONTEXT: &str = "tessera-logical";

/// JSON documents stored under `logical/<path>`
pub struct SecretStore {
    storage: Arc<dyn StorageBackend>,
    root_key: RootKey,
}

impl SecretStore {
    /// Store over `storage`, encrypting with `root_key`
    pub fn new(storage: Arc<dyn StorageBackend>, root_key: RootKey) -> Self {
        Self { storage, root_key }
    }

    /// Encrypt and write a document
    pub async fn write(&self, path: &str, value: &Value) -> SealResult<()> {
        let key = storage_key(path)?;
        let plaintext = serde_json::to_vec(value)?;
        let blob = SealedBlob::seal(
            &plaintext,
            self.root_key.as_bytes(),
            &context(path),
            &mut OsRng,
        )?;
        self.storage.put_json(&key, &blob).await
    }

    /// Read and decrypt a document
    pub async fn read(&self, path: &str) -> SealResult<Option<Value>> {
        let key = storage_key(path)?;
        let Some(blob) = self.storage.get_json::<SealedBlob>(&key).await? else {
            return Ok(None);
        };
        if blob.context != context(path) {
            return Err(SealError::consistency(format!(
                "record at {path} belongs to another path"
            )));
        }
        let plaintext = blob.open(self.root_key.as_bytes()).map_err(|_| {
            SealError::consistency(format!("record at {path} does not open under the root key"))
        })?;
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Remove a document
    pub async fn delete(&self, path: &str) -> SealResult<bool> {
        self.storage.delete(&storage_key(path)?).await
    }

    /// Paths under `prefix`
    pub async fn list(&self, prefix: &str) -> SealResult<Vec<String>> {
        let keys = self
            .storage
            .list(&format!("{LOGICAL_PREFIX}{prefix}"))
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(LOGICAL_PREFIX).map(str::to_string))
            .collect())
    }
}

fn storage_key(path: &str) -> SealResult<String> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Err(SealError::invalid_request("secret path cannot be empty"));
    }
    Ok(format!("{LOGICAL_PREFIX}{path}"))
}

fn context(path: &str) -> String {
    format!("{LOGICAL_CONTEXT}:{}", path.trim_matches('/'))
}
