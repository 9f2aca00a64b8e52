//! Persisted protected root key.
//!
//! A migration commit stages the re-protected record before it touches the
//! seal configs, so an interrupted commit always leaves a record matching
//! whichever barrier kind ended up stored.

use crate::storage::{StorageBackend, StorageExt};
use crate::strategy::ProtectedRootKey;
use std::sync::Arc;
use tessera_core::{SealKind, SealResult};
use tracing::{debug, warn};

const ROOT_KEY_PATH: &str = "core/root-key";
const STAGED_ROOT_KEY_PATH: &str = "core/root-key-staged";

/// Reads and writes the protected root key record
#[derive(Clone)]
pub struct Keyring {
    storage: Arc<dyn StorageBackend>,
}

impl Keyring {
    /// Keyring backed by `storage`
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Stored record, if any
    pub async fn read(&self) -> SealResult<Option<ProtectedRootKey>> {
        self.storage.get_json(ROOT_KEY_PATH).await
    }

    /// Record usable under a barrier of `kind`.
    ///
    /// Falls back to the staged record when the current one was written by
    /// another seal type; returns the current record otherwise.
    pub async fn read_for(&self, kind: SealKind) -> SealResult<Option<ProtectedRootKey>> {
        let current = self.read().await?;
        if current.as_ref().is_some_and(|record| record.kind() == kind) {
            return Ok(current);
        }
        let staged: Option<ProtectedRootKey> = self.storage.get_json(STAGED_ROOT_KEY_PATH).await?;
        match staged {
            Some(staged) if staged.kind() == kind => {
                warn!(%kind, "root key record found only in the staging slot");
                Ok(Some(staged))
            }
            _ => Ok(current),
        }
    }

    /// Replace the stored record
    pub async fn write(&self, protected: &ProtectedRootKey) -> SealResult<()> {
        self.storage.put_json(ROOT_KEY_PATH, protected).await
    }

    /// Park `protected` until [`finish`](Self::finish)
    pub async fn stage(&self, protected: &ProtectedRootKey) -> SealResult<()> {
        self.storage.put_json(STAGED_ROOT_KEY_PATH, protected).await?;
        debug!(kind = %protected.kind(), "root key record staged");
        Ok(())
    }

    /// Make `protected` current and drop the staged copy
    pub async fn finish(&self, protected: &ProtectedRootKey) -> SealResult<()> {
        self.write(protected).await?;
        self.storage.delete(STAGED_ROOT_KEY_PATH).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::WrappedKey;
    use crate::storage::InMemoryBackend;
    use tessera_core::SealedBlob;

    fn shamir_record() -> ProtectedRootKey {
        ProtectedRootKey::Shamir {
            wrapped: SealedBlob::seal(b"k", &[1u8; 32], "ctx", &mut rand::rngs::OsRng).unwrap(),
            retired: None,
        }
    }

    fn delegated_record() -> ProtectedRootKey {
        ProtectedRootKey::Delegated {
            wrapped: WrappedKey {
                key_name: "seal-key".into(),
                key_version: 1,
                blob: SealedBlob::seal(b"k", &[2u8; 32], "ctx", &mut rand::rngs::OsRng).unwrap(),
            },
            recovery_verifier: [7u8; 32],
        }
    }

    #[tokio::test]
    async fn test_read_write() {
        let keyring = Keyring::new(Arc::new(InMemoryBackend::new()));
        assert_eq!(keyring.read().await.unwrap(), None);

        let record = shamir_record();
        keyring.write(&record).await.unwrap();
        assert_eq!(keyring.read().await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn test_staged_record_used_only_for_its_kind() {
        let backend = InMemoryBackend::new();
        let keyring = Keyring::new(Arc::new(backend.clone()));
        let old = shamir_record();
        let new = delegated_record();
        keyring.write(&old).await.unwrap();
        keyring.stage(&new).await.unwrap();

        assert_eq!(keyring.read().await.unwrap(), Some(old.clone()));
        assert_eq!(
            keyring.read_for(SealKind::Shamir).await.unwrap(),
            Some(old)
        );
        assert_eq!(
            keyring.read_for(SealKind::Delegated).await.unwrap(),
            Some(new.clone())
        );

        keyring.finish(&new).await.unwrap();
        assert_eq!(keyring.read().await.unwrap(), Some(new));
        assert_eq!(backend.get(STAGED_ROOT_KEY_PATH).await.unwrap(), None);
    }
}
