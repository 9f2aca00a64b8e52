//! External key-wrapping service used by delegated seals.
//!
//! The service holds named keys and encrypts/decrypts on behalf of callers
//! presenting a token. [`InMemoryKeyWrapService`] plays the role of a transit
//! server for tests and single-process deployments: it can be stopped,
//! restarted and destroyed to exercise outage paths.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tessera_core::{SealError, SealResult, SealedBlob};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Ciphertext returned by the service, tagged with the key that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Name of the service-side key
    pub key_name: String,
    /// Version of that key at encryption time
    pub key_version: u32,
    /// Encrypted payload
    pub blob: SealedBlob,
}

/// Encrypt/decrypt operations exposed by a key-wrapping service
#[async_trait]
pub trait KeyWrapService: Send + Sync + fmt::Debug {
    /// Address the service is reachable at, for logs
    fn endpoint(&self) -> String;

    /// Encrypt `plaintext` under the named key
    async fn encrypt(&self, token: &str, key_name: &str, plaintext: &[u8])
        -> SealResult<WrappedKey>;

    /// Decrypt a previously wrapped payload
    async fn decrypt(&self, token: &str, wrapped: &WrappedKey) -> SealResult<Vec<u8>>;
}

const TRANSIT_CONTEXT: &str = "tessera-transit";

struct TransitKey {
    version: u32,
    material: Zeroizing<[u8; 32]>,
}

#[derive(Default)]
struct TransitState {
    keys: HashMap<String, TransitKey>,
    tokens: HashSet<String>,
    running: bool,
    destroyed: bool,
}

/// Process-local key-wrapping service
pub struct InMemoryKeyWrapService {
    endpoint: String,
    state: Mutex<TransitState>,
}

impl InMemoryKeyWrapService {
    /// A running service with no keys and no tokens
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(TransitState {
                running: true,
                ..TransitState::default()
            }),
        }
    }

    /// Create a named key; creating an existing name is a no-op
    pub fn make_key(&self, key_name: &str) -> SealResult<()> {
        let mut state = self.state.lock();
        Self::check_running(&state, &self.endpoint)?;
        state.keys.entry(key_name.to_string()).or_insert_with(|| {
            let mut material = Zeroizing::new([0u8; 32]);
            OsRng.fill_bytes(&mut material[..]);
            TransitKey {
                version: 1,
                material,
            }
        });
        info!(endpoint = %self.endpoint, key_name, "transit key created");
        Ok(())
    }

    /// Issue a token accepted for every key
    pub fn issue_token(&self) -> SealResult<String> {
        let mut state = self.state.lock();
        Self::check_running(&state, &self.endpoint)?;
        let token = format!("s.{}", Uuid::new_v4().simple());
        state.tokens.insert(token.clone());
        Ok(token)
    }

    /// Invalidate a token
    pub fn revoke_token(&self, token: &str) {
        self.state.lock().tokens.remove(token);
    }

    /// Stop answering requests; keys and tokens are kept
    pub fn shutdown(&self) {
        self.state.lock().running = false;
        warn!(endpoint = %self.endpoint, "transit service stopped");
    }

    /// Resume answering requests after [`shutdown`](Self::shutdown)
    pub fn restart(&self) -> SealResult<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(SealError::service_unavailable(format!(
                "transit service at {} has been destroyed",
                self.endpoint
            )));
        }
        state.running = true;
        info!(endpoint = %self.endpoint, "transit service restarted");
        Ok(())
    }

    /// Stop permanently and wipe every key
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.destroyed = true;
        state.keys.clear();
        state.tokens.clear();
        warn!(endpoint = %self.endpoint, "transit service destroyed");
    }

    /// Whether requests are currently answered
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    fn check_running(state: &TransitState, endpoint: &str) -> SealResult<()> {
        if state.running {
            Ok(())
        } else {
            Err(SealError::service_unavailable(format!(
                "transit service at {endpoint} is not reachable"
            )))
        }
    }

    fn authorize<'a>(
        state: &'a TransitState,
        endpoint: &str,
        token: &str,
        key_name: &str,
    ) -> SealResult<&'a TransitKey> {
        Self::check_running(state, endpoint)?;
        if !state.tokens.contains(token) {
            return Err(SealError::auth_denied(format!(
                "transit service at {endpoint} rejected the token"
            )));
        }
        state.keys.get(key_name).ok_or_else(|| {
            SealError::auth_denied(format!(
                "transit key {key_name:?} does not exist at {endpoint}"
            ))
        })
    }
}

impl fmt::Debug for InMemoryKeyWrapService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryKeyWrapService")
            .field("endpoint", &self.endpoint)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl KeyWrapService for InMemoryKeyWrapService {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn encrypt(
        &self,
        token: &str,
        key_name: &str,
        plaintext: &[u8],
    ) -> SealResult<WrappedKey> {
        let state = self.state.lock();
        let key = Self::authorize(&state, &self.endpoint, token, key_name)?;
        let blob = SealedBlob::seal(plaintext, &key.material, TRANSIT_CONTEXT, &mut OsRng)?;
        debug!(endpoint = %self.endpoint, key_name, "transit encrypt");
        Ok(WrappedKey {
            key_name: key_name.to_string(),
            key_version: key.version,
            blob,
        })
    }

    async fn decrypt(&self, token: &str, wrapped: &WrappedKey) -> SealResult<Vec<u8>> {
        let state = self.state.lock();
        let key = Self::authorize(&state, &self.endpoint, token, &wrapped.key_name)?;
        if wrapped.key_version != key.version {
            return Err(SealError::invalid_request(format!(
                "transit key {} has no version {}",
                wrapped.key_name, wrapped.key_version
            )));
        }
        debug!(endpoint = %self.endpoint, key_name = %wrapped.key_name, "transit decrypt");
        wrapped.blob.open(&key.material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn service() -> (InMemoryKeyWrapService, String) {
        let service = InMemoryKeyWrapService::new("127.0.0.1:8200");
        service.make_key("transit-seal-key").unwrap();
        let token = service.issue_token().unwrap();
        (service, token)
    }

    #[tokio::test]
    async fn test_encrypt_decrypt() {
        let (service, token) = service();
        let wrapped = service
            .encrypt(&token, "transit-seal-key", b"root")
            .await
            .unwrap();
        assert_eq!(wrapped.key_version, 1);
        assert_eq!(service.decrypt(&token, &wrapped).await.unwrap(), b"root");
    }

    #[tokio::test]
    async fn test_unreachable_is_service_unavailable() {
        let (service, token) = service();
        let wrapped = service
            .encrypt(&token, "transit-seal-key", b"root")
            .await
            .unwrap();

        service.shutdown();
        assert_matches!(
            service.decrypt(&token, &wrapped).await,
            Err(SealError::ServiceUnavailable { .. })
        );

        service.restart().unwrap();
        assert!(service.decrypt(&token, &wrapped).await.is_ok());
    }

    #[tokio::test]
    async fn test_bad_credentials_are_auth_denied() {
        let (service, token) = service();
        assert_matches!(
            service.encrypt("s.bogus", "transit-seal-key", b"x").await,
            Err(SealError::AuthDenied { .. })
        );
        assert_matches!(
            service.encrypt(&token, "missing-key", b"x").await,
            Err(SealError::AuthDenied { .. })
        );

        service.revoke_token(&token);
        assert_matches!(
            service.encrypt(&token, "transit-seal-key", b"x").await,
            Err(SealError::AuthDenied { .. })
        );
    }

    #[tokio::test]
    async fn test_destroy_is_permanent() {
        let (service, token) = service();
        service.destroy();
        assert!(service.restart().is_err());
        assert_matches!(
            service.encrypt(&token, "transit-seal-key", b"x").await,
            Err(SealError::ServiceUnavailable { .. })
        );
    }
}
