//! AEAD wrapping of key material and small records
//!
//! AES-256-GCM under a BLAKE3-derived key. The context string is bound into
//! the derived key, so a blob produced for one purpose never opens under another.

use crate::errors::{SealError, SealResult};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key,
};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Encrypted payload plus what is needed to open it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBlob {
    /// Ciphertext with GCM tag
    pub ciphertext: Vec<u8>,
    /// Random 96-bit nonce
    pub nonce: [u8; 12],
    /// Purpose string used for key derivation
    pub context: String,
}

impl SealedBlob {
    /// Encrypt `plaintext` under `secret`, bound to `context`
    pub fn seal<R: RngCore + CryptoRng>(
        plaintext: &[u8],
        secret: &[u8; 32],
        context: &str,
        rng: &mut R,
    ) -> SealResult<Self> {
        let mut nonce = [0u8; 12];
        rng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new(&derive_key(secret, context));
        let ciphertext = cipher
            .encrypt(
                &nonce.into(),
                Payload {
                    msg: plaintext,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|e| SealError::invalid_request(format!("encryption failed: {e}")))?;

        Ok(Self {
            ciphertext,
            nonce,
            context: context.to_string(),
        })
    }

    /// Decrypt; fails on a wrong key or any tampering
    pub fn open(&self, secret: &[u8; 32]) -> SealResult<Vec<u8>> {
        let cipher = Aes256Gcm::new(&derive_key(secret, &self.context));
        cipher
            .decrypt(
                &self.nonce.into(),
                Payload {
                    msg: &self.ciphertext,
                    aad: self.context.as_bytes(),
                },
            )
            .map_err(|e| SealError::invalid_request(format!("decryption failed: {e}")))
    }
}

fn derive_key(secret: &[u8; 32], context: &str) -> Key<Aes256Gcm> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tessera-wrapping-v1:");
    hasher.update(secret);
    hasher.update(b":");
    hasher.update(context.as_bytes());

    let mut derived: [u8; 32] = hasher.finalize().into();
    let key = Key::<Aes256Gcm>::clone_from_slice(&derived);
    derived.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_seal_open_roundtrip() {
        let secret = [7u8; 32];
        let blob = SealedBlob::seal(b"root key bytes", &secret, "root-key", &mut OsRng).unwrap();
        assert_eq!(blob.open(&secret).unwrap(), b"root key bytes");
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = SealedBlob::seal(b"payload", &[1u8; 32], "root-key", &mut OsRng).unwrap();
        let err = blob.open(&[2u8; 32]).unwrap_err();
        assert!(err.to_string().contains("decryption failed"));
    }

    #[test]
    fn test_context_is_bound() {
        let secret = [3u8; 32];
        let mut blob = SealedBlob::seal(b"payload", &secret, "root-key", &mut OsRng).unwrap();
        blob.context = "logical".to_string();
        assert!(blob.open(&secret).is_err());
    }

    #[test]
    fn test_tampering_detected() {
        let secret = [4u8; 32];
        let mut blob = SealedBlob::seal(b"payload", &secret, "root-key", &mut OsRng).unwrap();
        blob.ciphertext[0] ^= 0x01;
        assert!(blob.open(&secret).is_err());
    }
}
