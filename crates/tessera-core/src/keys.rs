//! Key material: the root key, the share-protected unseal key, and key shares.
//!
//! All three zeroize on drop and print only a short fingerprint.

use crate::errors::{SealError, SealResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

const FINGERPRINT_CONTEXT: &str = "tessera 2024 key fingerprint";
const VERIFIER_CONTEXT: &str = "tessera 2024 recovery key verifier";

fn fingerprint(bytes: &[u8]) -> String {
    let digest = blake3::derive_key(FINGERPRINT_CONTEXT, bytes);
    hex::encode(&digest[..4])
}

/// The symmetric key that ultimately protects all data at rest.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RootKey([u8; 32]);

impl RootKey {
    /// Generate a fresh root key
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, as returned by an unwrap operation
    pub fn from_slice(bytes: &[u8]) -> SealResult<Self> {
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SealError::invalid_request("root key must be 32 bytes"))?;
        Ok(Self(bytes))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short identifier safe to log
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl fmt::Debug for RootKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RootKey({})", self.fingerprint())
    }
}

/// Key reconstructed from operator shares.
///
/// Behind a Shamir barrier it unwraps the stored root key; behind a delegated
/// barrier it is the recovery key and only its verifier is persisted. Keeping
/// one key across both roles is what lets a migration turn barrier keys into
/// recovery keys and back without handing out new shares.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct UnsealKey {
    scalar: Scalar,
}

impl UnsealKey {
    /// Generate a uniformly random unseal key
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut wide = [0u8; 64];
        rng.fill_bytes(&mut wide);
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        wide.zeroize();
        Self { scalar }
    }

    pub(crate) fn from_scalar(scalar: Scalar) -> Self {
        Self { scalar }
    }

    pub(crate) fn scalar(&self) -> Scalar {
        self.scalar
    }

    /// Derive a 32-byte wrapping key for the given purpose
    pub fn wrapping_key(&self, context: &str) -> [u8; 32] {
        blake3::derive_key(context, self.scalar.as_bytes())
    }

    /// Digest persisted next to a recovery config to check recovery keys
    /// without contacting the delegated service.
    pub fn verifier(&self) -> [u8; 32] {
        blake3::derive_key(VERIFIER_CONTEXT, self.scalar.as_bytes())
    }

    /// Short identifier safe to log
    pub fn fingerprint(&self) -> String {
        fingerprint(self.scalar.as_bytes())
    }
}

impl fmt::Debug for UnsealKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UnsealKey({})", self.fingerprint())
    }
}

/// One point of a split unseal key, handed to an operator.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct KeyShare {
    index: u8,
    value: [u8; 32],
}

impl KeyShare {
    /// Length of the encoded form: one index byte followed by the value
    pub const ENCODED_LEN: usize = 33;

    /// Build a share, rejecting the reserved index 0 and non-canonical values
    pub fn new(index: u8, value: [u8; 32]) -> SealResult<Self> {
        if index == 0 {
            return Err(SealError::invalid_request("share index 0 is reserved"));
        }
        let share = Self { index, value };
        share.scalar()?;
        Ok(share)
    }

    pub(crate) fn from_point(index: u8, scalar: Scalar) -> Self {
        Self {
            index,
            value: scalar.to_bytes(),
        }
    }

    /// Share index (the x coordinate)
    pub fn index(&self) -> u8 {
        self.index
    }

    pub(crate) fn scalar(&self) -> SealResult<Scalar> {
        Option::<Scalar>::from(Scalar::from_canonical_bytes(self.value))
            .ok_or_else(|| SealError::invalid_request("share value is not a canonical scalar"))
    }

    /// Encoded form handed to operators
    pub fn to_base64(&self) -> String {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[0] = self.index;
        bytes[1..].copy_from_slice(&self.value);
        let encoded = STANDARD.encode(bytes);
        bytes.zeroize();
        encoded
    }

    /// Decode an operator-submitted share
    pub fn from_base64(encoded: &str) -> SealResult<Self> {
        let mut bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SealError::invalid_request(format!("share is not valid base64: {e}")))?;
        if bytes.len() != Self::ENCODED_LEN {
            let len = bytes.len();
            bytes.zeroize();
            return Err(SealError::invalid_request(format!(
                "share must decode to {} bytes, got {len}",
                Self::ENCODED_LEN
            )));
        }
        let mut value = [0u8; 32];
        value.copy_from_slice(&bytes[1..]);
        let share = Self::new(bytes[0], value);
        bytes.zeroize();
        value.zeroize();
        share
    }
}

impl fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyShare(index={})", self.index)
    }
}
