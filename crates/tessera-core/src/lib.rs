//! # Tessera Core
//!
//! Foundation types for protecting a cluster root key behind a pluggable seal.
//!
//! ## Architecture
//!
//! - **errors**: the single [`SealError`] taxonomy used by every layer
//! - **types**: seal descriptors ([`SealKind`], [`BarrierConfig`], [`SealStatus`])
//! - **keys**: root key, unseal key and operator key shares
//! - **shamir**: threshold splitting and reconstruction of the unseal key
//! - **wrapping**: AEAD wrapping of the root key and small records
//! - **poll**: the bounded wait shared by all cross-node waits
//! - **config**: TOML/env configuration for initialisation and migration pacing
//!
//! Nothing here touches storage or the network; those live in `tessera-seal`
//! and `tessera-cluster`.

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod keys;
pub mod poll;
pub mod shamir;
pub mod types;
pub mod wrapping;

pub use config::{MigrationSettings, SealSettings, TesseraConfig};
pub use errors::{SealError, SealResult};
pub use keys::{KeyShare, RootKey, UnsealKey};
pub use poll::{poll_until, PollPolicy};
pub use types::{BarrierConfig, ConfigSlot, SealConfigs, SealKind, SealStatus};
pub use wrapping::SealedBlob;
