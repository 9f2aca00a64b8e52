//! # Tessera Seal
//!
//! Seal strategies and the per-node unseal state machine.
//!
//! ## Architecture
//!
//! - **storage**: [`StorageBackend`] plus in-memory and file backends
//! - **kms**: the external key-wrapping service behind a delegated seal
//! - **strategy**: [`SealStrategy`], protecting and revealing the root key
//! - **config_store**: the persisted barrier and recovery configs
//! - **keyring**: the persisted protected root key
//! - **unseal**: [`UnsealCoordinator`], share sessions and migration detection
//! - **secrets**: logical data encrypted under the root key

#![forbid(unsafe_code)]

pub mod config_store;
pub mod keyring;
pub mod kms;
pub mod secrets;
pub mod storage;
pub mod strategy;
pub mod unseal;

pub use config_store::BarrierConfigStore;
pub use keyring::Keyring;
pub use kms::{InMemoryKeyWrapService, KeyWrapService, WrappedKey};
pub use secrets::SecretStore;
pub use storage::{FileBackend, InMemoryBackend, StorageBackend, StorageExt};
pub use strategy::{
    DelegatedSeal, ProtectedRootKey, RetiredSeal, RevealInput, RevealOutcome, SealStrategy,
    ShamirParams,
};
pub use unseal::{InitOutput, MigrationPlan, NodeSealConfig, UnsealCoordinator, UnsealResponse};
