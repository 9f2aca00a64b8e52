//! # Tessera Cluster
//!
//! Moves a running cluster between a Shamir seal and a delegated seal
//! without losing data or availability.
//!
//! ## Architecture
//!
//! - **membership**: the [`ClusterMembership`] and [`SealClient`] contracts
//! - **options**: node addressing and cluster layout
//! - **policy**: [`MigrationDirection`] and [`final_node_uses_migrate`]
//! - **migration**: [`MigrationOrchestrator`], rolling and whole-cluster-down flows
//! - **verify**: post-migration config and data checks

#![forbid(unsafe_code)]

pub mod membership;
pub mod migration;
pub mod options;
pub mod policy;
pub mod verify;

pub use membership::{Cluster, ClusterMembership, SealClient};
pub use migration::{MigrationOrchestrator, MigrationPhase, MigrationRequest, MigrationRun};
pub use options::{ClusterOptions, HardcodedAddressProvider, ServerAddressProvider};
pub use policy::{final_node_uses_migrate, MigrationDirection};
pub use verify::{verify_seal, ConfigShape, ExpectedSeal, SecretCheck};
