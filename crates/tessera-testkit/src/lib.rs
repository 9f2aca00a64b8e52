//! Tessera Testing Infrastructure
//!
//! In-process clusters for exercising seal migrations end to end. A
//! [`TestCluster`] runs one unseal coordinator per node over a
//! [`ReusableStorage`], which outlives the cluster so a second cluster can
//! be started on the data the first one migrated.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
//!
//! # Usage
//!
//! ```rust,no_run
//! use tessera_testkit::*;
//!
//! # async fn demo() -> tessera_core::SealResult<()> {
//! let storage = ReusableStorage::new(StorageKind::Inmem, NUM_TEST_NODES)?;
//! let InitializedCluster { cluster, keys } = initialize_shamir(storage.clone(), 31000).await?;
//! cluster.cleanup().await?;
//! run_shamir(storage, 31000, &keys).await?;
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod fixtures;
pub mod logging;
pub mod storage;

pub use cluster::TestCluster;
pub use fixtures::*;
pub use logging::init_test_tracing;
pub use storage::{ReplicaHandle, ReplicatedLog, ReusableStorage, StorageKind};
