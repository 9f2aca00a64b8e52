//! What the orchestrator needs from a cluster.
//!
//! [`ClusterMembership`] controls node lifecycle, seal settings and
//! replication membership; [`SealClient`] talks to individual nodes. Both
//! address nodes by index.

use async_trait::async_trait;
use serde_json::Value;
use std::net::SocketAddr;
use tessera_core::{SealConfigs, SealResult, SealStatus};
use tessera_seal::{NodeSealConfig, SealStrategy, UnsealResponse};

/// Node lifecycle and membership
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Number of nodes, running or not
    fn node_count(&self) -> usize;

    /// Whether each node keeps its own replica of the data
    fn uses_replicated_storage(&self) -> bool;

    /// Address peers use to reach node `index`
    fn cluster_addr(&self, index: usize) -> SealResult<SocketAddr>;

    /// Stop a node; its root key is dropped
    async fn stop_node(&self, index: usize) -> SealResult<()>;

    /// Release a stopped node's replica handle so it can be reopened
    async fn close_storage(&self, index: usize) -> SealResult<()>;

    /// Start a stopped node with its current seal settings
    async fn start_node(&self, index: usize) -> SealResult<()>;

    /// Current active node, electing one if needed
    async fn leader(&self) -> SealResult<Option<usize>>;

    /// Seal a running node
    async fn seal_node(&self, index: usize) -> SealResult<()>;

    /// Seal used by nodes without an explicit seal of their own
    async fn set_default_seal(&self, seal: Option<SealStrategy>);

    /// Change a stopped node's seal settings
    async fn configure_node(&self, index: usize, config: NodeSealConfig) -> SealResult<()>;

    /// Create the replication group on node `index`
    async fn bootstrap(&self, index: usize) -> SealResult<()>;

    /// Join node `index` to the replication group led at `leader_addr`
    async fn join_cluster(&self, index: usize, leader_addr: SocketAddr) -> SealResult<()>;

    /// Check that `leader` leads a replication group of `expected_voters`
    async fn verify_membership(&self, leader: usize, expected_voters: usize) -> SealResult<()>;
}

/// Requests to individual nodes
#[async_trait]
pub trait SealClient: Send + Sync {
    /// Seal status of node `index`
    async fn seal_status(&self, index: usize) -> SealResult<SealStatus>;

    /// Submit one base64 share
    async fn unseal(&self, index: usize, share: &str, migrate: bool) -> SealResult<UnsealResponse>;

    /// Unseal through the delegated service
    async fn unseal_with_stored_keys(&self, index: usize) -> SealResult<UnsealResponse>;

    /// Seal configs as persisted in node `index`'s view of storage
    async fn seal_configs(&self, index: usize) -> SealResult<Option<SealConfigs>>;

    /// Read a secret through node `index`
    async fn read_secret(&self, index: usize, path: &str) -> SealResult<Option<Value>>;

    /// Write a secret through node `index`, which must be the leader
    async fn write_secret(&self, index: usize, path: &str, value: &Value) -> SealResult<()>;
}

/// Everything a migration drives
pub trait Cluster: ClusterMembership + SealClient {}

impl<T: ClusterMembership + SealClient + ?Sized> Cluster for T {}
