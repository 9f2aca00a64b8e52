//! In-process cluster of unseal coordinators.
//!
//! Each node is an [`UnsealCoordinator`] over the storage layout the cluster
//! was built with. Leadership is decided lazily whenever a caller asks for
//! the leader or a node's status: the current leader keeps its role while it
//! stays unsealed, otherwise the lowest-index unsealed node takes over. With
//! replicated storage a candidate must be a voter and a majority of voters
//! must be unsealed.

use crate::storage::{ReplicatedLog, ReusableStorage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_cluster::{ClusterMembership, ClusterOptions, SealClient};
use tessera_core::{SealConfigs, SealError, SealResult, SealStatus};
use tessera_seal::{
    BarrierConfigStore, InitOutput, NodeSealConfig, SealStrategy, UnsealCoordinator,
    UnsealResponse,
};
use tracing::{debug, info, warn};

struct TestNode {
    label: String,
    seal_config: NodeSealConfig,
    core: Option<UnsealCoordinator>,
}

impl TestNode {
    fn core_mut(&mut self) -> SealResult<&mut UnsealCoordinator> {
        let label = &self.label;
        self.core
            .as_mut()
            .ok_or_else(|| SealError::service_unavailable(format!("{label} is not running")))
    }
}

/// A cluster of nodes sharing one [`ReusableStorage`]
pub struct TestCluster {
    options: ClusterOptions,
    storage: Arc<ReusableStorage>,
    default_seal: Mutex<Option<SealStrategy>>,
    nodes: Vec<tokio::sync::Mutex<TestNode>>,
    leader: Mutex<Option<usize>>,
    elections_blocked: AtomicBool,
}

impl TestCluster {
    /// Build and start every node.
    ///
    /// Each node captures `default_seal` as its own seal, the way a node's
    /// config file would name it; later changes to the default only affect
    /// nodes without an explicit seal.
    pub async fn start(
        options: ClusterOptions,
        storage: Arc<ReusableStorage>,
        default_seal: Option<SealStrategy>,
    ) -> SealResult<Arc<Self>> {
        options.validate()?;
        if let Some(log) = storage.log() {
            if log.len() != options.num_nodes {
                return Err(SealError::invalid_request(format!(
                    "replicated storage has {} replicas for {} nodes",
                    log.len(),
                    options.num_nodes
                )));
            }
        }

        let nodes = (0..options.num_nodes)
            .map(|index| {
                tokio::sync::Mutex::new(TestNode {
                    label: format!("node-{index}"),
                    seal_config: NodeSealConfig {
                        seal: default_seal.clone(),
                        unwrap_seal: None,
                    },
                    core: None,
                })
            })
            .collect();

        let cluster = Arc::new(Self {
            options,
            storage,
            default_seal: Mutex::new(default_seal),
            nodes,
            leader: Mutex::new(None),
            elections_blocked: AtomicBool::new(false),
        });
        for index in 0..cluster.nodes.len() {
            cluster.start_node(index).await?;
        }
        info!(
            nodes = cluster.nodes.len(),
            storage = %cluster.storage.kind(),
            "test cluster started"
        );
        Ok(cluster)
    }

    /// Layout the cluster was built with
    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Storage the cluster runs on
    pub fn storage(&self) -> &Arc<ReusableStorage> {
        &self.storage
    }

    /// Initialise through node `index`
    pub async fn initialize(&self, index: usize) -> SealResult<InitOutput> {
        let mut node = self.node(index)?.lock().await;
        node.core_mut()?.initialize(&self.options.seal).await
    }

    /// Stop elections from picking a new leader, as if peers were partitioned
    pub fn set_elections_blocked(&self, blocked: bool) {
        self.elections_blocked.store(blocked, Ordering::SeqCst);
    }

    /// Whether node `index` is running
    pub async fn is_running(&self, index: usize) -> SealResult<bool> {
        Ok(self.node(index)?.lock().await.core.is_some())
    }

    /// Seal every running node
    pub async fn ensure_sealed(&self) -> SealResult<()> {
        for index in 0..self.nodes.len() {
            self.seal_node(index).await?;
        }
        Ok(())
    }

    /// Stop every node and release its storage
    pub async fn cleanup(&self) -> SealResult<()> {
        for index in 0..self.nodes.len() {
            self.stop_node(index).await?;
            self.storage.close(index);
        }
        info!("test cluster torn down");
        Ok(())
    }

    fn node(&self, index: usize) -> SealResult<&tokio::sync::Mutex<TestNode>> {
        self.nodes.get(index).ok_or_else(|| {
            SealError::invalid_request(format!(
                "no node {index}; cluster has {} nodes",
                self.nodes.len()
            ))
        })
    }

    async fn is_unsealed(&self, index: usize) -> bool {
        match self.nodes.get(index) {
            Some(node) => node
                .lock()
                .await
                .core
                .as_ref()
                .is_some_and(UnsealCoordinator::is_unsealed),
            None => false,
        }
    }

    fn forget_leader(&self, index: usize) {
        let mut leader = self.leader.lock();
        if *leader == Some(index) {
            *leader = None;
        }
    }

    async fn elect(&self) -> SealResult<Option<usize>> {
        let mut candidates = Vec::new();
        for index in 0..self.nodes.len() {
            if self.is_unsealed(index).await {
                candidates.push(index);
            }
        }

        if let Some(log) = self.storage.log() {
            let voters = log.voters();
            candidates.retain(|index| voters.contains(index));
            if candidates.len() * 2 <= voters.len() {
                debug!(
                    unsealed_voters = candidates.len(),
                    voters = voters.len(),
                    "no quorum for election"
                );
                return Ok(None);
            }
        }

        let Some(&winner) = candidates.first() else {
            return Ok(None);
        };
        let committed = self.node(winner)?.lock().await.core_mut()?.promote().await?;
        *self.leader.lock() = Some(winner);
        info!(leader = winner, committed, "leader elected");

        if committed {
            for index in candidates.into_iter().filter(|index| *index != winner) {
                let mut node = self.node(index)?.lock().await;
                node.core_mut()?.reload().await?;
            }
        }
        Ok(Some(winner))
    }

    /// Bring a freshly unsealed node in line with the leader
    async fn after_unseal(&self, index: usize) -> SealResult<()> {
        let Some(log) = self.storage.log() else {
            return Ok(());
        };
        let leader = self.leader().await?;
        if let Some(leader) = leader.filter(|leader| *leader != index) {
            log.catch_up(index, leader)?;
            self.node(index)?.lock().await.core_mut()?.reload().await?;
        }
        log.set_online(index, true);
        Ok(())
    }

    async fn replicated_leader(&self, what: &str) -> SealResult<(usize, &Arc<ReplicatedLog>)> {
        let log = self.storage.log().ok_or_else(|| {
            SealError::invalid_request(format!("{what} requires replicated storage"))
        })?;
        let leader = self
            .leader()
            .await?
            .ok_or_else(|| SealError::service_unavailable("replicated storage has no leader"))?;
        Ok((leader, log))
    }
}

#[async_trait]
impl ClusterMembership for TestCluster {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn uses_replicated_storage(&self) -> bool {
        self.storage.is_replicated()
    }

    fn cluster_addr(&self, index: usize) -> SealResult<SocketAddr> {
        self.options.cluster_addr(index)
    }

    async fn stop_node(&self, index: usize) -> SealResult<()> {
        let mut node = self.node(index)?.lock().await;
        if node.core.take().is_some() {
            if let Some(log) = self.storage.log() {
                log.set_online(index, false);
            }
            self.forget_leader(index);
            info!(node = %node.label, "node stopped");
        }
        Ok(())
    }

    async fn close_storage(&self, index: usize) -> SealResult<()> {
        let node = self.node(index)?.lock().await;
        if node.core.is_some() {
            return Err(SealError::invalid_request(format!(
                "stop {} before closing its storage",
                node.label
            )));
        }
        self.storage.close(index);
        Ok(())
    }

    async fn start_node(&self, index: usize) -> SealResult<()> {
        let mut node = self.node(index)?.lock().await;
        if node.core.is_some() {
            return Err(SealError::invalid_request(format!(
                "{} is already running",
                node.label
            )));
        }

        let config = NodeSealConfig {
            seal: node
                .seal_config
                .seal
                .clone()
                .or_else(|| self.default_seal.lock().clone()),
            unwrap_seal: node.seal_config.unwrap_seal.clone(),
        };
        let storage = self.storage.open(index)?;
        match UnsealCoordinator::start(node.label.clone(), storage, config).await {
            Ok(core) => {
                node.core = Some(core);
                Ok(())
            }
            Err(err) => {
                self.storage.close(index);
                warn!(node = %node.label, error = %err, "node failed to start");
                Err(err)
            }
        }
    }

    async fn leader(&self) -> SealResult<Option<usize>> {
        let current = *self.leader.lock();
        if let Some(index) = current {
            if self.is_unsealed(index).await {
                return Ok(Some(index));
            }
            self.forget_leader(index);
        }
        if self.elections_blocked.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.elect().await
    }

    async fn seal_node(&self, index: usize) -> SealResult<()> {
        let mut node = self.node(index)?.lock().await;
        if let Some(core) = node.core.as_mut() {
            core.seal().await?;
            if let Some(log) = self.storage.log() {
                log.set_online(index, false);
            }
            self.forget_leader(index);
        }
        Ok(())
    }

    async fn set_default_seal(&self, seal: Option<SealStrategy>) {
        *self.default_seal.lock() = seal;
    }

    async fn configure_node(&self, index: usize, config: NodeSealConfig) -> SealResult<()> {
        let mut node = self.node(index)?.lock().await;
        if node.core.is_some() {
            return Err(SealError::invalid_request(format!(
                "stop {} before changing its seal",
                node.label
            )));
        }
        node.seal_config = config;
        Ok(())
    }

    async fn bootstrap(&self, index: usize) -> SealResult<()> {
        let log = self.storage.log().ok_or_else(|| {
            SealError::invalid_request("bootstrap requires replicated storage")
        })?;
        self.node(index)?;
        log.bootstrap(index)
    }

    async fn join_cluster(&self, index: usize, leader_addr: SocketAddr) -> SealResult<()> {
        let target = self.options.node_at(leader_addr)?;
        let (leader, log) = self.replicated_leader("joining").await?;
        if leader != target {
            return Err(SealError::invalid_request(format!(
                "{leader_addr} is not the leader"
            )));
        }
        log.add_voter(index)?;
        log.catch_up(index, leader)?;
        if let Some(core) = self.node(index)?.lock().await.core.as_mut() {
            core.reload().await?;
        }
        info!(node = index, leader, "joined replicated storage");
        Ok(())
    }

    async fn verify_membership(&self, leader: usize, expected_voters: usize) -> SealResult<()> {
        let (current, log) = self.replicated_leader("membership check").await?;
        if current != leader {
            return Err(SealError::consistency(format!(
                "expected node {leader} to lead, found node {current}"
            )));
        }
        let voters = log.voters();
        if voters.len() != expected_voters || !voters.contains(&leader) {
            return Err(SealError::consistency(format!(
                "expected {expected_voters} voters including node {leader}, found {voters:?}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SealClient for TestCluster {
    async fn seal_status(&self, index: usize) -> SealResult<SealStatus> {
        self.leader().await?;
        let mut node = self.node(index)?.lock().await;
        node.core_mut()?.seal_status().await
    }

    async fn unseal(&self, index: usize, share: &str, migrate: bool) -> SealResult<UnsealResponse> {
        let response = {
            let mut node = self.node(index)?.lock().await;
            node.core_mut()?.submit_share(share, migrate).await?
        };
        if !response.is_sealed() {
            self.after_unseal(index).await?;
        }
        Ok(response)
    }

    async fn unseal_with_stored_keys(&self, index: usize) -> SealResult<UnsealResponse> {
        let response = {
            let mut node = self.node(index)?.lock().await;
            node.core_mut()?.unseal_with_stored_keys().await?
        };
        if !response.is_sealed() {
            self.after_unseal(index).await?;
        }
        Ok(response)
    }

    async fn seal_configs(&self, index: usize) -> SealResult<Option<SealConfigs>> {
        self.node(index)?;
        BarrierConfigStore::new(self.storage.view(index)?).read().await
    }

    async fn read_secret(&self, index: usize, path: &str) -> SealResult<Option<Value>> {
        let secrets = self.node(index)?.lock().await.core_mut()?.secrets()?;
        secrets.read(path).await
    }

    async fn write_secret(&self, index: usize, path: &str, value: &Value) -> SealResult<()> {
        if self.leader().await? != Some(index) {
            return Err(SealError::invalid_request(format!(
                "node {index} is not the leader; writes go to the leader"
            )));
        }
        let secrets = self.node(index)?.lock().await.core_mut()?.secrets()?;
        secrets.write(path, value).await
    }
}
