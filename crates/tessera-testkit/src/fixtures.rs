//! Ready-made clusters for seal migration tests.
//!
//! The `initialize_*` helpers build a fresh cluster, initialise it through
//! node 0, unseal every node and write [`SECRET_PATH`]. After a migration
//! the cluster is torn down and the `run_*` helpers start a new one on the
//! same storage, checking that it comes back with the secret intact.

use crate::cluster::TestCluster;
use crate::storage::ReusableStorage;
use serde_json::{json, Value};
use std::sync::Arc;
use tessera_cluster::{ClusterMembership, ClusterOptions, SealClient, SecretCheck};
use tessera_core::{
    poll_until, MigrationSettings, SealError, SealResult, SealSettings, TesseraConfig,
};
use tessera_seal::{DelegatedSeal, InMemoryKeyWrapService, KeyWrapService, SealStrategy};
use tracing::{debug, info};

/// Nodes in every migration test cluster
pub const NUM_TEST_NODES: usize = 5;
/// Operator shares handed out at initialisation, per [`TEST_CONFIG`]
pub const KEY_SHARES: u32 = 3;
/// Operator shares needed to unseal, per [`TEST_CONFIG`]
pub const KEY_THRESHOLD: u32 = 3;
/// Path of the secret that must survive every migration
pub const SECRET_PATH: &str = "secret/foo";

/// Value stored at [`SECRET_PATH`]
pub fn secret_value() -> Value {
    json!({ "zork": "quux" })
}

/// Check of [`SECRET_PATH`] after a migration
pub fn secret_check() -> SecretCheck {
    SecretCheck::new(SECRET_PATH, secret_value())
}

/// Configuration every test cluster runs with
pub const TEST_CONFIG: &str = r#"
[migration]
poll_interval_ms = 100
settle_interval_ms = 1000
replicated_settle_interval_ms = 2000
leader_timeout_ms = 10000
migration_timeout_ms = 10000
unseal_timeout_ms = 10000

[seal]
secret_shares = 3
secret_threshold = 3
"#;

/// [`TEST_CONFIG`], parsed and validated
pub fn test_config() -> TesseraConfig {
    let config = TesseraConfig::from_toml_str(TEST_CONFIG).expect("test config parses");
    config.validate().expect("test config is valid");
    config
}

/// Fast pacing for tests running on a paused clock
pub fn test_settings() -> MigrationSettings {
    test_config().migration
}

/// A transit-style key wrapping server backing delegated seals
pub struct TransitSealServer {
    service: Arc<InMemoryKeyWrapService>,
}

impl TransitSealServer {
    /// Running server listening at `endpoint`
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            service: Arc::new(InMemoryKeyWrapService::new(endpoint)),
        }
    }

    /// Delegated seal over a new key called `key_name`
    pub fn make_seal(&self, key_name: &str) -> SealResult<SealStrategy> {
        self.service.make_key(key_name)?;
        let token = self.service.issue_token()?;
        let service: Arc<dyn KeyWrapService> = self.service.clone();
        Ok(SealStrategy::Delegated(DelegatedSeal::new(
            service, key_name, token,
        )))
    }

    /// Stop answering until [`restart`](Self::restart)
    pub fn shutdown(&self) {
        self.service.shutdown();
    }

    /// Answer again after a shutdown
    pub fn restart(&self) -> SealResult<()> {
        self.service.restart()
    }

    /// Stop for good and lose every key
    pub fn destroy(&self) {
        self.service.destroy();
    }
}

/// A running cluster plus the operator shares it was initialised with
pub struct InitializedCluster {
    /// The cluster
    pub cluster: Arc<TestCluster>,
    /// Operator shares, base64
    pub keys: Vec<String>,
}

fn options(base_port: u16) -> ClusterOptions {
    ClusterOptions::new(NUM_TEST_NODES, base_port)
        .with_advertised_addresses()
        .with_seal_settings(test_config().seal)
}

/// Initialise a Shamir-sealed cluster, leaving it running and unsealed
pub async fn initialize_shamir(
    storage: Arc<ReusableStorage>,
    base_port: u16,
) -> SealResult<InitializedCluster> {
    initialize(options(base_port), storage, None).await
}

/// Like [`initialize_shamir`], handing out the share set `seal` describes
pub async fn initialize_shamir_with(
    storage: Arc<ReusableStorage>,
    base_port: u16,
    seal: SealSettings,
) -> SealResult<InitializedCluster> {
    let options = options(base_port).with_seal_settings(seal);
    initialize(options, storage, None).await
}

/// Initialise a cluster sealed by `seal`, leaving it running and unsealed
pub async fn initialize_delegated(
    storage: Arc<ReusableStorage>,
    base_port: u16,
    seal: SealStrategy,
) -> SealResult<InitializedCluster> {
    initialize(options(base_port), storage, Some(seal)).await
}

async fn initialize(
    options: ClusterOptions,
    storage: Arc<ReusableStorage>,
    seal: Option<SealStrategy>,
) -> SealResult<InitializedCluster> {
    let delegated = seal.is_some();
    let cluster = TestCluster::start(options, storage, seal).await?;
    let init = cluster.initialize(0).await?;
    let keys: Vec<String> = init
        .operator_keys()
        .iter()
        .map(|share| share.to_base64())
        .collect();

    let replicated = cluster.uses_replicated_storage();
    if replicated {
        cluster.bootstrap(0).await?;
    }
    unseal_node(&cluster, 0, &keys, delegated).await?;
    let leader = await_leader(&cluster).await?;
    if leader != 0 {
        return Err(SealError::consistency(format!(
            "expected node 0 to lead a new cluster, found node {leader}"
        )));
    }

    let leader_addr = cluster.cluster_addr(0)?;
    for index in 1..cluster.node_count() {
        if replicated {
            cluster.join_cluster(index, leader_addr).await?;
        }
        unseal_node(&cluster, index, &keys, delegated).await?;
    }
    await_unsealed(&cluster, cluster.node_count()).await?;

    cluster.write_secret(0, SECRET_PATH, &secret_value()).await?;
    info!(
        storage = %cluster.storage().kind(),
        delegated,
        "cluster initialized"
    );
    Ok(InitializedCluster { cluster, keys })
}

async fn unseal_node(
    cluster: &TestCluster,
    index: usize,
    keys: &[String],
    delegated: bool,
) -> SealResult<()> {
    if delegated {
        cluster.unseal_with_stored_keys(index).await?;
        Ok(())
    } else {
        unseal_with_keys(cluster, index, keys).await
    }
}

/// Submit shares to node `index` until it unseals
pub async fn unseal_with_keys(
    cluster: &TestCluster,
    index: usize,
    keys: &[String],
) -> SealResult<()> {
    for key in keys {
        if !cluster.unseal(index, key, false).await?.is_sealed() {
            debug!(node = index, "unsealed with keys");
            return Ok(());
        }
    }
    Err(SealError::invalid_request(format!(
        "node {index} is still sealed after all {} keys",
        keys.len()
    )))
}

/// Wait until some node leads
pub async fn await_leader(cluster: &TestCluster) -> SealResult<usize> {
    poll_until("leader", test_settings().leader_wait(), move || cluster.leader()).await
}

/// Wait until at least `count` nodes report unsealed
pub async fn await_unsealed(cluster: &TestCluster, count: usize) -> SealResult<()> {
    poll_until("nodes unsealed", test_settings().unseal_wait(), move || async move {
        let mut unsealed = 0;
        for index in 0..cluster.node_count() {
            match cluster.seal_status(index).await {
                Ok(status) if !status.sealed => unsealed += 1,
                Ok(_) | Err(SealError::ServiceUnavailable { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        debug!(unsealed, count, "waiting for unsealed nodes");
        Ok((unsealed >= count).then_some(()))
    })
    .await
}

/// Unseal node `index` through its delegated seal, retrying while the
/// service is unreachable or the node has not yet seen the seal config
pub async fn await_unseal_with_stored_keys(
    cluster: &TestCluster,
    index: usize,
) -> SealResult<()> {
    poll_until(
        "unseal with stored keys",
        test_settings().unseal_wait(),
        move || async move {
            if !cluster.seal_status(index).await?.initialized {
                return Ok(None);
            }
            match cluster.unseal_with_stored_keys(index).await {
                Ok(response) => Ok((!response.is_sealed()).then_some(())),
                Err(err) if err.is_retryable() => {
                    debug!(node = index, error = %err, "delegated unseal not ready yet");
                    Ok(None)
                }
                Err(err) => Err(err),
            }
        },
    )
    .await
}

/// Restart on `storage` with a Shamir seal and check the secret survived
pub async fn run_shamir(
    storage: Arc<ReusableStorage>,
    base_port: u16,
    keys: &[String],
) -> SealResult<Arc<TestCluster>> {
    let cluster = TestCluster::start(options(base_port), storage, None).await?;
    for index in 0..cluster.node_count() {
        unseal_with_keys(&cluster, index, keys).await?;
    }
    await_unsealed(&cluster, cluster.node_count()).await?;
    check_restarted(&cluster).await?;
    Ok(cluster)
}

/// Restart on `storage` with `seal` and check the secret survived
pub async fn run_autoseal(
    storage: Arc<ReusableStorage>,
    base_port: u16,
    seal: SealStrategy,
) -> SealResult<Arc<TestCluster>> {
    let cluster = TestCluster::start(options(base_port), storage, Some(seal)).await?;
    for index in 0..cluster.node_count() {
        await_unseal_with_stored_keys(&cluster, index).await?;
    }
    await_unsealed(&cluster, cluster.node_count()).await?;
    check_restarted(&cluster).await?;
    Ok(cluster)
}

async fn check_restarted(cluster: &TestCluster) -> SealResult<()> {
    let leader = await_leader(cluster).await?;
    if leader != 0 {
        return Err(SealError::consistency(format!(
            "expected node 0 to lead after restart, found node {leader}"
        )));
    }
    let value = cluster.read_secret(leader, SECRET_PATH).await?;
    if value != Some(secret_value()) {
        return Err(SealError::consistency(format!(
            "{SECRET_PATH} read back as {value:?} after restart"
        )));
    }
    Ok(())
}
