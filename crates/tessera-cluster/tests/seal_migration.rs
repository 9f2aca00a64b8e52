//! End-to-end seal migrations over five-node in-process clusters.

#![allow(clippy::unwrap_used)]

use assert_matches::assert_matches;
use std::sync::Arc;
use tessera_cluster::{
    ClusterMembership, MigrationDirection, MigrationOrchestrator, MigrationPhase,
    MigrationRequest, SealClient,
};
use tessera_core::{SealError, SealKind, SealSettings};
use tessera_seal::SealStrategy;
use tessera_testkit::{
    init_test_tracing, initialize_delegated, initialize_shamir, initialize_shamir_with,
    run_autoseal, run_shamir, secret_check, secret_value, test_settings, InitializedCluster,
    ReusableStorage, StorageKind, TestCluster, TransitSealServer, NUM_TEST_NODES, SECRET_PATH,
};

const TRANSIT_ADDR: &str = "127.0.0.1:8200";
const TRANSIT_KEY: &str = "transit-seal-key";

fn transit() -> (TransitSealServer, SealStrategy) {
    let server = TransitSealServer::new(TRANSIT_ADDR);
    let seal = server.make_seal(TRANSIT_KEY).unwrap();
    (server, seal)
}

fn orchestrator(
    cluster: &Arc<TestCluster>,
    direction: MigrationDirection,
    seal: &SealStrategy,
    keys: &[String],
) -> MigrationOrchestrator<TestCluster> {
    let request = MigrationRequest::new(direction, seal.clone(), keys.to_vec())
        .with_secret_check(secret_check());
    MigrationOrchestrator::new(Arc::clone(cluster), test_settings(), request)
}

async fn shamir_to_delegated_offline(kind: StorageKind, base_port: u16) {
    init_test_tracing();
    let storage = ReusableStorage::new(kind, NUM_TEST_NODES).unwrap();
    let InitializedCluster { cluster, keys } =
        initialize_shamir(storage.clone(), base_port).await.unwrap();
    let (_transit, seal) = transit();

    let mut migration = orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, &keys);
    let run = migration.migrate_offline().await.unwrap();
    assert_eq!(run.phase, MigrationPhase::Verified);
    assert_eq!(run.leader_index, Some(0));
    assert_eq!(run.nodes_migrated, vec![0]);
    assert_eq!((run.from, run.to), (SealKind::Shamir, SealKind::Delegated));
    cluster.cleanup().await.unwrap();

    let restarted = run_autoseal(storage, base_port, seal).await.unwrap();
    restarted.cleanup().await.unwrap();
}

async fn shamir_to_delegated_rolling(kind: StorageKind, base_port: u16) {
    init_test_tracing();
    let storage = ReusableStorage::new(kind, NUM_TEST_NODES).unwrap();
    let InitializedCluster { cluster, keys } =
        initialize_shamir(storage.clone(), base_port).await.unwrap();
    let (_transit, seal) = transit();

    let mut migration = orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, &keys);
    let run = migration.migrate_rolling().await.unwrap();
    assert_eq!(run.phase, MigrationPhase::Verified);
    assert_eq!(run.leader_index, Some(1));
    assert_eq!(run.nodes_migrated, vec![1, 2, 3, 4, 0]);

    // Node 0 rejoins on the new seal without leaving a migration behind
    let status = cluster.seal_status(0).await.unwrap();
    assert!(!status.sealed);
    assert!(!status.migration_in_progress);
    assert_eq!(status.kind, SealKind::Delegated);
    assert_eq!(
        cluster.read_secret(0, SECRET_PATH).await.unwrap(),
        Some(secret_value())
    );
    cluster.cleanup().await.unwrap();

    let restarted = run_autoseal(storage, base_port, seal).await.unwrap();
    restarted.cleanup().await.unwrap();
}

async fn delegated_to_shamir_rolling(kind: StorageKind, base_port: u16) {
    init_test_tracing();
    let storage = ReusableStorage::new(kind, NUM_TEST_NODES).unwrap();
    let (transit, seal) = transit();
    let InitializedCluster { cluster, keys } =
        initialize_delegated(storage.clone(), base_port, seal.clone())
            .await
            .unwrap();

    let mut migration = orchestrator(&cluster, MigrationDirection::DelegatedToShamir, &seal, &keys);
    let run = migration.migrate_rolling().await.unwrap();
    assert_eq!(run.phase, MigrationPhase::Verified);
    assert_eq!(run.leader_index, Some(1));
    assert_eq!((run.from, run.to), (SealKind::Delegated, SealKind::Shamir));

    // Node 0 still runs its old delegated settings but must not queue a
    // migration back to them
    let status = cluster.seal_status(0).await.unwrap();
    assert!(!status.sealed);
    assert!(!status.migration_in_progress);
    assert_eq!(status.kind, SealKind::Shamir);
    assert_eq!(
        cluster.read_secret(0, SECRET_PATH).await.unwrap(),
        Some(secret_value())
    );

    if kind != StorageKind::Replicated {
        // Hand leadership back to node 0; the stored seal stays Shamir
        for index in 1..NUM_TEST_NODES {
            cluster.stop_node(index).await.unwrap();
        }
        assert_eq!(cluster.leader().await.unwrap(), Some(0));
        let configs = cluster.seal_configs(0).await.unwrap().unwrap();
        assert_eq!(configs.barrier.kind, SealKind::Shamir);
        assert_eq!(configs.recovery, None);
    }
    cluster.cleanup().await.unwrap();

    // The delegated seal is no longer needed by anyone
    transit.destroy();
    let restarted = run_shamir(storage, base_port, &keys).await.unwrap();
    restarted.cleanup().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shamir_to_delegated_offline_inmem() {
    shamir_to_delegated_offline(StorageKind::Inmem, 32000).await;
}

#[tokio::test(start_paused = true)]
async fn test_shamir_to_delegated_offline_file() {
    shamir_to_delegated_offline(StorageKind::File, 32100).await;
}

#[tokio::test(start_paused = true)]
async fn test_shamir_to_delegated_rolling_inmem() {
    shamir_to_delegated_rolling(StorageKind::Inmem, 32200).await;
}

#[tokio::test(start_paused = true)]
async fn test_shamir_to_delegated_rolling_file() {
    shamir_to_delegated_rolling(StorageKind::File, 32300).await;
}

#[tokio::test(start_paused = true)]
async fn test_shamir_to_delegated_rolling_replicated() {
    shamir_to_delegated_rolling(StorageKind::Replicated, 32400).await;
}

#[tokio::test(start_paused = true)]
async fn test_delegated_to_shamir_rolling_inmem() {
    delegated_to_shamir_rolling(StorageKind::Inmem, 32500).await;
}

#[tokio::test(start_paused = true)]
async fn test_delegated_to_shamir_rolling_file() {
    delegated_to_shamir_rolling(StorageKind::File, 32600).await;
}

#[tokio::test(start_paused = true)]
async fn test_delegated_to_shamir_rolling_replicated() {
    delegated_to_shamir_rolling(StorageKind::Replicated, 32700).await;
}

#[tokio::test(start_paused = true)]
async fn test_threshold_of_keys_migrates_larger_share_set() {
    init_test_tracing();
    let storage = ReusableStorage::new(StorageKind::Inmem, NUM_TEST_NODES).unwrap();
    let seal_settings = SealSettings {
        secret_shares: 5,
        secret_threshold: 3,
    };
    let InitializedCluster { cluster, keys } =
        initialize_shamir_with(storage, 33200, seal_settings)
            .await
            .unwrap();
    assert_eq!(keys.len(), 5);
    let (_transit, seal) = transit();

    // Only a quorum of operators shows up
    let quorum = &keys[..3];
    let mut migration = orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, quorum);
    let run = migration.migrate_rolling().await.unwrap();
    assert_eq!(run.phase, MigrationPhase::Verified);

    let configs = cluster.seal_configs(run.leader_index.unwrap()).await.unwrap().unwrap();
    assert_eq!(configs.barrier.kind, SealKind::Delegated);
    configs
        .recovery
        .unwrap()
        .verify(SealKind::Shamir, 5, 3, 0)
        .unwrap();
    cluster.cleanup().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fewer_keys_than_threshold_rejected_up_front() {
    init_test_tracing();
    let storage = ReusableStorage::new(StorageKind::Inmem, NUM_TEST_NODES).unwrap();
    let InitializedCluster { cluster, keys } = initialize_shamir(storage, 33300).await.unwrap();
    let (_transit, seal) = transit();

    let mut migration =
        orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, &keys[..2]);
    assert_matches!(
        migration.migrate_rolling().await,
        Err(SealError::InvalidRequest { .. })
    );
    assert!(migration.run().nodes_migrated.is_empty());
    for index in 0..NUM_TEST_NODES {
        assert!(!cluster.seal_status(index).await.unwrap().sealed);
    }
    cluster.cleanup().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_leader_handoff_times_out() {
    init_test_tracing();
    let storage = ReusableStorage::new(StorageKind::Inmem, NUM_TEST_NODES).unwrap();
    let InitializedCluster { cluster, keys } = initialize_shamir(storage, 32800).await.unwrap();
    let (_transit, seal) = transit();

    cluster.set_elections_blocked(true);
    let mut migration = orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, &keys);
    assert_matches!(
        migration.migrate_rolling().await,
        Err(SealError::Timeout { .. })
    );
    assert_matches!(
        &migration.run().phase,
        MigrationPhase::Failed(SealError::Timeout { .. })
    );
    assert_eq!(migration.run().nodes_migrated, vec![1, 2, 3, 4]);
    assert_eq!(migration.run().leader_index, None);

    // A failed run cannot be resumed
    assert_matches!(
        migration.migrate_rolling().await,
        Err(SealError::InvalidRequest { .. })
    );
    cluster.cleanup().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_delegated_seal_fails_first_follower() {
    init_test_tracing();
    let storage = ReusableStorage::new(StorageKind::Inmem, NUM_TEST_NODES).unwrap();
    let InitializedCluster { cluster, keys } = initialize_shamir(storage, 32900).await.unwrap();
    let (transit, seal) = transit();

    transit.shutdown();
    let mut migration = orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, &keys);
    assert_matches!(
        migration.migrate_rolling().await,
        Err(SealError::ServiceUnavailable { .. })
    );
    assert_matches!(
        &migration.run().phase,
        MigrationPhase::Failed(SealError::ServiceUnavailable { .. })
    );
    assert!(migration.run().nodes_migrated.is_empty());

    // Stored seal is untouched and the old leader still serves data
    let configs = cluster.seal_configs(0).await.unwrap().unwrap();
    assert_eq!(configs.barrier.kind, SealKind::Shamir);
    assert_eq!(cluster.leader().await.unwrap(), Some(0));
    assert_eq!(
        cluster.read_secret(0, SECRET_PATH).await.unwrap(),
        Some(secret_value())
    );

    // Rerunning once the service is back converts every node
    transit.restart().unwrap();
    let mut retry = orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, &keys);
    let run = retry.migrate_rolling().await.unwrap();
    assert_eq!(run.phase, MigrationPhase::Verified);
    assert_eq!(run.leader_index, Some(1));
    cluster.cleanup().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_offline_migration_rejects_replicated_storage() {
    init_test_tracing();
    let storage = ReusableStorage::new(StorageKind::Replicated, NUM_TEST_NODES).unwrap();
    let InitializedCluster { cluster, keys } = initialize_shamir(storage, 33000).await.unwrap();
    let (_transit, seal) = transit();

    let mut migration = orchestrator(&cluster, MigrationDirection::ShamirToDelegated, &seal, &keys);
    assert_matches!(
        migration.migrate_offline().await,
        Err(SealError::InvalidRequest { .. })
    );
    for index in 0..NUM_TEST_NODES {
        assert!(!cluster.seal_status(index).await.unwrap().sealed);
    }
    cluster.cleanup().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_direction_must_match_stored_seal() {
    init_test_tracing();
    let storage = ReusableStorage::new(StorageKind::Inmem, NUM_TEST_NODES).unwrap();
    let InitializedCluster { cluster, keys } = initialize_shamir(storage, 33100).await.unwrap();
    let (_transit, seal) = transit();

    let mut migration = orchestrator(&cluster, MigrationDirection::DelegatedToShamir, &seal, &keys);
    assert_matches!(
        migration.migrate_rolling().await,
        Err(SealError::InvalidRequest { .. })
    );
    assert!(migration.run().nodes_migrated.is_empty());
    cluster.cleanup().await.unwrap();
}
