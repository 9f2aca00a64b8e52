//! Online seal migration across a cluster.
//!
//! Rolling flow, one node at a time, node 0 being the initial leader:
//!
//! 1. point the cluster default seal at the target
//! 2. for each follower: stop, reconfigure, start, unseal with `migrate = true`, settle
//! 3. stop node 0 and wait for another node to take over; the new leader
//!    commits the migration it prepared while unsealing
//! 4. restart node 0 with its old settings and unseal it, with or without
//!    the flag per [`final_node_uses_migrate`]
//! 5. wait for the leader, then node 0, to report the migration finished and
//!    verify the stored configs and a pre-migration secret
//!
//! The expected end state keeps the operator share set found in storage
//! before anything is touched.
//!
//! The whole-cluster-down flow instead stops every node, restarts them all on
//! the target seal and unseals node 0 once with the flag. It only works on
//! shared storage.

use crate::membership::Cluster;
use crate::policy::{final_node_uses_migrate, MigrationDirection};
use crate::verify::{verify_seal, ExpectedSeal, SecretCheck};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tessera_core::{poll_until, MigrationSettings, SealError, SealKind, SealResult};
use tessera_seal::{NodeSealConfig, SealStrategy};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a migration run is
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationPhase {
    /// Nothing touched yet
    NotStarted,
    /// Converting the follower with this index
    ConvertingFollowers(usize),
    /// Old leader stopped, waiting for a new one
    LeaderHandoff,
    /// Restarting and unsealing node 0
    ConvertingLeader,
    /// Waiting for the leader to report the migration committed
    AwaitingCommit,
    /// Configs and data checked
    Verified,
    /// Aborted with this error
    Failed(SealError),
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not-started"),
            Self::ConvertingFollowers(index) => write!(f, "converting-follower-{index}"),
            Self::LeaderHandoff => write!(f, "leader-handoff"),
            Self::ConvertingLeader => write!(f, "converting-leader"),
            Self::AwaitingCommit => write!(f, "awaiting-commit"),
            Self::Verified => write!(f, "verified"),
            Self::Failed(_) => write!(f, "failed"),
        }
    }
}

/// Record of one migration attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Identifier carried in every log line of the run
    pub run_id: Uuid,
    /// Which way the seal changes
    pub direction: MigrationDirection,
    /// Seal type before
    pub from: SealKind,
    /// Seal type after
    pub to: SealKind,
    /// Nodes unsealed under the new settings, in order
    pub nodes_migrated: Vec<usize>,
    /// Leader elected after node 0 stepped down
    pub leader_index: Option<usize>,
    /// Current phase
    pub phase: MigrationPhase,
}

impl MigrationRun {
    fn new(direction: MigrationDirection) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            direction,
            from: direction.from_kind(),
            to: direction.to_kind(),
            nodes_migrated: Vec::new(),
            leader_index: None,
            phase: MigrationPhase::NotStarted,
        }
    }
}

/// Inputs of a migration
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    /// Which way the seal changes
    pub direction: MigrationDirection,
    /// New seal when going to delegated; seal to unwrap with when leaving it
    pub delegated: SealStrategy,
    /// Operator shares, base64; at least the threshold of the share set
    pub keys: Vec<String>,
    /// Configs the cluster must end up with; derived from the stored
    /// configs when unset
    pub expected: Option<ExpectedSeal>,
    /// Secret that must survive the migration
    pub secret_check: Option<SecretCheck>,
}

impl MigrationRequest {
    /// Request migrating with `keys`
    pub fn new(direction: MigrationDirection, delegated: SealStrategy, keys: Vec<String>) -> Self {
        Self {
            direction,
            delegated,
            keys,
            expected: None,
            secret_check: None,
        }
    }

    /// Check against `expected` instead of the stored share set
    pub fn with_expected(mut self, expected: ExpectedSeal) -> Self {
        self.expected = Some(expected);
        self
    }

    /// Also check that `check` reads back afterwards
    pub fn with_secret_check(mut self, check: SecretCheck) -> Self {
        self.secret_check = Some(check);
        self
    }

    fn node_config(&self) -> NodeSealConfig {
        match self.direction {
            MigrationDirection::ShamirToDelegated => {
                NodeSealConfig::with_seal(self.delegated.clone())
            }
            MigrationDirection::DelegatedToShamir => {
                NodeSealConfig::unwrapping(self.delegated.clone())
            }
        }
    }

    fn default_seal(&self) -> Option<SealStrategy> {
        match self.direction {
            MigrationDirection::ShamirToDelegated => Some(self.delegated.clone()),
            MigrationDirection::DelegatedToShamir => None,
        }
    }

    fn validate(&self) -> SealResult<()> {
        if self.delegated.kind() != SealKind::Delegated {
            return Err(SealError::invalid_request(
                "a seal migration needs a delegated seal on one side",
            ));
        }
        if self.keys.is_empty() {
            return Err(SealError::invalid_request(
                "a seal migration needs the operator key shares",
            ));
        }
        Ok(())
    }
}

/// Drives one migration over a cluster
pub struct MigrationOrchestrator<C: ?Sized> {
    cluster: Arc<C>,
    settings: MigrationSettings,
    request: MigrationRequest,
    run: MigrationRun,
}

impl<C: Cluster + ?Sized> MigrationOrchestrator<C> {
    /// Orchestrator for `request` over `cluster`
    pub fn new(cluster: Arc<C>, settings: MigrationSettings, request: MigrationRequest) -> Self {
        let run = MigrationRun::new(request.direction);
        Self {
            cluster,
            settings,
            request,
            run,
        }
    }

    /// State of the run so far
    pub fn run(&self) -> &MigrationRun {
        &self.run
    }

    /// Rolling migration with the cluster online throughout
    pub async fn migrate_rolling(&mut self) -> SealResult<MigrationRun> {
        self.ensure_not_started()?;
        info!(
            run_id = %self.run.run_id,
            direction = %self.run.direction,
            nodes = self.cluster.node_count(),
            replicated = self.cluster.uses_replicated_storage(),
            "starting rolling seal migration"
        );
        let result = self.rolling().await;
        self.finish(result)
    }

    /// Migration with every node stopped and restarted on the new seal
    pub async fn migrate_offline(&mut self) -> SealResult<MigrationRun> {
        self.ensure_not_started()?;
        info!(
            run_id = %self.run.run_id,
            direction = %self.run.direction,
            nodes = self.cluster.node_count(),
            "starting whole-cluster-down seal migration"
        );
        let result = self.offline().await;
        self.finish(result)
    }

    fn ensure_not_started(&self) -> SealResult<()> {
        if self.run.phase == MigrationPhase::NotStarted {
            Ok(())
        } else {
            Err(SealError::invalid_request(format!(
                "migration run {} already reached phase {}",
                self.run.run_id, self.run.phase
            )))
        }
    }

    fn finish(&mut self, result: SealResult<()>) -> SealResult<MigrationRun> {
        match result {
            Ok(()) => {
                self.enter(MigrationPhase::Verified);
                info!(
                    run_id = %self.run.run_id,
                    leader = ?self.run.leader_index,
                    migrated = ?self.run.nodes_migrated,
                    "seal migration complete"
                );
                Ok(self.run.clone())
            }
            Err(err) => {
                error!(
                    run_id = %self.run.run_id,
                    phase = %self.run.phase,
                    error = %err,
                    "seal migration failed"
                );
                self.run.phase = MigrationPhase::Failed(err.clone());
                Err(err)
            }
        }
    }

    fn enter(&mut self, phase: MigrationPhase) {
        debug!(run_id = %self.run.run_id, from = %self.run.phase, to = %phase, "phase change");
        self.run.phase = phase;
    }

    async fn rolling(&mut self) -> SealResult<()> {
        let cluster = Arc::clone(&self.cluster);
        let nodes = cluster.node_count();
        if nodes < 2 {
            return Err(SealError::invalid_request(
                "a rolling migration needs at least two nodes",
            ));
        }
        let replicated = cluster.uses_replicated_storage();
        let expected = self.preflight().await?;

        cluster.set_default_seal(self.request.default_seal()).await;

        for index in 1..nodes {
            self.enter(MigrationPhase::ConvertingFollowers(index));
            self.stop(index, replicated).await?;
            cluster
                .configure_node(index, self.request.node_config())
                .await?;
            cluster.start_node(index).await?;
            self.unseal_migrate(index).await?;
            self.run.nodes_migrated.push(index);
            info!(run_id = %self.run.run_id, node = index, "follower converted");
            sleep(self.settings.settle_interval()).await;
        }

        self.enter(MigrationPhase::LeaderHandoff);
        self.stop(0, replicated).await?;
        let leader = self.await_new_leader(0).await?;
        self.run.leader_index = Some(leader);
        info!(run_id = %self.run.run_id, leader, "leadership handed off");

        // Node 0 comes back with the settings it had before the migration
        self.enter(MigrationPhase::ConvertingLeader);
        cluster.start_node(0).await?;
        if final_node_uses_migrate(self.request.direction, replicated) {
            self.unseal_migrate(0).await?;
        } else {
            self.unseal_plain(0).await?;
        }
        self.run.nodes_migrated.push(0);

        self.enter(MigrationPhase::AwaitingCommit);
        self.await_migration(leader).await?;
        self.await_migration(0).await?;
        if replicated {
            sleep(self.settings.replicated_settle_interval()).await;
            cluster.verify_membership(leader, nodes).await?;
        }

        verify_seal(&*cluster, leader, &expected, self.request.secret_check.as_ref()).await
    }

    async fn offline(&mut self) -> SealResult<()> {
        let cluster = Arc::clone(&self.cluster);
        if cluster.uses_replicated_storage() {
            return Err(SealError::invalid_request(
                "whole-cluster-down migration is only supported on shared storage",
            ));
        }
        let expected = self.preflight_configs().await?;
        let nodes = cluster.node_count();

        for index in 0..nodes {
            cluster.seal_node(index).await?;
            cluster.stop_node(index).await?;
        }
        cluster.set_default_seal(self.request.default_seal()).await;
        for index in 0..nodes {
            cluster
                .configure_node(index, self.request.node_config())
                .await?;
            cluster.start_node(index).await?;
        }

        self.enter(MigrationPhase::ConvertingLeader);
        self.unseal_migrate(0).await?;
        self.run.nodes_migrated.push(0);

        self.enter(MigrationPhase::AwaitingCommit);
        self.await_migration(0).await?;
        let leader = cluster.leader().await?;
        if leader != Some(0) {
            return Err(SealError::consistency(format!(
                "expected node 0 to lead after whole-cluster-down migration, found {leader:?}"
            )));
        }
        self.run.leader_index = leader;

        verify_seal(&*cluster, 0, &expected, self.request.secret_check.as_ref()).await
    }

    async fn preflight(&self) -> SealResult<ExpectedSeal> {
        let leader = self.cluster.leader().await?;
        if leader != Some(0) {
            return Err(SealError::consistency(format!(
                "node 0 must be the leader before a rolling migration, found {leader:?}"
            )));
        }
        self.preflight_configs().await
    }

    /// Check the stored seal matches the direction and work out the end
    /// state from its operator share set.
    async fn preflight_configs(&self) -> SealResult<ExpectedSeal> {
        self.request.validate()?;
        let configs = self
            .cluster
            .seal_configs(0)
            .await?
            .ok_or_else(|| SealError::invalid_request("cluster is not initialized"))?;
        let from = self.request.direction.from_kind();
        if configs.barrier.kind != from {
            return Err(SealError::invalid_request(format!(
                "cluster is sealed with {}, not {from}",
                configs.barrier.kind
            )));
        }

        let operator_set = configs.operator_set();
        if (self.request.keys.len() as u32) < operator_set.secret_threshold {
            return Err(SealError::invalid_request(format!(
                "{} key shares given, the cluster needs {}",
                self.request.keys.len(),
                operator_set.secret_threshold
            )));
        }
        let expected = self.request.expected.unwrap_or_else(|| {
            ExpectedSeal::after(
                self.request.direction,
                operator_set.secret_shares,
                operator_set.secret_threshold,
            )
        });
        debug!(run_id = %self.run.run_id, ?expected, "expected seal after migration");
        Ok(expected)
    }

    async fn stop(&self, index: usize, replicated: bool) -> SealResult<()> {
        self.cluster.stop_node(index).await?;
        if replicated {
            self.cluster.close_storage(index).await?;
        }
        Ok(())
    }

    /// Submit every key twice: unflagged, which must be refused, then flagged.
    async fn unseal_migrate(&self, index: usize) -> SealResult<()> {
        for key in &self.request.keys {
            match self.cluster.unseal(index, key, false).await {
                Err(SealError::InvalidRequest { .. }) => {}
                Ok(_) => {
                    return Err(SealError::consistency(format!(
                        "node {index} accepted a share without the migrate flag during migration"
                    )))
                }
                Err(err) => return Err(err),
            }
            if !self.cluster.unseal(index, key, true).await?.is_sealed() {
                debug!(run_id = %self.run.run_id, node = index, "unsealed with migrate flag");
                return Ok(());
            }
        }
        Err(SealError::invalid_request(format!(
            "node {index} is still sealed after all {} keys",
            self.request.keys.len()
        )))
    }

    async fn unseal_plain(&self, index: usize) -> SealResult<()> {
        for key in &self.request.keys {
            if !self.cluster.unseal(index, key, false).await?.is_sealed() {
                debug!(run_id = %self.run.run_id, node = index, "unsealed");
                return Ok(());
            }
        }
        Err(SealError::invalid_request(format!(
            "node {index} is still sealed after all {} keys",
            self.request.keys.len()
        )))
    }

    async fn await_new_leader(&self, old: usize) -> SealResult<usize> {
        let cluster = &*self.cluster;
        poll_until("new leader", self.settings.leader_wait(), move || async move {
            match cluster.leader().await? {
                Some(index) if index == old => Err(SealError::consistency(format!(
                    "stopped node {old} is still reported as leader"
                ))),
                other => Ok(other),
            }
        })
        .await
    }

    async fn await_migration(&self, index: usize) -> SealResult<()> {
        let cluster = &*self.cluster;
        let what = format!("migration commit on node {index}");
        poll_until(&what, self.settings.migration_wait(), move || async move {
            let status = cluster.seal_status(index).await?;
            if status.migration_in_progress || status.sealed {
                Ok(None)
            } else {
                Ok(Some(()))
            }
        })
        .await
        .map_err(|err| {
            warn!(run_id = %self.run.run_id, node = index, error = %err, "migration did not finish");
            err
        })
    }
}
