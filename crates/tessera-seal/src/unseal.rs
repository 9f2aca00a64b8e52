//! Per-node unseal state machine.
//!
//! A node is in exactly one of four states:
//!
//! - `Uninitialized`: no barrier config in storage
//! - `Sealed`: collecting shares for the stored seal
//! - `Migrating`: stored seal differs from the configured one; shares must
//!   carry `migrate = true`
//! - `Unsealed`: root key in memory, possibly with a migration waiting to be
//!   committed
//!
//! The state is chosen at [`UnsealCoordinator::start`] by comparing the
//! stored barrier config with the node's configured seal. Only the active
//! node writes seal state, so a standby that finishes a migration unseal
//! keeps the re-protected root key in memory until it is promoted.

use crate::config_store::BarrierConfigStore;
use crate::keyring::Keyring;
use crate::secrets::SecretStore;
use crate::storage::StorageBackend;
use crate::strategy::{
    distinct_shares, ProtectedRootKey, RevealInput, RevealOutcome, SealStrategy, ShamirParams,
};
use rand::rngs::OsRng;
use std::sync::Arc;
use tessera_core::{
    shamir, KeyShare, RootKey, SealConfigs, SealError, SealKind, SealResult, SealSettings,
    SealStatus, UnsealKey,
};
use tracing::{debug, info, warn};

/// Seal settings a node is started with
#[derive(Debug, Clone, Default)]
pub struct NodeSealConfig {
    /// Seal to run with; `None` means Shamir
    pub seal: Option<SealStrategy>,
    /// Old delegated seal, needed only while migrating away from it
    pub unwrap_seal: Option<SealStrategy>,
}

impl NodeSealConfig {
    /// Shamir seal, no unwrap seal
    pub fn shamir() -> Self {
        Self::default()
    }

    /// Run with `seal`
    pub fn with_seal(seal: SealStrategy) -> Self {
        Self {
            seal: Some(seal),
            unwrap_seal: None,
        }
    }

    /// Run with Shamir while migrating away from `unwrap_seal`
    pub fn unwrapping(unwrap_seal: SealStrategy) -> Self {
        Self {
            seal: None,
            unwrap_seal: Some(unwrap_seal),
        }
    }

    /// Seal type the node runs with
    pub fn kind(&self) -> SealKind {
        self.seal
            .as_ref()
            .map(SealStrategy::kind)
            .unwrap_or(SealKind::Shamir)
    }
}

/// Old and new seal of a migration
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Strategy that can reveal the stored root key
    pub from: SealStrategy,
    /// Strategy the root key is re-protected with
    pub to: SealStrategy,
}

/// Shares produced by [`UnsealCoordinator::initialize`]
#[derive(Debug, Default)]
pub struct InitOutput {
    /// Operator shares of a Shamir barrier
    pub barrier_keys: Vec<KeyShare>,
    /// Operator shares of a delegated barrier's recovery config
    pub recovery_keys: Vec<KeyShare>,
}

impl InitOutput {
    /// Whichever share set was produced
    pub fn operator_keys(&self) -> &[KeyShare] {
        if self.barrier_keys.is_empty() {
            &self.recovery_keys
        } else {
            &self.barrier_keys
        }
    }
}

/// Reply to a share submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsealResponse {
    /// Share accepted; more are needed
    Progress {
        /// Distinct shares accepted
        progress: u32,
        /// Shares needed
        threshold: u32,
    },
    /// Root key available
    Unsealed {
        /// A migration unseal finished but has not been committed yet
        migration_pending: bool,
    },
}

impl UnsealResponse {
    /// Whether the node is still sealed
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }
}

#[derive(Default)]
struct ShareSession {
    shares: Vec<KeyShare>,
}

impl ShareSession {
    fn add(&mut self, share: KeyShare) -> SealResult<()> {
        match self.shares.iter().find(|s| s.index() == share.index()) {
            Some(existing) if *existing == share => Ok(()),
            Some(_) => Err(SealError::invalid_request(format!(
                "share {} was already submitted with a different value",
                share.index()
            ))),
            None => {
                self.shares.push(share);
                Ok(())
            }
        }
    }

    fn progress(&self) -> u32 {
        self.shares.len() as u32
    }
}

struct PendingCommit {
    configs: SealConfigs,
    protected: ProtectedRootKey,
}

enum UnsealState {
    Uninitialized,
    Sealed {
        configs: SealConfigs,
        strategy: SealStrategy,
        session: ShareSession,
    },
    Migrating {
        configs: SealConfigs,
        plan: MigrationPlan,
        session: ShareSession,
    },
    Unsealed {
        configs: SealConfigs,
        root_key: RootKey,
        pending: Option<PendingCommit>,
    },
}

impl UnsealState {
    fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Sealed { .. } => "sealed",
            Self::Migrating { .. } => "migrating",
            Self::Unsealed { .. } => "unsealed",
        }
    }
}

/// Unseal coordination for one node
pub struct UnsealCoordinator {
    node: String,
    storage: Arc<dyn StorageBackend>,
    config_store: BarrierConfigStore,
    keyring: Keyring,
    seal_config: NodeSealConfig,
    active: bool,
    state: UnsealState,
}

impl UnsealCoordinator {
    /// Start a node over `storage` with the given seal settings.
    ///
    /// Fails with `InvalidRequest` when the stored and configured seals cannot
    /// be reconciled (delegated barrier without any delegated seal, or a
    /// delegated-to-delegated switch).
    pub async fn start(
        node: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        seal_config: NodeSealConfig,
    ) -> SealResult<Self> {
        let mut coordinator = Self {
            node: node.into(),
            config_store: BarrierConfigStore::new(storage.clone()),
            keyring: Keyring::new(storage.clone()),
            storage,
            seal_config,
            active: false,
            state: UnsealState::Uninitialized,
        };
        coordinator.state = coordinator.classify().await?;
        info!(
            node = %coordinator.node,
            state = coordinator.state.name(),
            seal = %coordinator.seal_config.kind(),
            "node started"
        );
        Ok(coordinator)
    }

    /// Node label used in logs
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Whether this node is the active (leader) node
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether the root key is in memory
    pub fn is_unsealed(&self) -> bool {
        matches!(self.state, UnsealState::Unsealed { .. })
    }

    /// Configs this node currently works with
    pub fn configs(&self) -> Option<SealConfigs> {
        match &self.state {
            UnsealState::Uninitialized => None,
            UnsealState::Sealed { configs, .. }
            | UnsealState::Migrating { configs, .. }
            | UnsealState::Unsealed { configs, .. } => Some(*configs),
        }
    }

    /// Configs as currently persisted, bypassing in-memory state
    pub async fn stored_configs(&self) -> SealResult<Option<SealConfigs>> {
        self.config_store.read().await
    }

    /// Current status; picks up an initialisation done by another node
    pub async fn seal_status(&mut self) -> SealResult<SealStatus> {
        self.refresh_if_uninitialized().await?;
        let configured_kind = self.seal_config.kind();
        let kind = self
            .configs()
            .map(|configs| configs.barrier.kind)
            .unwrap_or(configured_kind);
        let (progress, threshold, migration_in_progress) = match &self.state {
            UnsealState::Uninitialized => (0, 0, false),
            UnsealState::Sealed {
                configs, session, ..
            } => (session.progress(), configs.unseal_threshold(), false),
            UnsealState::Migrating {
                configs, session, ..
            } => (session.progress(), configs.unseal_threshold(), true),
            UnsealState::Unsealed {
                configs, pending, ..
            } => (0, configs.unseal_threshold(), pending.is_some()),
        };
        Ok(SealStatus {
            initialized: !matches!(self.state, UnsealState::Uninitialized),
            sealed: !self.is_unsealed(),
            migration_in_progress,
            progress,
            threshold,
            kind,
            configured_kind,
        })
    }

    /// Create the root key and seal configs on empty storage.
    ///
    /// A Shamir node hands out barrier keys; a delegated node protects the
    /// root key through its service and hands out recovery keys.
    pub async fn initialize(&mut self, settings: &SealSettings) -> SealResult<InitOutput> {
        self.refresh_if_uninitialized().await?;
        if !matches!(self.state, UnsealState::Uninitialized) {
            return Err(SealError::invalid_request(format!(
                "{} is already initialized",
                self.node
            )));
        }
        if self.seal_config.unwrap_seal.is_some() {
            return Err(SealError::invalid_request(
                "cannot initialize while an unwrap seal is configured",
            ));
        }

        let (shares, threshold) = (settings.secret_shares, settings.secret_threshold);
        let unseal_key = UnsealKey::generate(&mut OsRng);
        let key_shares = shamir::split(&unseal_key, shares, threshold, &mut OsRng)?;
        let root_key = RootKey::generate(&mut OsRng);

        let strategy = self
            .seal_config
            .seal
            .clone()
            .unwrap_or(SealStrategy::Shamir(ShamirParams::new(shares, threshold)));
        let protected = strategy.protect(&root_key, &unseal_key).await?;
        let configs = strategy.configs_for(shares, threshold);

        self.keyring.write(&protected).await?;
        self.config_store.write_all(&configs).await?;
        self.state = self.classify().await?;

        info!(
            node = %self.node,
            seal = %strategy.kind(),
            shares,
            threshold,
            root_key = %root_key.fingerprint(),
            "initialized"
        );

        Ok(match strategy.kind() {
            SealKind::Shamir => InitOutput {
                barrier_keys: key_shares,
                recovery_keys: Vec::new(),
            },
            SealKind::Delegated => InitOutput {
                barrier_keys: Vec::new(),
                recovery_keys: key_shares,
            },
        })
    }

    /// Submit a base64-encoded share
    pub async fn submit_share(&mut self, share: &str, migrate: bool) -> SealResult<UnsealResponse> {
        let share = KeyShare::from_base64(share)?;
        self.submit_key_share(share, migrate).await
    }

    /// Submit a share.
    ///
    /// `migrate` must be set exactly when a migration is in progress; either
    /// mismatch is rejected without counting the share. Resubmitting a share
    /// already counted has no effect.
    pub async fn submit_key_share(
        &mut self,
        share: KeyShare,
        migrate: bool,
    ) -> SealResult<UnsealResponse> {
        self.refresh_if_uninitialized().await?;
        let (progress, threshold) = match &mut self.state {
            UnsealState::Uninitialized => {
                return Err(SealError::invalid_request(format!(
                    "{} is not initialized",
                    self.node
                )))
            }
            UnsealState::Unsealed { pending, .. } => {
                return Ok(UnsealResponse::Unsealed {
                    migration_pending: pending.is_some(),
                })
            }
            UnsealState::Sealed {
                configs, session, ..
            } => {
                if migrate {
                    return Err(SealError::invalid_request(
                        "migrate flag set but no seal migration is in progress",
                    ));
                }
                session.add(share)?;
                (session.progress(), configs.unseal_threshold())
            }
            UnsealState::Migrating {
                configs, session, ..
            } => {
                if !migrate {
                    return Err(SealError::invalid_request(
                        "seal migration in progress: shares must be submitted with migrate=true",
                    ));
                }
                session.add(share)?;
                (session.progress(), configs.unseal_threshold())
            }
        };

        debug!(node = %self.node, progress, threshold, "share accepted");
        if progress < threshold {
            return Ok(UnsealResponse::Progress {
                progress,
                threshold,
            });
        }
        self.reconstruct().await
    }

    /// Unseal a delegated node through its service, without shares
    pub async fn unseal_with_stored_keys(&mut self) -> SealResult<UnsealResponse> {
        self.refresh_if_uninitialized().await?;
        let (configs, strategy) = match &self.state {
            UnsealState::Uninitialized => {
                return Err(SealError::invalid_request(format!(
                    "{} is not initialized",
                    self.node
                )))
            }
            UnsealState::Unsealed { pending, .. } => {
                return Ok(UnsealResponse::Unsealed {
                    migration_pending: pending.is_some(),
                })
            }
            UnsealState::Migrating { .. } => {
                return Err(SealError::invalid_request(
                    "seal migration in progress: submit shares with migrate=true",
                ))
            }
            UnsealState::Sealed {
                configs, strategy, ..
            } => (*configs, strategy.clone()),
        };
        if strategy.kind() != SealKind::Delegated {
            return Err(SealError::invalid_request(
                "stored keys are only available with a delegated seal",
            ));
        }

        let protected = self.protected_root_key(configs.barrier.kind).await?;
        match strategy.reveal(&protected, RevealInput::Stored).await? {
            RevealOutcome::Revealed { root_key, .. } => {
                info!(node = %self.node, root_key = %root_key.fingerprint(), "unsealed with stored keys");
                self.state = UnsealState::Unsealed {
                    configs,
                    root_key,
                    pending: None,
                };
                Ok(UnsealResponse::Unsealed {
                    migration_pending: false,
                })
            }
            RevealOutcome::NeedMoreShares {
                progress,
                threshold,
            } => Ok(UnsealResponse::Progress {
                progress,
                threshold,
            }),
        }
    }

    /// Drop the root key and return to the sealed state of what is stored.
    ///
    /// An uncommitted migration is discarded.
    pub async fn seal(&mut self) -> SealResult<()> {
        let pending = match &self.state {
            UnsealState::Unsealed { pending, .. } => Some(pending.is_some()),
            _ => None,
        };
        if let Some(pending) = pending {
            if pending {
                warn!(node = %self.node, "sealing with an uncommitted seal migration");
            }
            self.active = false;
            self.state = self.classify().await?;
            info!(node = %self.node, state = self.state.name(), "sealed");
        }
        Ok(())
    }

    /// Make this node the active node, committing any pending migration.
    ///
    /// Returns whether a migration was committed.
    pub async fn promote(&mut self) -> SealResult<bool> {
        if !self.is_unsealed() {
            return Err(SealError::invalid_request(format!(
                "{} is sealed and cannot become active",
                self.node
            )));
        }
        self.active = true;
        info!(node = %self.node, "became active");
        self.commit_pending().await
    }

    /// Re-read seal state after storage changed underneath the node.
    ///
    /// A sealed node restarts its share session. An unsealed node drops its
    /// pending migration once another node has committed the same configs.
    pub async fn reload(&mut self) -> SealResult<()> {
        if self.is_unsealed() {
            let stored = self.config_store.read().await?;
            if let (
                Some(stored),
                UnsealState::Unsealed {
                    configs, pending, ..
                },
            ) = (stored, &mut self.state)
            {
                *configs = stored;
                if pending.as_ref().is_some_and(|p| p.configs == stored) {
                    *pending = None;
                    info!(node = %self.node, "seal migration committed by the active node");
                }
            }
        } else {
            self.state = self.classify().await?;
        }
        debug!(node = %self.node, state = self.state.name(), "seal state reloaded");
        Ok(())
    }

    /// Logical data store; only while unsealed
    pub fn secrets(&self) -> SealResult<SecretStore> {
        match &self.state {
            UnsealState::Unsealed { root_key, .. } => {
                Ok(SecretStore::new(self.storage.clone(), root_key.clone()))
            }
            _ => Err(SealError::invalid_request(format!("{} is sealed", self.node))),
        }
    }

    async fn refresh_if_uninitialized(&mut self) -> SealResult<()> {
        if matches!(self.state, UnsealState::Uninitialized) {
            self.state = self.classify().await?;
        }
        Ok(())
    }

    async fn protected_root_key(&self, kind: SealKind) -> SealResult<ProtectedRootKey> {
        self.keyring
            .read_for(kind)
            .await?
            .ok_or_else(|| SealError::consistency("seal config exists but no root key is stored"))
    }

    /// Pick the state for what is stored versus what is configured.
    async fn classify(&self) -> SealResult<UnsealState> {
        let Some(configs) = self.config_store.read().await? else {
            return Ok(UnsealState::Uninitialized);
        };
        let barrier = configs.barrier;
        let stored_shamir = || {
            SealStrategy::Shamir(ShamirParams::new(
                barrier.secret_shares,
                barrier.secret_threshold,
            ))
        };

        let configured = self.seal_config.seal.as_ref();
        let unwrap = self.seal_config.unwrap_seal.as_ref();
        let retired = match (barrier.kind, configured) {
            (SealKind::Shamir, Some(SealStrategy::Delegated(seal))) => self
                .keyring
                .read_for(SealKind::Shamir)
                .await?
                .and_then(|record| record.retired().cloned())
                .is_some_and(|retired| retired.matches(seal)),
            _ => false,
        };
        let state = match (barrier.kind, configured, unwrap) {
            (SealKind::Shamir, None | Some(SealStrategy::Shamir(_)), unwrap) => {
                if unwrap.is_some() {
                    warn!(node = %self.node, "unwrap seal configured but barrier is already shamir");
                }
                UnsealState::Sealed {
                    configs,
                    strategy: stored_shamir(),
                    session: ShareSession::default(),
                }
            }
            // Still configured with the delegated seal the cluster already
            // migrated away from: finish on the stored Shamir barrier.
            (SealKind::Shamir, Some(SealStrategy::Delegated(_)), _) if retired => {
                info!(
                    node = %self.node,
                    "configured delegated seal was retired by a completed migration"
                );
                UnsealState::Migrating {
                    configs,
                    plan: MigrationPlan {
                        from: stored_shamir(),
                        to: stored_shamir(),
                    },
                    session: ShareSession::default(),
                }
            }
            (SealKind::Shamir, Some(target @ SealStrategy::Delegated(_)), _) => {
                UnsealState::Migrating {
                    configs,
                    plan: MigrationPlan {
                        from: stored_shamir(),
                        to: target.clone(),
                    },
                    session: ShareSession::default(),
                }
            }
            (SealKind::Delegated, Some(seal @ SealStrategy::Delegated(_)), None) => {
                UnsealState::Sealed {
                    configs,
                    strategy: seal.clone(),
                    session: ShareSession::default(),
                }
            }
            (SealKind::Delegated, Some(SealStrategy::Delegated(_)), Some(_)) => {
                return Err(SealError::invalid_request(
                    "migrating between two delegated seals is not supported",
                ))
            }
            (
                SealKind::Delegated,
                None | Some(SealStrategy::Shamir(_)),
                Some(from @ SealStrategy::Delegated(_)),
            ) => {
                let recovery = configs.recovery.ok_or_else(|| {
                    SealError::consistency("delegated barrier config has no recovery config")
                })?;
                UnsealState::Migrating {
                    configs,
                    plan: MigrationPlan {
                        from: from.clone(),
                        to: SealStrategy::Shamir(ShamirParams::new(
                            recovery.secret_shares,
                            recovery.secret_threshold,
                        )),
                    },
                    session: ShareSession::default(),
                }
            }
            (SealKind::Delegated, None | Some(SealStrategy::Shamir(_)), Some(_)) => {
                return Err(SealError::invalid_request(
                    "unwrap seal must be a delegated seal",
                ))
            }
            (SealKind::Delegated, None | Some(SealStrategy::Shamir(_)), None) => {
                return Err(SealError::invalid_request(
                    "barrier is protected by a delegated seal but none is configured",
                ))
            }
        };

        if let UnsealState::Migrating { plan, .. } = &state {
            info!(
                node = %self.node,
                from = %plan.from.kind(),
                to = %plan.to.kind(),
                "seal migration detected"
            );
        }
        Ok(state)
    }

    /// Threshold reached: recover the root key and, when migrating,
    /// re-protect it under the new seal.
    async fn reconstruct(&mut self) -> SealResult<UnsealResponse> {
        let (configs, from, plan, shares) = match &self.state {
            UnsealState::Sealed {
                configs,
                strategy,
                session,
            } => (*configs, strategy.clone(), None, session.shares.clone()),
            UnsealState::Migrating {
                configs,
                plan,
                session,
            } => (
                *configs,
                plan.from.clone(),
                Some(plan.clone()),
                session.shares.clone(),
            ),
            _ => {
                return Err(SealError::consistency(
                    "reconstruction attempted outside a share session",
                ))
            }
        };

        let protected = self.protected_root_key(configs.barrier.kind).await?;
        let threshold = configs.unseal_threshold();
        let revealed = from
            .reveal(
                &protected,
                RevealInput::Shares {
                    shares: &distinct_shares(&shares)?,
                    threshold,
                },
            )
            .await;

        let (root_key, unseal_key) = match revealed {
            Ok(RevealOutcome::Revealed {
                root_key,
                unseal_key,
            }) => (root_key, unseal_key),
            Ok(RevealOutcome::NeedMoreShares {
                progress,
                threshold,
            }) => {
                return Ok(UnsealResponse::Progress {
                    progress,
                    threshold,
                })
            }
            Err(err @ SealError::InvalidRequest { .. }) => {
                warn!(node = %self.node, error = %err, "unseal failed, resetting share session");
                self.reset_session();
                return Err(err);
            }
            Err(err) => {
                warn!(node = %self.node, error = %err, "unseal attempt failed, keeping shares");
                return Err(err);
            }
        };

        let plan = match plan {
            Some(plan) if plan.to.kind() == configs.barrier.kind => {
                info!(
                    node = %self.node,
                    seal = %configs.barrier.kind,
                    "seal migration already committed"
                );
                None
            }
            plan => plan,
        };
        let Some(plan) = plan else {
            info!(node = %self.node, root_key = %root_key.fingerprint(), "unsealed");
            self.state = UnsealState::Unsealed {
                configs,
                root_key,
                pending: None,
            };
            return Ok(UnsealResponse::Unsealed {
                migration_pending: false,
            });
        };

        let unseal_key = unseal_key.ok_or_else(|| {
            SealError::consistency("migration unseal did not rebuild the operator key")
        })?;
        let reprotected = plan
            .to
            .protect(&root_key, &unseal_key)
            .await?
            .retiring(&plan.from);
        let operator_set = configs.operator_set();
        let new_configs =
            plan.to
                .configs_for(operator_set.secret_shares, operator_set.secret_threshold);

        info!(
            node = %self.node,
            from = %plan.from.kind(),
            to = %plan.to.kind(),
            root_key = %root_key.fingerprint(),
            "unsealed for migration"
        );
        self.state = UnsealState::Unsealed {
            configs,
            root_key,
            pending: Some(PendingCommit {
                configs: new_configs,
                protected: reprotected,
            }),
        };

        if self.active {
            self.commit_pending().await?;
        }
        Ok(UnsealResponse::Unsealed {
            migration_pending: !self.is_committed(),
        })
    }

    fn is_committed(&self) -> bool {
        !matches!(
            self.state,
            UnsealState::Unsealed {
                pending: Some(_),
                ..
            }
        )
    }

    fn reset_session(&mut self) {
        match &mut self.state {
            UnsealState::Sealed { session, .. } | UnsealState::Migrating { session, .. } => {
                *session = ShareSession::default()
            }
            _ => {}
        }
    }

    /// Write a pending migration and re-read what was written.
    ///
    /// The new root key record is staged before the configs change and made
    /// current after, so every intermediate state can still be unsealed.
    async fn commit_pending(&mut self) -> SealResult<bool> {
        let commit = match &self.state {
            UnsealState::Unsealed {
                pending: Some(commit),
                ..
            } => (commit.configs, commit.protected.clone()),
            _ => return Ok(false),
        };
        let (new_configs, protected) = commit;

        self.keyring.stage(&protected).await?;
        self.config_store.write_all(&new_configs).await?;
        self.keyring.finish(&protected).await?;

        let stored = self.config_store.read().await?;
        if stored != Some(new_configs) {
            return Err(SealError::consistency(format!(
                "seal config read back after commit does not match what was written on {}",
                self.node
            )));
        }

        if let UnsealState::Unsealed {
            configs, pending, ..
        } = &mut self.state
        {
            *configs = new_configs;
            *pending = None;
        }
        info!(
            node = %self.node,
            barrier = %new_configs.barrier.kind,
            shares = new_configs.barrier.secret_shares,
            threshold = new_configs.barrier.secret_threshold,
            "seal migration committed"
        );
        Ok(true)
    }
}
