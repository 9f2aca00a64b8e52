//! Persisted barrier and recovery configs.

use crate::storage::{StorageBackend, StorageExt};
use std::sync::Arc;
use tessera_core::{BarrierConfig, ConfigSlot, SealConfigs, SealError, SealKind, SealResult};
use tracing::{debug, warn};

/// Reads and writes the two seal config records of one storage view.
#[derive(Clone)]
pub struct BarrierConfigStore {
    storage: Arc<dyn StorageBackend>,
}

impl BarrierConfigStore {
    /// Store backed by `storage`
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Current configs, or `None` before initialisation.
    ///
    /// A delegated barrier without a recovery record is a consistency
    /// violation. A recovery record next to a Shamir barrier is what an
    /// interrupted [`write_all`](Self::write_all) leaves behind; it is
    /// ignored.
    pub async fn read(&self) -> SealResult<Option<SealConfigs>> {
        let Some(barrier) = self.read_slot(ConfigSlot::Barrier).await? else {
            return Ok(None);
        };
        let recovery = self.read_slot(ConfigSlot::Recovery).await?;

        match (barrier.kind, recovery) {
            (SealKind::Delegated, None) => Err(SealError::consistency(
                "delegated barrier config has no recovery config",
            )),
            (SealKind::Shamir, Some(_)) => {
                warn!("ignoring leftover recovery config next to a shamir barrier");
                Ok(Some(SealConfigs {
                    barrier,
                    recovery: None,
                }))
            }
            _ => Ok(Some(SealConfigs { barrier, recovery })),
        }
    }

    /// Read one slot
    pub async fn read_slot(&self, slot: ConfigSlot) -> SealResult<Option<BarrierConfig>> {
        let config: Option<BarrierConfig> = self.storage.get_json(slot.storage_key()).await?;
        if let Some(config) = &config {
            config.validate(slot)?;
        }
        Ok(config)
    }

    /// Validate and write one slot
    pub async fn write(&self, slot: ConfigSlot, config: &BarrierConfig) -> SealResult<()> {
        config.validate(slot)?;
        self.storage.put_json(slot.storage_key(), config).await?;
        debug!(%slot, kind = %config.kind, shares = config.secret_shares,
            threshold = config.secret_threshold, "seal config written");
        Ok(())
    }

    /// Write both slots, removing the recovery record when absent.
    ///
    /// A new recovery record goes in before the barrier; a stale one is
    /// removed after it. Stopping between the two writes leaves either the
    /// old configs or a Shamir barrier with a leftover recovery record.
    pub async fn write_all(&self, configs: &SealConfigs) -> SealResult<()> {
        configs.barrier.validate(ConfigSlot::Barrier)?;
        match &configs.recovery {
            Some(recovery) => {
                self.write(ConfigSlot::Recovery, recovery).await?;
                self.write(ConfigSlot::Barrier, &configs.barrier).await
            }
            None => {
                self.write(ConfigSlot::Barrier, &configs.barrier).await?;
                self.storage
                    .delete(ConfigSlot::Recovery.storage_key())
                    .await?;
                Ok(())
            }
        }
    }
}
