//! Post-migration checks.

use crate::membership::SealClient;
use crate::policy::MigrationDirection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{BarrierConfig, SealConfigs, SealError, SealKind, SealResult};
use tracing::info;

/// Expected `(type, shares, threshold, stored)` of one config record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigShape {
    /// Seal type
    pub kind: SealKind,
    /// Shares handed out
    pub shares: u32,
    /// Shares needed
    pub threshold: u32,
    /// Shares stored internally
    pub stored: u32,
}

impl ConfigShape {
    fn check(&self, config: &BarrierConfig) -> SealResult<()> {
        config.verify(self.kind, self.shares, self.threshold, self.stored)
    }
}

impl From<BarrierConfig> for ConfigShape {
    fn from(config: BarrierConfig) -> Self {
        Self {
            kind: config.kind,
            shares: config.secret_shares,
            threshold: config.secret_threshold,
            stored: config.stored_shares,
        }
    }
}

/// Seal configs a cluster should end up with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedSeal {
    /// Barrier record
    pub barrier: ConfigShape,
    /// Recovery record, absent for Shamir
    pub recovery: Option<ConfigShape>,
}

impl ExpectedSeal {
    /// Shamir barrier over `shares`/`threshold` operator keys
    pub fn shamir(shares: u32, threshold: u32) -> Self {
        Self {
            barrier: BarrierConfig::shamir(shares, threshold).into(),
            recovery: None,
        }
    }

    /// Delegated barrier with `shares`/`threshold` recovery keys
    pub fn delegated(shares: u32, threshold: u32) -> Self {
        Self {
            barrier: BarrierConfig::delegated().into(),
            recovery: Some(BarrierConfig::recovery(shares, threshold).into()),
        }
    }

    /// Expected end state of a migration; the operator share set is unchanged
    pub fn after(direction: MigrationDirection, shares: u32, threshold: u32) -> Self {
        match direction.to_kind() {
            SealKind::Shamir => Self::shamir(shares, threshold),
            SealKind::Delegated => Self::delegated(shares, threshold),
        }
    }

    /// Compare against persisted configs
    pub fn check(&self, configs: &SealConfigs) -> SealResult<()> {
        self.barrier.check(&configs.barrier)?;
        match (&self.recovery, &configs.recovery) {
            (Some(expected), Some(actual)) => expected.check(actual),
            (None, None) => Ok(()),
            (Some(_), None) => Err(SealError::consistency(
                "bad seal config: recovery config is missing",
            )),
            (None, Some(actual)) => Err(SealError::consistency(format!(
                "bad seal config: unexpected {} recovery config",
                actual.kind
            ))),
        }
    }
}

/// A secret written before the migration that must still read back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretCheck {
    /// Logical path
    pub path: String,
    /// Expected document
    pub value: Value,
}

impl SecretCheck {
    /// Check for `value` at `path`
    pub fn new(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
        }
    }
}

/// Check `leader`'s persisted configs and, if given, that the secret named by
/// `check` is intact.
pub async fn verify_seal<C: SealClient + ?Sized>(
    cluster: &C,
    leader: usize,
    expected: &ExpectedSeal,
    check: Option<&SecretCheck>,
) -> SealResult<()> {
    let configs = cluster.seal_configs(leader).await?.ok_or_else(|| {
        SealError::consistency(format!("node {leader} has no seal config after migration"))
    })?;
    expected.check(&configs)?;

    if let Some(check) = check {
        let found = cluster.read_secret(leader, &check.path).await?;
        if found.as_ref() != Some(&check.value) {
            return Err(SealError::consistency(format!(
                "secret at {} changed across the migration: found {}",
                check.path,
                found.map_or_else(|| "nothing".to_string(), |v| v.to_string())
            )));
        }
    }

    info!(
        leader,
        barrier = %configs.barrier.kind,
        "post-migration seal verified"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_after_direction() {
        let expected = ExpectedSeal::after(MigrationDirection::ShamirToDelegated, 3, 3);
        let configs = SealConfigs {
            barrier: BarrierConfig::delegated(),
            recovery: Some(BarrierConfig::recovery(3, 3)),
        };
        expected.check(&configs).unwrap();

        let expected = ExpectedSeal::after(MigrationDirection::DelegatedToShamir, 3, 3);
        assert_matches!(
            expected.check(&configs),
            Err(SealError::ConsistencyViolation { .. })
        );
        expected
            .check(&SealConfigs {
                barrier: BarrierConfig::shamir(3, 3),
                recovery: None,
            })
            .unwrap();
    }

    #[test]
    fn test_mismatch_names_fields() {
        let err = ExpectedSeal::shamir(3, 3)
            .check(&SealConfigs {
                barrier: BarrierConfig::shamir(5, 2),
                recovery: None,
            })
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("secret_shares=5"));
        assert!(message.contains("secret_threshold=2"));
    }

    #[test]
    fn test_missing_recovery() {
        assert_matches!(
            ExpectedSeal::delegated(3, 3).check(&SealConfigs {
                barrier: BarrierConfig::delegated(),
                recovery: None,
            }),
            Err(SealError::ConsistencyViolation { .. })
        );
    }
}
