//! Seal descriptors shared by every layer.

use crate::errors::{SealError, SealResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest share set a config may describe; share indices are a single byte.
pub const MAX_SHARES: u32 = 255;

/// How the root key is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealKind {
    /// Threshold secret sharing held by operators
    Shamir,
    /// Wrapped by an external key-management endpoint
    Delegated,
}

impl fmt::Display for SealKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shamir => write!(f, "shamir"),
            Self::Delegated => write!(f, "delegated"),
        }
    }
}

/// Which persisted record a [`BarrierConfig`] occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSlot {
    /// Describes the seal protecting the root key
    Barrier,
    /// Describes the share set authorizing privileged operations on a delegated seal
    Recovery,
}

impl ConfigSlot {
    /// Storage key for this record
    pub fn storage_key(self) -> &'static str {
        match self {
            Self::Barrier => "core/seal-config",
            Self::Recovery => "core/recovery-config",
        }
    }
}

impl fmt::Display for ConfigSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Barrier => write!(f, "barrier"),
            Self::Recovery => write!(f, "recovery"),
        }
    }
}

/// Persisted descriptor of a seal configuration.
///
/// A Shamir barrier stores one wrapped copy of the root key (`stored_shares = 1`);
/// the operator shares reconstruct the key that unwraps it. A delegated barrier is
/// always `1/1/1`: the service is the single share. A recovery config is always
/// Shamir with nothing stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierConfig {
    /// Seal type
    #[serde(rename = "type")]
    pub kind: SealKind,
    /// Total number of shares handed out
    pub secret_shares: u32,
    /// Shares needed to reconstruct
    pub secret_threshold: u32,
    /// Shares kept internally rather than given to operators
    pub stored_shares: u32,
}

impl BarrierConfig {
    /// Barrier config for a Shamir seal
    pub fn shamir(shares: u32, threshold: u32) -> Self {
        Self {
            kind: SealKind::Shamir,
            secret_shares: shares,
            secret_threshold: threshold,
            stored_shares: 1,
        }
    }

    /// Barrier config for a delegated seal
    pub fn delegated() -> Self {
        Self {
            kind: SealKind::Delegated,
            secret_shares: 1,
            secret_threshold: 1,
            stored_shares: 1,
        }
    }

    /// Recovery config layered on a delegated barrier
    pub fn recovery(shares: u32, threshold: u32) -> Self {
        Self {
            kind: SealKind::Shamir,
            secret_shares: shares,
            secret_threshold: threshold,
            stored_shares: 0,
        }
    }

    /// Check the structural invariants for the given slot.
    pub fn validate(&self, slot: ConfigSlot) -> SealResult<()> {
        if self.secret_threshold == 0 {
            return Err(SealError::invalid_request(format!(
                "{slot} config: threshold must be at least 1"
            )));
        }
        if self.secret_threshold > self.secret_shares {
            return Err(SealError::invalid_request(format!(
                "{slot} config: threshold {} exceeds share count {}",
                self.secret_threshold, self.secret_shares
            )));
        }
        if self.secret_shares > MAX_SHARES {
            return Err(SealError::invalid_request(format!(
                "{slot} config: at most {MAX_SHARES} shares are supported"
            )));
        }

        match (slot, self.kind) {
            (ConfigSlot::Barrier, SealKind::Delegated) if *self != Self::delegated() => {
                Err(SealError::invalid_request(
                    "barrier config: a delegated seal must be 1 share, threshold 1, 1 stored",
                ))
            }
            (ConfigSlot::Recovery, SealKind::Delegated) => Err(SealError::invalid_request(
                "recovery config must be shamir",
            )),
            (ConfigSlot::Recovery, SealKind::Shamir) if self.stored_shares != 0 => Err(
                SealError::invalid_request("recovery config cannot store shares"),
            ),
            _ => Ok(()),
        }
    }

    /// Compare against an expected `(kind, shares, threshold, stored)` shape.
    ///
    /// Every mismatching field is reported.
    pub fn verify(
        &self,
        kind: SealKind,
        shares: u32,
        threshold: u32,
        stored: u32,
    ) -> SealResult<()> {
        let mut mismatches = Vec::new();
        if self.kind != kind {
            mismatches.push(format!("type={} (expected {kind})", self.kind));
        }
        if self.secret_shares != shares {
            mismatches.push(format!(
                "secret_shares={} (expected {shares})",
                self.secret_shares
            ));
        }
        if self.secret_threshold != threshold {
            mismatches.push(format!(
                "secret_threshold={} (expected {threshold})",
                self.secret_threshold
            ));
        }
        if self.stored_shares != stored {
            mismatches.push(format!(
                "stored_shares={} (expected {stored})",
                self.stored_shares
            ));
        }

        if mismatches.is_empty() {
            Ok(())
        } else {
            Err(SealError::consistency(format!(
                "bad seal config: {}",
                mismatches.join(", ")
            )))
        }
    }
}

/// The barrier record plus the optional recovery record, as read from storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealConfigs {
    /// Active barrier seal
    pub barrier: BarrierConfig,
    /// Present exactly when the barrier is delegated
    pub recovery: Option<BarrierConfig>,
}

impl SealConfigs {
    /// Config of the share set operators hold: recovery keys under a
    /// delegated barrier, barrier keys under Shamir.
    pub fn operator_set(&self) -> BarrierConfig {
        match (self.barrier.kind, self.recovery) {
            (SealKind::Delegated, Some(recovery)) => recovery,
            _ => self.barrier,
        }
    }

    /// Threshold of the share set an operator must submit to this node.
    pub fn unseal_threshold(&self) -> u32 {
        self.operator_set().secret_threshold
    }
}

/// Seal status as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether a barrier config exists
    pub initialized: bool,
    /// Whether the root key is unavailable
    pub sealed: bool,
    /// True from migration start until this node commits the new config
    pub migration_in_progress: bool,
    /// Distinct shares accepted so far in the current session
    pub progress: u32,
    /// Shares needed to unseal
    pub threshold: u32,
    /// Seal type of the stored barrier; the configured type before
    /// initialisation
    pub kind: SealKind,
    /// Seal type the node is configured to run with
    pub configured_kind: SealKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delegated_shape_is_fixed() {
        assert!(BarrierConfig::delegated()
            .validate(ConfigSlot::Barrier)
            .is_ok());

        let bad = BarrierConfig {
            kind: SealKind::Delegated,
            secret_shares: 3,
            secret_threshold: 2,
            stored_shares: 1,
        };
        assert!(bad.validate(ConfigSlot::Barrier).is_err());
    }

    #[test]
    fn test_threshold_cannot_exceed_shares() {
        let cfg = BarrierConfig::shamir(2, 3);
        assert!(matches!(
            cfg.validate(ConfigSlot::Barrier),
            Err(SealError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_recovery_must_be_shamir_without_stored_shares() {
        assert!(BarrierConfig::recovery(3, 3)
            .validate(ConfigSlot::Recovery)
            .is_ok());
        assert!(BarrierConfig::shamir(3, 3)
            .validate(ConfigSlot::Recovery)
            .is_err());
        assert!(BarrierConfig::delegated()
            .validate(ConfigSlot::Recovery)
            .is_err());
    }

    #[test]
    fn test_verify_reports_every_mismatch() {
        let cfg = BarrierConfig::shamir(5, 3);
        let err = cfg.verify(SealKind::Delegated, 1, 1, 1).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("type=shamir"));
        assert!(message.contains("secret_shares=5"));
        assert!(message.contains("secret_threshold=3"));
        assert!(!message.contains("stored_shares"));
    }

    #[test]
    fn test_verify_accepts_exact_match() {
        BarrierConfig::recovery(3, 3)
            .verify(SealKind::Shamir, 3, 3, 0)
            .unwrap();
    }

    #[test]
    fn test_persisted_field_names() {
        let json = serde_json::to_value(BarrierConfig::delegated()).unwrap();
        assert_eq!(json["type"], "delegated");
        assert_eq!(json["stored_shares"], 1);
    }

    #[test]
    fn test_unseal_threshold_uses_recovery_for_delegated() {
        let configs = SealConfigs {
            barrier: BarrierConfig::delegated(),
            recovery: Some(BarrierConfig::recovery(5, 2)),
        };
        assert_eq!(configs.unseal_threshold(), 2);
        assert_eq!(configs.operator_set().secret_shares, 5);

        let configs = SealConfigs {
            barrier: BarrierConfig::shamir(5, 4),
            recovery: None,
        };
        assert_eq!(configs.unseal_threshold(), 4);
        assert_eq!(configs.operator_set(), BarrierConfig::shamir(5, 4));
    }
}
