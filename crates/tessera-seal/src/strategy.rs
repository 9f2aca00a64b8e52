//! Seal strategies: how the root key is protected at rest.
//!
//! A strategy turns a root key into a [`ProtectedRootKey`] record and turns
//! that record (plus operator shares, when needed) back into the root key.
//! Neither direction touches storage; callers persist the record.

use crate::kms::{KeyWrapService, WrappedKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tessera_core::{
    shamir, BarrierConfig, KeyShare, RootKey, SealConfigs, SealError, SealKind, SealResult,
    SealedBlob, UnsealKey,
};

const ROOT_KEY_CONTEXT: &str = "tessera-root-key";

/// Share-set shape of a Shamir seal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShamirParams {
    /// Shares handed out
    pub shares: u32,
    /// Shares needed
    pub threshold: u32,
}

impl ShamirParams {
    /// Build a share-set shape
    pub fn new(shares: u32, threshold: u32) -> Self {
        Self { shares, threshold }
    }
}

/// Delegated seal: an external service holds the key that wraps the root key
#[derive(Clone)]
pub struct DelegatedSeal {
    service: Arc<dyn KeyWrapService>,
    key_name: String,
    token: String,
}

impl DelegatedSeal {
    /// Seal through `service` using `key_name`, authenticating with `token`
    pub fn new(
        service: Arc<dyn KeyWrapService>,
        key_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            service,
            key_name: key_name.into(),
            token: token.into(),
        }
    }

    /// Service-side key name
    pub fn key_name(&self) -> &str {
        &self.key_name
    }

    /// Service endpoint
    pub fn endpoint(&self) -> String {
        self.service.endpoint()
    }
}

impl fmt::Debug for DelegatedSeal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedSeal")
            .field("endpoint", &self.service.endpoint())
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

/// Identity of a delegated seal a Shamir root key was migrated away from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredSeal {
    /// Service endpoint
    pub endpoint: String,
    /// Service-side key name
    pub key_name: String,
}

impl RetiredSeal {
    /// Identity of `seal`
    pub fn of(seal: &DelegatedSeal) -> Self {
        Self {
            endpoint: seal.endpoint(),
            key_name: seal.key_name.clone(),
        }
    }

    /// Whether `seal` is the retired one
    pub fn matches(&self, seal: &DelegatedSeal) -> bool {
        self.key_name == seal.key_name && self.endpoint == seal.endpoint()
    }
}

/// The two ways a root key can be protected
#[derive(Debug, Clone)]
pub enum SealStrategy {
    /// Operators hold shares of the key that unwraps the root key
    Shamir(ShamirParams),
    /// An external service unwraps the root key; operator shares become recovery keys
    Delegated(DelegatedSeal),
}

/// Persisted form of the protected root key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtectedRootKey {
    /// Root key wrapped under the unseal key
    Shamir {
        /// Root key ciphertext
        wrapped: SealedBlob,
        /// Delegated seal this record replaced, when it came from a migration
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retired: Option<RetiredSeal>,
    },
    /// Root key wrapped by the external service
    Delegated {
        /// Service ciphertext
        wrapped: WrappedKey,
        /// Check value for recovery keys
        recovery_verifier: [u8; 32],
    },
}

impl ProtectedRootKey {
    /// Seal type that produced this record
    pub fn kind(&self) -> SealKind {
        match self {
            Self::Shamir { .. } => SealKind::Shamir,
            Self::Delegated { .. } => SealKind::Delegated,
        }
    }

    /// Delegated seal a Shamir record was migrated away from
    pub fn retired(&self) -> Option<&RetiredSeal> {
        match self {
            Self::Shamir { retired, .. } => retired.as_ref(),
            Self::Delegated { .. } => None,
        }
    }

    /// Record `from` as the seal this record replaces.
    ///
    /// Only a Shamir record replacing a delegated seal keeps the mark.
    pub fn retiring(self, from: &SealStrategy) -> Self {
        match (self, from) {
            (Self::Shamir { wrapped, .. }, SealStrategy::Delegated(seal)) => Self::Shamir {
                wrapped,
                retired: Some(RetiredSeal::of(seal)),
            },
            (record, _) => record,
        }
    }
}

/// What the caller offers to [`SealStrategy::reveal`]
#[derive(Debug, Clone, Copy)]
pub enum RevealInput<'a> {
    /// Operator shares, with the threshold of their share set
    Shares {
        /// Submitted shares
        shares: &'a [KeyShare],
        /// Shares needed
        threshold: u32,
    },
    /// Nothing; only a delegated seal can unseal this way
    Stored,
}

/// Result of an unseal attempt
#[derive(Debug)]
pub enum RevealOutcome {
    /// Fewer distinct shares than the threshold
    NeedMoreShares {
        /// Distinct shares seen
        progress: u32,
        /// Shares needed
        threshold: u32,
    },
    /// Root key recovered
    Revealed {
        /// The root key
        root_key: RootKey,
        /// Key rebuilt from the operator shares, if shares were used
        unseal_key: Option<UnsealKey>,
    },
}

impl SealStrategy {
    /// Seal type
    pub fn kind(&self) -> SealKind {
        match self {
            Self::Shamir(_) => SealKind::Shamir,
            Self::Delegated(_) => SealKind::Delegated,
        }
    }

    /// Barrier and recovery configs for this strategy when the operator
    /// share set has the given shape.
    pub fn configs_for(&self, shares: u32, threshold: u32) -> SealConfigs {
        match self {
            Self::Shamir(_) => SealConfigs {
                barrier: BarrierConfig::shamir(shares, threshold),
                recovery: None,
            },
            Self::Delegated(_) => SealConfigs {
                barrier: BarrierConfig::delegated(),
                recovery: Some(BarrierConfig::recovery(shares, threshold)),
            },
        }
    }

    /// Protect `root_key`.
    ///
    /// `unseal_key` is the key behind the operator shares: a Shamir seal wraps
    /// the root key with it, a delegated seal stores its verifier so the same
    /// shares keep working as recovery keys.
    pub async fn protect(
        &self,
        root_key: &RootKey,
        unseal_key: &UnsealKey,
    ) -> SealResult<ProtectedRootKey> {
        match self {
            Self::Shamir(_) => {
                let wrapping_key = unseal_key.wrapping_key(ROOT_KEY_CONTEXT);
                let wrapped = SealedBlob::seal(
                    root_key.as_bytes(),
                    &wrapping_key,
                    ROOT_KEY_CONTEXT,
                    &mut rand::rngs::OsRng,
                )?;
                Ok(ProtectedRootKey::Shamir {
                    wrapped,
                    retired: None,
                })
            }
            Self::Delegated(seal) => {
                let wrapped = seal
                    .service
                    .encrypt(&seal.token, &seal.key_name, root_key.as_bytes())
                    .await?;
                Ok(ProtectedRootKey::Delegated {
                    wrapped,
                    recovery_verifier: unseal_key.verifier(),
                })
            }
        }
    }

    /// Try to recover the root key from `protected`.
    ///
    /// Shares are deduplicated by index; the same index with a different value
    /// is rejected. Below the threshold nothing is reconstructed. A wrong key
    /// surfaces as `InvalidRequest`; an unreachable service as
    /// `ServiceUnavailable`.
    pub async fn reveal(
        &self,
        protected: &ProtectedRootKey,
        input: RevealInput<'_>,
    ) -> SealResult<RevealOutcome> {
        if protected.kind() != self.kind() {
            return Err(SealError::consistency(format!(
                "stored root key is protected by a {} seal, not {}",
                protected.kind(),
                self.kind()
            )));
        }

        let unseal_key = match input {
            RevealInput::Stored => None,
            RevealInput::Shares { shares, threshold } => {
                let distinct = distinct_shares(shares)?;
                if (distinct.len() as u32) < threshold {
                    return Ok(RevealOutcome::NeedMoreShares {
                        progress: distinct.len() as u32,
                        threshold,
                    });
                }
                Some(shamir::combine(&distinct)?)
            }
        };

        let root_key = match (self, protected, &unseal_key) {
            (Self::Shamir(_), ProtectedRootKey::Shamir { wrapped, .. }, Some(key)) => {
                let plaintext = wrapped
                    .open(&key.wrapping_key(ROOT_KEY_CONTEXT))
                    .map_err(|_| SealError::invalid_request("unseal key is incorrect"))?;
                RootKey::from_slice(&plaintext)?
            }
            (Self::Shamir(_), _, None) => {
                return Err(SealError::invalid_request(
                    "a shamir seal can only be unsealed with key shares",
                ))
            }
            (
                Self::Delegated(seal),
                ProtectedRootKey::Delegated {
                    wrapped,
                    recovery_verifier,
                },
                recovery,
            ) => {
                if let Some(key) = recovery {
                    if key.verifier() != *recovery_verifier {
                        return Err(SealError::invalid_request("recovery key is incorrect"));
                    }
                }
                let plaintext = seal.service.decrypt(&seal.token, wrapped).await?;
                RootKey::from_slice(&plaintext)?
            }
            _ => {
                return Err(SealError::consistency(
                    "stored root key does not match the seal type",
                ))
            }
        };

        Ok(RevealOutcome::Revealed {
            root_key,
            unseal_key,
        })
    }
}

/// Distinct shares in submission order.
pub(crate) fn distinct_shares(shares: &[KeyShare]) -> SealResult<Vec<KeyShare>> {
    let mut by_index: BTreeMap<u8, &KeyShare> = BTreeMap::new();
    let mut ordered = Vec::with_capacity(shares.len());
    for share in shares {
        match by_index.get(&share.index()) {
            Some(existing) if *existing == share => {}
            Some(_) => {
                return Err(SealError::invalid_request(format!(
                    "conflicting values for share {}",
                    share.index()
                )))
            }
            None => {
                by_index.insert(share.index(), share);
                ordered.push(share.clone());
            }
        }
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::InMemoryKeyWrapService;
    use assert_matches::assert_matches;
    use rand::rngs::OsRng;

    fn delegated() -> (Arc<InMemoryKeyWrapService>, SealStrategy) {
        let service = Arc::new(InMemoryKeyWrapService::new("127.0.0.1:8200"));
        service.make_key("seal-key").unwrap();
        let token = service.issue_token().unwrap();
        let seal = DelegatedSeal::new(service.clone(), "seal-key", token);
        (service, SealStrategy::Delegated(seal))
    }

    #[tokio::test]
    async fn test_shamir_protect_and_reveal() {
        let strategy = SealStrategy::Shamir(ShamirParams::new(3, 2));
        let root = RootKey::generate(&mut OsRng);
        let key = UnsealKey::generate(&mut OsRng);
        let shares = shamir::split(&key, 3, 2, &mut OsRng).unwrap();
        let protected = strategy.protect(&root, &key).await.unwrap();

        let partial = strategy
            .reveal(
                &protected,
                RevealInput::Shares {
                    shares: &shares[..1],
                    threshold: 2,
                },
            )
            .await
            .unwrap();
        assert_matches!(
            partial,
            RevealOutcome::NeedMoreShares {
                progress: 1,
                threshold: 2
            }
        );

        let full = strategy
            .reveal(
                &protected,
                RevealInput::Shares {
                    shares: &shares[1..],
                    threshold: 2,
                },
            )
            .await
            .unwrap();
        assert_matches!(full, RevealOutcome::Revealed { root_key, unseal_key: Some(k) } => {
            assert_eq!(root_key, root);
            assert_eq!(k, key);
        });
    }

    #[tokio::test]
    async fn test_shamir_wrong_shares_rejected() {
        let strategy = SealStrategy::Shamir(ShamirParams::new(2, 2));
        let root = RootKey::generate(&mut OsRng);
        let key = UnsealKey::generate(&mut OsRng);
        let protected = strategy.protect(&root, &key).await.unwrap();

        let other = shamir::split(&UnsealKey::generate(&mut OsRng), 2, 2, &mut OsRng).unwrap();
        let result = strategy
            .reveal(
                &protected,
                RevealInput::Shares {
                    shares: &other,
                    threshold: 2,
                },
            )
            .await;
        assert_matches!(result, Err(SealError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_shamir_requires_shares() {
        let strategy = SealStrategy::Shamir(ShamirParams::new(1, 1));
        let key = UnsealKey::generate(&mut OsRng);
        let protected = strategy
            .protect(&RootKey::generate(&mut OsRng), &key)
            .await
            .unwrap();
        assert_matches!(
            strategy.reveal(&protected, RevealInput::Stored).await,
            Err(SealError::InvalidRequest { .. })
        );
    }

    #[tokio::test]
    async fn test_delegated_stored_and_recovery() {
        let (service, strategy) = delegated();
        let root = RootKey::generate(&mut OsRng);
        let recovery = UnsealKey::generate(&mut OsRng);
        let shares = shamir::split(&recovery, 3, 3, &mut OsRng).unwrap();
        let protected = strategy.protect(&root, &recovery).await.unwrap();
        assert_eq!(protected.kind(), SealKind::Delegated);

        let stored = strategy
            .reveal(&protected, RevealInput::Stored)
            .await
            .unwrap();
        assert_matches!(stored, RevealOutcome::Revealed { root_key, unseal_key: None } => {
            assert_eq!(root_key, root);
        });

        let with_recovery = strategy
            .reveal(
                &protected,
                RevealInput::Shares {
                    shares: &shares,
                    threshold: 3,
                },
            )
            .await
            .unwrap();
        assert_matches!(with_recovery, RevealOutcome::Revealed { unseal_key: Some(_), .. });

        service.shutdown();
        assert_matches!(
            strategy.reveal(&protected, RevealInput::Stored).await,
            Err(SealError::ServiceUnavailable { .. })
        );
    }

    #[tokio::test]
    async fn test_delegated_wrong_recovery_key() {
        let (_service, strategy) = delegated();
        let protected = strategy
            .protect(
                &RootKey::generate(&mut OsRng),
                &UnsealKey::generate(&mut OsRng),
            )
            .await
            .unwrap();
        let wrong = shamir::split(&UnsealKey::generate(&mut OsRng), 1, 1, &mut OsRng).unwrap();
        assert_matches!(
            strategy
                .reveal(
                    &protected,
                    RevealInput::Shares {
                        shares: &wrong,
                        threshold: 1
                    }
                )
                .await,
            Err(SealError::InvalidRequest { .. })
        );
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_consistency_violation() {
        let (_service, delegated) = delegated();
        let shamir_seal = SealStrategy::Shamir(ShamirParams::new(1, 1));
        let protected = shamir_seal
            .protect(
                &RootKey::generate(&mut OsRng),
                &UnsealKey::generate(&mut OsRng),
            )
            .await
            .unwrap();
        assert_matches!(
            delegated.reveal(&protected, RevealInput::Stored).await,
            Err(SealError::ConsistencyViolation { .. })
        );
    }

    #[tokio::test]
    async fn test_retiring_marks_only_shamir_records() {
        let (_service, delegated) = delegated();
        let shamir_seal = SealStrategy::Shamir(ShamirParams::new(3, 2));
        let root = RootKey::generate(&mut OsRng);
        let key = UnsealKey::generate(&mut OsRng);

        let shamir_record = shamir_seal.protect(&root, &key).await.unwrap();
        assert_eq!(shamir_record.retired(), None);
        let marked = shamir_record.retiring(&delegated);
        let SealStrategy::Delegated(seal) = &delegated else {
            unreachable!()
        };
        assert!(marked.retired().unwrap().matches(seal));

        // The mark does not get in the way of revealing with shares
        let shares = shamir::split(&key, 3, 2, &mut OsRng).unwrap();
        let outcome = shamir_seal
            .reveal(
                &marked,
                RevealInput::Shares {
                    shares: &shares[..2],
                    threshold: 2,
                },
            )
            .await
            .unwrap();
        assert_matches!(outcome, RevealOutcome::Revealed { .. });

        let delegated_record = delegated.protect(&root, &key).await.unwrap();
        assert_eq!(delegated_record.retiring(&shamir_seal).retired(), None);
    }

    #[test]
    fn test_distinct_shares() {
        let key = UnsealKey::generate(&mut OsRng);
        let shares = shamir::split(&key, 3, 2, &mut OsRng).unwrap();
        let repeated = vec![shares[0].clone(), shares[0].clone(), shares[1].clone()];
        assert_eq!(distinct_shares(&repeated).unwrap().len(), 2);

        let forged = KeyShare::new(shares[0].index(), [9u8; 32]).unwrap();
        assert!(distinct_shares(&[shares[0].clone(), forged]).is_err());
    }

    #[test]
    fn test_configs_for() {
        let shamir_seal = SealStrategy::Shamir(ShamirParams::new(5, 3));
        let configs = shamir_seal.configs_for(5, 3);
        assert_eq!(configs.barrier, BarrierConfig::shamir(5, 3));
        assert!(configs.recovery.is_none());

        let (_service, delegated) = delegated();
        let configs = delegated.configs_for(5, 3);
        assert_eq!(configs.barrier, BarrierConfig::delegated());
        assert_eq!(configs.recovery, Some(BarrierConfig::recovery(5, 3)));
    }
}
