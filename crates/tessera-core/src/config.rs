//! Configuration for seal initialisation and migration timing.
//!
//! Loaded from TOML, optionally overridden by `TESSERA_*` environment
//! variables, and validated before use. A process embedding the cluster
//! crates loads its settings like this:
//!
//! ```rust,no_run
//! # fn load() -> tessera_core::SealResult<tessera_core::TesseraConfig> {
//! use tessera_core::TesseraConfig;
//!
//! let mut config = TesseraConfig::load_from_file("tessera.toml".as_ref())?;
//! config.merge_with_env()?;
//! config.validate()?;
//! # Ok(config)
//! # }
//! ```
//!
//! Test clusters parse an inline TOML document with
//! [`TesseraConfig::from_toml_str`].

use crate::errors::{SealError, SealResult};
use crate::poll::PollPolicy;
use crate::types::MAX_SHARES;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "TESSERA_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseraConfig {
    /// Migration pacing and deadlines
    pub migration: MigrationSettings,
    /// Share-set shape used at initialisation
    pub seal: SealSettings,
}

/// Pacing of the rolling migration. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Interval between checks in every bounded wait
    pub poll_interval_ms: u64,
    /// Pause after each converted node before touching the next one
    pub settle_interval_ms: u64,
    /// Extra pause for replicated storage after the last node rejoins
    pub replicated_settle_interval_ms: u64,
    /// How long to wait for a new leader
    pub leader_timeout_ms: u64,
    /// How long to wait for the migration flag to clear on the leader
    pub migration_timeout_ms: u64,
    /// How long to wait for nodes to report unsealed
    pub unseal_timeout_ms: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            settle_interval_ms: 5_000,
            replicated_settle_interval_ms: 15_000,
            leader_timeout_ms: 60_000,
            migration_timeout_ms: 60_000,
            unseal_timeout_ms: 30_000,
        }
    }
}

impl MigrationSettings {
    /// Pause between converted nodes
    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    /// Pause after the last node rejoins replicated storage
    pub fn replicated_settle_interval(&self) -> Duration {
        Duration::from_millis(self.replicated_settle_interval_ms)
    }

    /// Wait policy for leader election
    pub fn leader_wait(&self) -> PollPolicy {
        self.policy(self.leader_timeout_ms)
    }

    /// Wait policy for the migration flag to clear
    pub fn migration_wait(&self) -> PollPolicy {
        self.policy(self.migration_timeout_ms)
    }

    /// Wait policy for nodes to unseal
    pub fn unseal_wait(&self) -> PollPolicy {
        self.policy(self.unseal_timeout_ms)
    }

    fn policy(&self, timeout_ms: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(timeout_ms),
        )
    }
}

/// Share-set shape for new barrier (Shamir) or recovery (delegated) keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SealSettings {
    /// Number of shares to hand out
    pub secret_shares: u32,
    /// Shares needed to reconstruct
    pub secret_threshold: u32,
}

impl Default for SealSettings {
    fn default() -> Self {
        Self {
            secret_shares: 3,
            secret_threshold: 3,
        }
    }
}

impl TesseraConfig {
    /// Parse from TOML text
    pub fn from_toml_str(content: &str) -> SealResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file
    pub fn load_from_file(path: &Path) -> SealResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SealError::invalid_request(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply overrides from the process environment
    pub fn merge_with_env(&mut self) -> SealResult<()> {
        self.merge_with_vars(std::env::vars())
    }

    /// Apply `TESSERA_<SECTION>_<FIELD>` overrides from the given pairs.
    ///
    /// Unknown `TESSERA_` keys are rejected so typos do not go unnoticed.
    pub fn merge_with_vars<I>(&mut self, vars: I) -> SealResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let name = name.to_ascii_lowercase();
            let slot = match name.as_str() {
                "migration_poll_interval_ms" => &mut self.migration.poll_interval_ms,
                "migration_settle_interval_ms" => &mut self.migration.settle_interval_ms,
                "migration_replicated_settle_interval_ms" => {
                    &mut self.migration.replicated_settle_interval_ms
                }
                "migration_leader_timeout_ms" => &mut self.migration.leader_timeout_ms,
                "migration_migration_timeout_ms" => &mut self.migration.migration_timeout_ms,
                "migration_unseal_timeout_ms" => &mut self.migration.unseal_timeout_ms,
                "seal_secret_shares" | "seal_secret_threshold" => {
                    let parsed = parse_number::<u32>(&key, &value)?;
                    if name == "seal_secret_shares" {
                        self.seal.secret_shares = parsed;
                    } else {
                        self.seal.secret_threshold = parsed;
                    }
                    continue;
                }
                _ => {
                    return Err(SealError::invalid_request(format!(
                        "unknown configuration override {key}"
                    )))
                }
            };
            *slot = parse_number::<u64>(&key, &value)?;
        }
        Ok(())
    }

    /// Reject settings the protocol cannot run with
    pub fn validate(&self) -> SealResult<()> {
        let m = &self.migration;
        for (name, interval) in [
            ("poll_interval_ms", m.poll_interval_ms),
            ("settle_interval_ms", m.settle_interval_ms),
            ("replicated_settle_interval_ms", m.replicated_settle_interval_ms),
        ] {
            if interval == 0 {
                return Err(SealError::invalid_request(format!(
                    "migration.{name} must be positive"
                )));
            }
        }
        for (name, timeout) in [
            ("leader_timeout_ms", m.leader_timeout_ms),
            ("migration_timeout_ms", m.migration_timeout_ms),
            ("unseal_timeout_ms", m.unseal_timeout_ms),
        ] {
            if timeout < m.poll_interval_ms {
                return Err(SealError::invalid_request(format!(
                    "migration.{name} ({timeout}) is shorter than the poll interval ({})",
                    m.poll_interval_ms
                )));
            }
        }

        let s = &self.seal;
        if s.secret_threshold == 0 || s.secret_threshold > s.secret_shares {
            return Err(SealError::invalid_request(format!(
                "seal.secret_threshold must be between 1 and {}",
                s.secret_shares
            )));
        }
        if s.secret_shares > MAX_SHARES {
            return Err(SealError::invalid_request(format!(
                "seal.secret_shares cannot exceed {MAX_SHARES}"
            )));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> SealResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SealError::invalid_request(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TesseraConfig::default();
        config.validate().unwrap();
        assert_eq!(config.migration.settle_interval(), Duration::from_secs(5));
        assert_eq!(config.migration.leader_wait().interval, Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TesseraConfig::from_toml_str(
            r#"
            [migration]
            settle_interval_ms = 250

            [seal]
            secret_shares = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.migration.settle_interval_ms, 250);
        assert_eq!(config.migration.poll_interval_ms, 1_000);
        assert_eq!(config.seal.secret_shares, 5);
        assert_eq!(config.seal.secret_threshold, 3);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[migration]\nleader_timeout_ms = 5000").unwrap();
        let config = TesseraConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.migration.leader_timeout_ms, 5_000);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TesseraConfig::default();
        config
            .merge_with_vars([
                ("TESSERA_MIGRATION_POLL_INTERVAL_MS".to_string(), "200".to_string()),
                ("TESSERA_SEAL_SECRET_THRESHOLD".to_string(), "2".to_string()),
                ("PATH".to_string(), "/usr/bin".to_string()),
            ])
            .unwrap();
        assert_eq!(config.migration.poll_interval_ms, 200);
        assert_eq!(config.seal.secret_threshold, 2);
    }

    #[test]
    fn test_unknown_override_rejected() {
        let mut config = TesseraConfig::default();
        let result =
            config.merge_with_vars([("TESSERA_MIGRATION_SPEED".to_string(), "1".to_string())]);
        assert!(matches!(result, Err(SealError::InvalidRequest { .. })));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TesseraConfig::default();
        config.migration.leader_timeout_ms = 10;
        assert!(config.validate().is_err());

        let mut config = TesseraConfig::default();
        config.seal.secret_threshold = 4;
        assert!(config.validate().is_err());

        let mut config = TesseraConfig::default();
        config.migration.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_settle_intervals_rejected() {
        let config = TesseraConfig::from_toml_str("[migration]\nsettle_interval_ms = 0").unwrap();
        assert_matches!(
            config.validate(),
            Err(SealError::InvalidRequest { message }) if message.contains("settle_interval_ms")
        );

        let mut config = TesseraConfig::default();
        config
            .merge_with_vars([(
                "TESSERA_MIGRATION_REPLICATED_SETTLE_INTERVAL_MS".to_string(),
                "0".to_string(),
            )])
            .unwrap();
        assert_matches!(
            config.validate(),
            Err(SealError::InvalidRequest { message })
                if message.contains("replicated_settle_interval_ms")
        );
    }
}
