//! Unified error type for seal and migration operations
//!
//! A single flat enum covers the whole seal protocol. Not having enough key
//! shares yet is deliberately absent: that is a progress response, not a
//! failure.

use serde::{Deserialize, Serialize};

/// Error type for all seal, unseal and migration operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum SealError {
    /// Missing or incorrect `migrate` flag, malformed share, bad configuration
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Error message describing the rejected request
        message: String,
    },

    /// The external key-wrapping service could not be reached
    #[error("Service unavailable: {message}")]
    ServiceUnavailable {
        /// Error message describing the unreachable endpoint
        message: String,
    },

    /// The external key-wrapping service rejected our credentials
    #[error("Authorization denied: {message}")]
    AuthDenied {
        /// Error message describing the rejection
        message: String,
    },

    /// A bounded wait exceeded its deadline
    #[error("Timeout after {waited_ms}ms: {message}")]
    Timeout {
        /// What was being waited for
        message: String,
        /// How long the wait lasted
        waited_ms: u64,
    },

    /// Persisted seal state does not match what the protocol expects
    #[error("Consistency violation: {message}")]
    ConsistencyViolation {
        /// Error message describing the mismatch
        message: String,
    },

    /// Storage backend failure
    #[error("Storage error: {message}")]
    Storage {
        /// Error message describing the storage failure
        message: String,
    },

    /// Encoding or decoding of persisted records failed
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },
}

impl SealError {
    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a service unavailable error
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// Create an authorization denied error
    pub fn auth_denied(message: impl Into<String>) -> Self {
        Self::AuthDenied {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>, waited_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            waited_ms,
        }
    }

    /// Create a consistency violation error
    pub fn consistency(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the same call may succeed later without operator action.
    ///
    /// Only an unreachable key-wrapping service qualifies; submitted shares
    /// are kept so the caller can simply retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

/// Standard Result type for seal operations
pub type SealResult<T> = std::result::Result<T, SealError>;

impl From<std::io::Error> for SealError {
    fn from(err: std::io::Error) -> Self {
        Self::storage(err.to_string())
    }
}

impl From<serde_json::Error> for SealError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<toml::de::Error> for SealError {
    fn from(err: toml::de::Error) -> Self {
        Self::invalid_request(format!("invalid configuration: {err}"))
    }
}
