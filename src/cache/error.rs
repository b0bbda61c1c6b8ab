//! Cache error taxonomy
//!
//! Tier failures are values, not panics. The engine matches on these to decide
//! whether to degrade to the next tier or surface the error to an admin caller.

use thiserror::Error;

/// Error types for cache tiers and the engine
#[derive(Debug, Error)]
pub enum CacheError {
    /// Tier is unreachable or inside its post-failure grace period
    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: &'static str, reason: String },

    /// Tier call exceeded its deadline
    #[error("{tier} tier timed out after {millis}ms")]
    Timeout { tier: &'static str, millis: u64 },

    /// Stored payload failed to parse or failed structural validation
    #[error("Corrupt entry for key {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// Entry could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem failure in the durable tier
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Redis command failure
    #[error("Redis error: {0}")]
    Redis(String),

    /// Storage backend exists in configuration but has no implementation
    #[error("Storage backend not supported: {0}")]
    Unsupported(String),

    /// Cache rule could not be compiled
    #[error("Invalid cache rule '{pattern}': {reason}")]
    InvalidRule { pattern: String, reason: String },

    /// Invalidation pattern could not be compiled
    #[error("Invalid pattern '{0}'")]
    InvalidPattern(String),
}

impl CacheError {
    /// Whether the engine should fall through to the next tier instead of
    /// reporting the failure.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            CacheError::TierUnavailable { .. }
                | CacheError::Timeout { .. }
                | CacheError::CorruptEntry { .. }
                | CacheError::Redis(_)
                | CacheError::Io(_)
                | CacheError::Serialization(_)
        )
    }

    /// Whether the offending entry should be deleted from its tier
    pub fn is_corrupt(&self) -> bool {
        matches!(self, CacheError::CorruptEntry { .. })
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Redis(err.to_string())
    }
}
