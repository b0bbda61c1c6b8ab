//! Process-level error type for Cachegate
//!
//! Subsystems carry their own error enums (`CacheError`, `SnapshotError`,
//! `ForwardError`, `ServiceError`); this one covers startup and serving.

use thiserror::Error;

use crate::cache::CacheError;
use crate::snapshot::SnapshotError;

/// Errors raised while configuring or running the gateway
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Socket or filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure while building the cache engine
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Failure while opening the snapshot ledger
    #[error("Snapshot store error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// HTTP client construction failure
    #[error("HTTP error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
