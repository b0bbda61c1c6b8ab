//! Storage backends for the shared and durable tiers
//!
//! Every non-memory tier implements [`TierBackend`]. Backends return raw
//! entries (expired ones included); liveness decisions and corrupt-entry
//! cleanup belong to the engine.
//!
//! Backends are chosen by [`StorageKind`] through [`build_backend`]. Kinds
//! without an implementation fail at construction.

use async_trait::async_trait;
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::entry::CacheEntry;
use super::error::CacheError;
use super::file_tier::FileTier;
use super::redis_tier::{RedisConfig, RedisTier};
use super::stats::TierStats;

/// Storage implementations known to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Redis,
    File,
    Mongo,
    S3,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Redis => "redis",
            StorageKind::File => "file",
            StorageKind::Mongo => "mongo",
            StorageKind::S3 => "s3",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageKind::Redis),
            "file" | "local" => Ok(StorageKind::File),
            "mongo" | "mongodb" => Ok(StorageKind::Mongo),
            "s3" => Ok(StorageKind::S3),
            other => Err(format!("unknown storage kind '{}'", other)),
        }
    }
}

/// Settings consumed by the backend factory
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory for the file tier
    pub file_dir: PathBuf,
    /// Connection settings for the Redis tier
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            file_dir: PathBuf::from("./cache-data"),
            redis: RedisConfig::default(),
        }
    }
}

/// Storage adapter for one cache tier
#[async_trait]
pub trait TierBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Prepare the backend (create directories, open connections)
    async fn init(&self) -> Result<(), CacheError>;

    /// Release connections; later calls may reconnect
    async fn close(&self) -> Result<(), CacheError>;

    /// Cheap check consulted before every call
    fn is_available(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError>;

    /// Remove `key`; a missing key returns `Ok(false)`
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn delete_many(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// Every cache key stored by this backend
    async fn keys(&self) -> Result<Vec<String>, CacheError>;

    /// Remove expired entries, returning how many were removed
    async fn purge_expired(&self) -> Result<usize, CacheError>;

    /// Remove every entry owned by this backend
    async fn clear(&self) -> Result<usize, CacheError>;

    async fn stats(&self) -> TierStats;

    /// Keys matching a glob pattern
    async fn find(&self, pattern: &Pattern) -> Result<Vec<String>, CacheError> {
        Ok(self
            .keys()
            .await?
            .into_iter()
            .filter(|k| pattern.matches(k))
            .collect())
    }

    /// Every readable entry; corrupt entries are skipped
    async fn entries(&self) -> Result<Vec<(String, CacheEntry)>, CacheError> {
        let mut out = Vec::new();
        for key in self.keys().await? {
            match self.get(&key).await {
                Ok(Some(entry)) => out.push((key, entry)),
                Ok(None) => {}
                Err(e) if e.is_corrupt() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Construct the backend for `kind`. The result has not been initialized.
pub fn build_backend(
    kind: StorageKind,
    config: &StorageConfig,
) -> Result<Arc<dyn TierBackend>, CacheError> {
    match kind {
        StorageKind::File => Ok(Arc::new(FileTier::new(config.file_dir.clone()))),
        StorageKind::Redis => Ok(Arc::new(RedisTier::new(config.redis.clone())?)),
        StorageKind::Mongo | StorageKind::S3 => Err(CacheError::Unsupported(format!(
            "{} storage has no implementation in this build",
            kind
        ))),
    }
}

/// Construct and initialize the durable tier
pub async fn build_durable_tier(
    kind: StorageKind,
    config: &StorageConfig,
) -> Result<Arc<dyn TierBackend>, CacheError> {
    if kind == StorageKind::Redis {
        return Err(CacheError::Unsupported(
            "redis is the shared tier and cannot back durable storage".to_string(),
        ));
    }
    let backend = build_backend(kind, config)?;
    backend.init().await?;
    Ok(backend)
}
