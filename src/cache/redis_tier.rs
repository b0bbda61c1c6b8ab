//! Shared Redis tier
//!
//! Best-effort: every call is bounded by a timeout, and a failed connect or
//! command opens a circuit for `retry_after`. While the circuit is open calls
//! return `TierUnavailable` without touching the network, and the engine
//! falls through to the next tier.
//!
//! Values are serialized `CacheEntry` JSON stored under `<prefix><key>` with
//! a native expiry equal to the entry's remaining lifetime.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::backend::{StorageKind, TierBackend};
use super::entry::CacheEntry;
use super::error::CacheError;
use super::stats::{TierCounters, TierStats};

const TIER: &str = "redis";
const SCAN_COUNT: usize = 200;
const DELETE_CHUNK: usize = 500;

const STATE_UNKNOWN: u8 = 0;
const STATE_UP: u8 = 1;
const STATE_DOWN: u8 = 2;

/// Redis connection settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// Prepended to every cache key
    pub key_prefix: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// How long the tier stays unavailable after a failure
    pub retry_after: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "cachegate:".to_string(),
            connect_timeout: Duration::from_millis(1000),
            command_timeout: Duration::from_millis(500),
            retry_after: Duration::from_secs(30),
        }
    }
}

/// Escape glob metacharacters for a Redis `MATCH` argument
fn escape_match(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Errors that mean the server or the link is gone, not that one command was bad
fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout()
}

pub struct RedisTier {
    client: redis::Client,
    config: RedisConfig,
    conn: RwLock<Option<ConnectionManager>>,
    state: AtomicU8,
    retry_at: Mutex<Option<Instant>>,
    counters: TierCounters,
}

impl RedisTier {
    /// Validate the URL. No network traffic happens until `init` or first use.
    pub fn new(config: RedisConfig) -> Result<Self, CacheError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            CacheError::TierUnavailable {
                tier: TIER,
                reason: format!("invalid redis url: {}", e),
            }
        })?;
        Ok(Self {
            client,
            config,
            conn: RwLock::new(None),
            state: AtomicU8::new(STATE_UNKNOWN),
            retry_at: Mutex::new(None),
            counters: TierCounters::default(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.state.load(Ordering::Relaxed) == STATE_UP
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn in_grace_period(&self) -> bool {
        let guard = self.retry_at.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*guard, Some(until) if Instant::now() < until)
    }

    fn mark_up(&self) {
        *self.retry_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if self.state.swap(STATE_UP, Ordering::Relaxed) != STATE_UP {
            info!(url = %self.config.url, "Redis tier connected");
        }
    }

    fn mark_down(&self, reason: &str) {
        *self.conn.write().unwrap_or_else(|e| e.into_inner()) = None;
        *self.retry_at.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(Instant::now() + self.config.retry_after);
        self.counters.record_error();
        if self.state.swap(STATE_DOWN, Ordering::Relaxed) != STATE_DOWN {
            warn!(
                url = %self.config.url,
                reason = %reason,
                retry_after_secs = self.config.retry_after.as_secs(),
                "Redis tier unavailable, degrading to remaining tiers"
            );
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        if self.in_grace_period() {
            return Err(CacheError::TierUnavailable {
                tier: TIER,
                reason: "waiting for retry window".to_string(),
            });
        }

        let existing = self.conn.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        match timeout(self.config.connect_timeout, self.client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                *self.conn.write().unwrap_or_else(|e| e.into_inner()) = Some(conn.clone());
                self.mark_up();
                Ok(conn)
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                self.mark_down(&reason);
                Err(CacheError::TierUnavailable { tier: TIER, reason })
            }
            Err(_) => {
                self.mark_down("connect timeout");
                Err(CacheError::Timeout {
                    tier: TIER,
                    millis: self.config.connect_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Run one command against a bounded deadline, tripping the circuit on
    /// connection-level failures.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, CacheError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, RedisError>>,
    {
        let conn = self.connection().await?;
        match timeout(self.config.command_timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if is_connection_error(&e) {
                    self.mark_down(&e.to_string());
                } else {
                    self.counters.record_error();
                }
                Err(e.into())
            }
            Err(_) => {
                self.mark_down("command timeout");
                Err(CacheError::Timeout {
                    tier: TIER,
                    millis: self.config.command_timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn scan_prefixed(&self) -> Result<Vec<String>, CacheError> {
        let pattern = format!("{}*", escape_match(&self.config.key_prefix));
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let pattern = pattern.clone();
            let (next, batch): (u64, Vec<String>) = self
                .run(move |mut conn| async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_COUNT)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn delete_prefixed(&self, prefixed: Vec<String>) -> Result<usize, CacheError> {
        let mut removed = 0;
        for chunk in prefixed.chunks(DELETE_CHUNK) {
            let chunk = chunk.to_vec();
            let n: usize = self.run(move |mut conn| async move { conn.del(chunk).await }).await?;
            removed += n;
        }
        Ok(removed)
    }
}

#[async_trait]
impl TierBackend for RedisTier {
    fn kind(&self) -> StorageKind {
        StorageKind::Redis
    }

    async fn init(&self) -> Result<(), CacheError> {
        let _: String = self
            .run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CacheError> {
        *self.conn.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.state.store(STATE_UNKNOWN, Ordering::Relaxed);
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.in_grace_period()
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let redis_key = self.prefixed(key);
        let raw: Option<String> = self
            .run(move |mut conn| async move { conn.get(redis_key).await })
            .await?;

        let Some(raw) = raw else {
            self.counters.record_miss();
            return Ok(None);
        };

        let entry: CacheEntry =
            serde_json::from_str(&raw).map_err(|e| CacheError::CorruptEntry {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        entry.validate().map_err(|reason| CacheError::CorruptEntry {
            key: key.to_string(),
            reason,
        })?;

        self.counters.record_hit();
        Ok(Some(entry))
    }

    async fn put(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let ttl = entry.store_ttl_at(Utc::now());
        if ttl == 0 {
            debug!(key = %key, "Skipping Redis write for entry with no remaining lifetime");
            return Ok(());
        }
        let payload = serde_json::to_string(entry)?;
        let redis_key = self.prefixed(key);
        let _: () = self
            .run(move |mut conn| async move { conn.set_ex(redis_key, payload, ttl).await })
            .await?;
        self.counters.record_write();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let redis_key = self.prefixed(key);
        let n: usize = self
            .run(move |mut conn| async move { conn.del(redis_key).await })
            .await?;
        Ok(n > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let prefixed = keys.iter().map(|k| self.prefixed(k)).collect();
        self.delete_prefixed(prefixed).await
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        let prefix_len = self.config.key_prefix.len();
        Ok(self
            .scan_prefixed()
            .await?
            .into_iter()
            .filter_map(|k| k.get(prefix_len..).map(str::to_string))
            .collect())
    }

    /// Redis expires keys natively
    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    /// Removes only keys under this tier's prefix
    async fn clear(&self) -> Result<usize, CacheError> {
        let keys = self.scan_prefixed().await?;
        self.delete_prefixed(keys).await
    }

    async fn stats(&self) -> TierStats {
        let item_count = if self.is_available() {
            self.scan_prefixed().await.map(|k| k.len()).unwrap_or(0)
        } else {
            0
        };
        let mut stats = TierStats {
            tier: TIER,
            enabled: true,
            connected: self.is_connected(),
            item_count,
            ..Default::default()
        };
        self.counters.fill(&mut stats);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Nothing listens on port 1, so connects fail fast
    fn unreachable() -> RedisTier {
        RedisTier::new(RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connect_timeout: Duration::from_millis(300),
            retry_after: Duration::from_secs(60),
            ..RedisConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_escape_match() {
        assert_eq!(escape_match("cache:"), "cache:");
        assert_eq!(escape_match("a*b?[c]"), "a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let result = RedisTier::new(RedisConfig {
            url: "not a url".to_string(),
            ..RedisConfig::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_opens_circuit() {
        let tier = unreachable();
        assert!(tier.is_available());

        let first = tier.get("GET::/x").await.unwrap_err();
        assert!(first.is_degradable());
        assert!(!tier.is_available());
        assert!(!tier.is_connected());

        // Short-circuits without another connect attempt
        let started = Instant::now();
        let second = tier.get("GET::/x").await.unwrap_err();
        assert!(matches!(second, CacheError::TierUnavailable { .. }));
        assert!(started.elapsed() < Duration::from_millis(50));

        let stats = tier.stats().await;
        assert!(!stats.connected);
        assert_eq!(stats.item_count, 0);
    }
}
