//! Tiered cache engine
//!
//! Reads walk Memory → Redis → File and promote hits upward. Writes go to
//! every enabled tier, each one fault-isolated: a Redis or disk failure is
//! logged and never rolls back or blocks the other tiers.
//!
//! Tier errors never reach callers of `get`. A failing tier is a miss.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join;
use glob::Pattern;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::{build_durable_tier, StorageConfig, StorageKind, TierBackend};
use super::entry::{storable_headers, CacheEntry, Headers, Payload};
use super::error::CacheError;
use super::freeze::FreezeController;
use super::keys::{KeyCodec, KeyConfig};
use super::memory::{EvictionPolicy, MemoryTier};
use super::redis_tier::{RedisConfig, RedisTier};
use super::rules::{CacheRule, RuleDecision, RuleDefaults, RuleEngine};
use super::stats::TierStats;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub memory_max_entries: usize,
    pub eviction_policy: EvictionPolicy,
    pub default_ttl_seconds: u64,
    pub cacheable_methods: Vec<String>,
    pub rules: Vec<CacheRule>,
    pub keys: KeyConfig,
    /// Shared tier; `None` disables it
    pub redis: Option<RedisConfig>,
    /// Durable tier; `None` disables it
    pub durable: Option<StorageKind>,
    pub file_dir: PathBuf,
    /// Keys removed per memory-lock acquisition during cleanup
    pub cleanup_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let defaults = RuleDefaults::default();
        Self {
            memory_max_entries: 1000,
            eviction_policy: EvictionPolicy::Lru,
            default_ttl_seconds: defaults.default_ttl_seconds,
            cacheable_methods: defaults.cacheable_methods,
            rules: Vec::new(),
            keys: KeyConfig::default(),
            redis: None,
            durable: Some(StorageKind::File),
            file_dir: PathBuf::from("./cache-data"),
            cleanup_batch_size: 256,
        }
    }
}

/// Request shape the engine keys and evaluates rules against
#[derive(Debug, Clone, Default)]
pub struct CacheRequest {
    pub method: String,
    /// Path and query (or absolute URL) of the request target
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl CacheRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// Tier that served a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Memory,
    Redis,
    File,
}

impl CacheSource {
    /// Value used in the `X-Cache` header
    pub fn header_value(&self) -> &'static str {
        match self {
            CacheSource::Memory => "HIT-MEMORY",
            CacheSource::Redis => "HIT-REDIS",
            CacheSource::File => "HIT-FILE",
        }
    }
}

/// Successful lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub key: String,
    pub entry: CacheEntry,
    pub source: CacheSource,
}

/// Why a response was not stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyRejection {
    NotCacheable,
    SizeOutOfBounds,
    ZeroTtl,
    Frozen,
}

/// Result of `set`. Rejections are policy outcomes, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Stored {
        key: String,
        ttl_seconds: u64,
        evicted: usize,
    },
    Rejected(PolicyRejection),
}

impl SetOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, SetOutcome::Stored { .. })
    }
}

/// Per-tier write results for one entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub evicted: usize,
    pub redis_written: bool,
    pub durable_written: bool,
}

/// Per-tier removal counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeleteReport {
    pub memory: usize,
    pub redis: usize,
    pub file: usize,
    /// Distinct keys removed from at least one tier
    pub keys: usize,
}

impl DeleteReport {
    pub fn total(&self) -> usize {
        self.memory + self.redis + self.file
    }
}

/// Engine-level counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub memory: TierStats,
    pub redis: TierStats,
    pub file: TierStats,
    pub hits: u64,
    pub misses: u64,
    /// Requests the rules sent straight to the origin
    pub bypassed: u64,
    pub hit_rate: f64,
    pub memory_hits: u64,
    pub redis_hits: u64,
    pub file_hits: u64,
    pub eviction_policy: EvictionPolicy,
}

#[derive(Debug, Default)]
struct EngineCounters {
    memory_hits: AtomicU64,
    redis_hits: AtomicU64,
    file_hits: AtomicU64,
    misses: AtomicU64,
    bypassed: AtomicU64,
}

impl EngineCounters {
    fn record_hit(&self, source: CacheSource) {
        let counter = match source {
            CacheSource::Memory => &self.memory_hits,
            CacheSource::Redis => &self.redis_hits,
            CacheSource::File => &self.file_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Coordinates key derivation, rules and the three tiers
pub struct CacheEngine {
    keys: KeyCodec,
    rules: RuleEngine,
    memory: MemoryTier,
    redis: Option<Arc<dyn TierBackend>>,
    durable: Option<Arc<dyn TierBackend>>,
    freeze: Arc<FreezeController>,
    counters: EngineCounters,
    cleanup_batch_size: usize,
}

impl CacheEngine {
    /// Build the engine and its configured tiers.
    ///
    /// An unreachable Redis is not fatal: the tier starts unavailable and
    /// reconnects after its grace period. An unsupported durable backend is.
    pub async fn build(config: CacheConfig, freeze: Arc<FreezeController>) -> Result<Self, CacheError> {
        let redis: Option<Arc<dyn TierBackend>> = match &config.redis {
            Some(redis_config) => {
                let tier = RedisTier::new(redis_config.clone())?;
                if let Err(e) = tier.init().await {
                    warn!(error = %e, "Redis tier not reachable at startup");
                }
                Some(Arc::new(tier))
            }
            None => None,
        };

        let durable = match config.durable {
            Some(kind) => {
                let storage = StorageConfig {
                    file_dir: config.file_dir.clone(),
                    redis: config.redis.clone().unwrap_or_default(),
                };
                Some(build_durable_tier(kind, &storage).await?)
            }
            None => None,
        };

        Self::with_tiers(config, freeze, redis, durable)
    }

    /// Assemble an engine around already-initialized backends
    pub fn with_tiers(
        config: CacheConfig,
        freeze: Arc<FreezeController>,
        redis: Option<Arc<dyn TierBackend>>,
        durable: Option<Arc<dyn TierBackend>>,
    ) -> Result<Self, CacheError> {
        let defaults = RuleDefaults {
            default_ttl_seconds: config.default_ttl_seconds,
            cacheable_methods: config.cacheable_methods.clone(),
        };
        let rules = RuleEngine::new(config.rules, defaults)?;

        Ok(Self {
            keys: KeyCodec::new(config.keys),
            rules,
            memory: MemoryTier::new(config.memory_max_entries, config.eviction_policy),
            redis,
            durable,
            freeze,
            counters: EngineCounters::default(),
            cleanup_batch_size: config.cleanup_batch_size.max(1),
        })
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn freeze(&self) -> &Arc<FreezeController> {
        &self.freeze
    }

    pub fn has_redis(&self) -> bool {
        self.redis.is_some()
    }

    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Redis configured and outside its failure grace period
    pub fn redis_available(&self) -> bool {
        self.available(&self.redis).is_some()
    }

    pub fn key_for(&self, request: &CacheRequest) -> String {
        self.keys.generate_key(
            &request.method,
            &request.url,
            &request.headers,
            request.body.as_deref(),
        )
    }

    /// Rule evaluation for the read path (no response status yet)
    pub fn evaluate(&self, request: &CacheRequest, status: Option<u16>) -> RuleDecision {
        self.rules
            .evaluate(&request.method, &request.url, &request.headers, status)
    }

    /// Look up a request. Non-cacheable requests return `None` without
    /// touching any tier.
    pub async fn get(&self, request: &CacheRequest) -> Option<CacheHit> {
        if !self.evaluate(request, None).cacheable {
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let key = self.key_for(request);
        self.get_by_key(&key).await
    }

    /// Look up a key across tiers, promoting lower-tier hits
    pub async fn get_by_key(&self, key: &str) -> Option<CacheHit> {
        if let Some(entry) = self.memory.get(key) {
            return Some(self.hit(key, entry, CacheSource::Memory));
        }

        if let Some(redis) = self.available(&self.redis) {
            if let Some(entry) = self.read_tier(redis, key).await {
                let entry = touched(entry);
                self.memory.insert(key, entry.clone());
                return Some(self.hit(key, entry, CacheSource::Redis));
            }
        }

        if let Some(durable) = self.available(&self.durable) {
            if let Some(entry) = self.read_tier(durable, key).await {
                let entry = touched(entry);
                self.memory.insert(key, entry.clone());
                self.promote_to_redis(key, &entry);
                return Some(self.hit(key, entry, CacheSource::File));
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    fn hit(&self, key: &str, entry: CacheEntry, source: CacheSource) -> CacheHit {
        self.counters.record_hit(source);
        debug!(key = %key, source = ?source, "Cache hit");
        CacheHit {
            key: key.to_string(),
            entry,
            source,
        }
    }

    fn available<'a>(&self, tier: &'a Option<Arc<dyn TierBackend>>) -> Option<&'a Arc<dyn TierBackend>> {
        tier.as_ref().filter(|t| t.is_available())
    }

    /// Live entry from one backend. Expired and corrupt entries are deleted;
    /// every failure reads as a miss.
    async fn read_tier(&self, tier: &Arc<dyn TierBackend>, key: &str) -> Option<CacheEntry> {
        match tier.get(key).await {
            Ok(Some(entry)) if !entry.is_expired() => Some(entry),
            Ok(Some(_)) => {
                if let Err(e) = tier.delete(key).await {
                    debug!(key = %key, tier = %tier.kind(), error = %e, "Failed to drop expired entry");
                }
                None
            }
            Ok(None) => None,
            Err(e) if e.is_corrupt() => {
                warn!(key = %key, tier = %tier.kind(), error = %e, "Dropping corrupt cache entry");
                if let Err(e) = tier.delete(key).await {
                    debug!(key = %key, tier = %tier.kind(), error = %e, "Failed to drop corrupt entry");
                }
                None
            }
            Err(e) => {
                debug!(key = %key, tier = %tier.kind(), error = %e, "Tier read failed, falling through");
                None
            }
        }
    }

    fn promote_to_redis(&self, key: &str, entry: &CacheEntry) {
        let Some(redis) = self.available(&self.redis) else {
            return;
        };
        let redis = Arc::clone(redis);
        let key = key.to_string();
        let entry = entry.clone();
        tokio::spawn(async move {
            if let Err(e) = redis.put(&key, &entry).await {
                debug!(key = %key, error = %e, "Redis promotion failed");
            }
        });
    }

    /// Live entry without promotion or statistics
    pub async fn peek(&self, key: &str) -> Option<(CacheEntry, CacheSource)> {
        if let Some(entry) = self.memory.peek(key) {
            return Some((entry, CacheSource::Memory));
        }
        if let Some(redis) = self.available(&self.redis) {
            if let Ok(Some(entry)) = redis.get(key).await {
                if !entry.is_expired() {
                    return Some((entry, CacheSource::Redis));
                }
            }
        }
        if let Some(durable) = self.available(&self.durable) {
            if let Ok(Some(entry)) = durable.get(key).await {
                if !entry.is_expired() {
                    return Some((entry, CacheSource::File));
                }
            }
        }
        None
    }

    /// Store a response for `request`.
    ///
    /// Cacheability, size bounds and TTL come from the rules evaluated with
    /// the response status. A frozen URL keeps its existing live entry.
    pub async fn set(
        &self,
        request: &CacheRequest,
        status: u16,
        headers: &Headers,
        payload: impl Into<Payload>,
    ) -> SetOutcome {
        let payload = payload.into();
        let decision = self.evaluate(request, Some(status));
        if !decision.cacheable {
            return SetOutcome::Rejected(PolicyRejection::NotCacheable);
        }
        if !decision.allows_size(payload.size()) {
            debug!(url = %request.url, "Response outside rule size bounds, not cached");
            return SetOutcome::Rejected(PolicyRejection::SizeOutOfBounds);
        }
        if decision.ttl_seconds == 0 {
            return SetOutcome::Rejected(PolicyRejection::ZeroTtl);
        }

        let key = self.key_for(request);
        if self.freeze.is_frozen(&request.url) && self.peek(&key).await.is_some() {
            debug!(key = %key, "URL frozen, keeping existing entry");
            return SetOutcome::Rejected(PolicyRejection::Frozen);
        }

        let entry =
            CacheEntry::from_payload(payload, storable_headers(headers), status, decision.ttl_seconds);
        let report = self.store_entry(&key, entry).await;
        SetOutcome::Stored {
            key,
            ttl_seconds: decision.ttl_seconds,
            evicted: report.evicted,
        }
    }

    /// Write an entry to every enabled tier under an explicit key
    pub async fn store_entry(&self, key: &str, entry: CacheEntry) -> WriteReport {
        let evicted = self.memory.insert(key, entry.clone());

        let redis_write = async {
            match self.available(&self.redis) {
                Some(redis) => match redis.put(key, &entry).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(key = %key, error = %e, "Redis write skipped");
                        false
                    }
                },
                None => false,
            }
        };
        let durable_write = async {
            match &self.durable {
                Some(durable) => match durable.put(key, &entry).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Durable tier write failed");
                        false
                    }
                },
                None => false,
            }
        };
        let (redis_written, durable_written) = join(redis_write, durable_write).await;

        WriteReport {
            evicted,
            redis_written,
            durable_written,
        }
    }

    /// Remove a key from every tier. Missing keys are not an error.
    pub async fn delete(&self, key: &str) -> DeleteReport {
        self.delete_keys(&[key.to_string()]).await
    }

    /// Remove the given keys from every tier
    pub async fn invalidate_keys(&self, keys: &[String]) -> DeleteReport {
        self.delete_keys(keys).await
    }

    async fn delete_keys(&self, keys: &[String]) -> DeleteReport {
        let mut report = DeleteReport::default();
        let mut touched: HashSet<&str> = HashSet::new();

        for key in keys {
            if self.memory.remove(key) {
                report.memory += 1;
                touched.insert(key.as_str());
            }
        }

        if let Some(redis) = self.available(&self.redis) {
            report.redis = delete_from(redis, keys).await;
        }
        if let Some(durable) = &self.durable {
            for key in keys {
                match durable.delete(key).await {
                    Ok(true) => {
                        report.file += 1;
                        touched.insert(key.as_str());
                    }
                    Ok(false) => {}
                    Err(e) => warn!(key = %key, error = %e, "Durable tier delete failed"),
                }
            }
        }

        // Redis reports a count, not which keys it held
        report.keys = touched.len().max(report.redis);
        report
    }

    /// Remove every entry from every tier
    pub async fn clear(&self) -> DeleteReport {
        let mut report = DeleteReport {
            memory: self.memory.clear(),
            ..Default::default()
        };
        if let Some(redis) = self.available(&self.redis) {
            report.redis = redis.clear().await.unwrap_or_else(|e| {
                warn!(error = %e, "Redis clear failed");
                0
            });
        }
        if let Some(durable) = &self.durable {
            report.file = durable.clear().await.unwrap_or_else(|e| {
                warn!(error = %e, "Durable tier clear failed");
                0
            });
        }
        report.keys = report.memory.max(report.redis).max(report.file);
        info!(memory = report.memory, redis = report.redis, file = report.file, "Cache cleared");
        report
    }

    /// Purge expired entries from every tier. The memory tier is swept in
    /// batches, yielding between batches so request handlers are not starved.
    pub async fn cleanup_expired(&self) -> DeleteReport {
        let mut report = DeleteReport::default();

        let expired = self.memory.expired_keys(Utc::now());
        for batch in expired.chunks(self.cleanup_batch_size) {
            report.memory += self.memory.remove_expired_batch(batch);
            tokio::task::yield_now().await;
        }

        if let Some(redis) = self.available(&self.redis) {
            report.redis = redis.purge_expired().await.unwrap_or_else(|e| {
                debug!(error = %e, "Redis purge skipped");
                0
            });
        }
        if let Some(durable) = &self.durable {
            report.file = durable.purge_expired().await.unwrap_or_else(|e| {
                warn!(error = %e, "Durable tier purge failed");
                0
            });
        }
        report.keys = report.memory.max(report.redis).max(report.file);
        report
    }

    /// Delete every entry whose key matches a glob pattern
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<DeleteReport, CacheError> {
        let compiled =
            Pattern::new(pattern).map_err(|e| CacheError::InvalidPattern(format!("{}: {}", pattern, e)))?;

        let mut keys: HashSet<String> = self
            .memory
            .remove_where(|key, _| compiled.matches(key))
            .into_iter()
            .collect();
        let memory = keys.len();

        let redis_keys = self.find_in(&self.redis, &compiled).await;
        let durable_keys = self.find_in(&self.durable, &compiled).await;
        keys.extend(redis_keys.iter().cloned());
        keys.extend(durable_keys.iter().cloned());

        let report = DeleteReport {
            memory,
            redis: self.delete_in(&self.redis, &redis_keys).await,
            file: self.delete_in(&self.durable, &durable_keys).await,
            keys: keys.len(),
        };
        info!(pattern = %pattern, invalidated = report.keys, "Invalidated cache entries by pattern");
        Ok(report)
    }

    /// Delete every entry created more than `age_seconds` ago
    pub async fn invalidate_older_than(&self, age_seconds: u64) -> DeleteReport {
        let cutoff = Utc::now() - ChronoDuration::seconds(age_seconds.min(i64::MAX as u64) as i64);
        let older = |entry: &CacheEntry| entry.created_at < cutoff;

        let mut keys: HashSet<String> = self
            .memory
            .remove_where(|_, entry| older(entry))
            .into_iter()
            .collect();
        let memory = keys.len();

        let redis_keys = self.entries_in(&self.redis, older).await;
        let durable_keys = self.entries_in(&self.durable, older).await;
        keys.extend(redis_keys.iter().cloned());
        keys.extend(durable_keys.iter().cloned());

        let report = DeleteReport {
            memory,
            redis: self.delete_in(&self.redis, &redis_keys).await,
            file: self.delete_in(&self.durable, &durable_keys).await,
            keys: keys.len(),
        };
        info!(age_seconds = age_seconds, invalidated = report.keys, "Invalidated cache entries by age");
        report
    }

    async fn find_in(&self, tier: &Option<Arc<dyn TierBackend>>, pattern: &Pattern) -> Vec<String> {
        let Some(tier) = self.available(tier) else {
            return Vec::new();
        };
        tier.find(pattern).await.unwrap_or_else(|e| {
            warn!(tier = %tier.kind(), error = %e, "Key scan failed");
            Vec::new()
        })
    }

    async fn entries_in<F>(&self, tier: &Option<Arc<dyn TierBackend>>, predicate: F) -> Vec<String>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let Some(tier) = self.available(tier) else {
            return Vec::new();
        };
        match tier.entries().await {
            Ok(entries) => entries
                .into_iter()
                .filter(|(_, entry)| predicate(entry))
                .map(|(key, _)| key)
                .collect(),
            Err(e) => {
                warn!(tier = %tier.kind(), error = %e, "Entry scan failed");
                Vec::new()
            }
        }
    }

    async fn delete_in(&self, tier: &Option<Arc<dyn TierBackend>>, keys: &[String]) -> usize {
        match self.available(tier) {
            Some(tier) if !keys.is_empty() => delete_from(tier, keys).await,
            _ => 0,
        }
    }

    /// Rewrite an entry so it expires at `expires_at`. Returns whether an
    /// entry existed. A target in the past removes the entry.
    pub async fn retime(&self, key: &str, expires_at: DateTime<Utc>) -> bool {
        let Some((mut entry, _)) = self.peek(key).await else {
            return false;
        };
        if expires_at <= Utc::now() {
            self.delete(key).await;
            return true;
        }
        entry.ttl_seconds = entry.ttl_reaching(expires_at);
        self.store_entry(key, entry).await;
        true
    }

    /// Load live durable entries into memory, newest first
    pub async fn warm_up(&self, limit: usize) -> usize {
        let Some(durable) = &self.durable else {
            return 0;
        };
        let mut entries = match durable.entries().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cache warmup skipped");
                return 0;
            }
        };
        entries.retain(|(_, entry)| !entry.is_expired());
        entries.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));

        let budget = limit.min(self.memory.max_entries());
        let mut loaded = 0;
        for (key, entry) in entries.into_iter().take(budget) {
            self.memory.insert(&key, entry);
            loaded += 1;
        }
        info!(loaded = loaded, "Cache warmup complete");
        loaded
    }

    pub async fn stats(&self) -> EngineStats {
        let redis = match &self.redis {
            Some(tier) => tier.stats().await,
            None => TierStats::disabled("redis"),
        };
        let file = match &self.durable {
            Some(tier) => tier.stats().await,
            None => TierStats::disabled("file"),
        };

        let memory_hits = self.counters.memory_hits.load(Ordering::Relaxed);
        let redis_hits = self.counters.redis_hits.load(Ordering::Relaxed);
        let file_hits = self.counters.file_hits.load(Ordering::Relaxed);
        let hits = memory_hits + redis_hits + file_hits;
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            (hits as f64 / (hits + misses) as f64) * 100.0
        };

        EngineStats {
            memory: self.memory.stats(),
            redis,
            file,
            hits,
            misses,
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
            hit_rate,
            memory_hits,
            redis_hits,
            file_hits,
            eviction_policy: self.memory.policy(),
        }
    }

    /// Close backend connections
    pub async fn shutdown(&self) {
        for tier in [&self.redis, &self.durable].into_iter().flatten() {
            if let Err(e) = tier.close().await {
                debug!(tier = %tier.kind(), error = %e, "Tier close failed");
            }
        }
    }
}

/// Copy with one more access recorded
fn touched(mut entry: CacheEntry) -> CacheEntry {
    entry.access_count += 1;
    entry.last_accessed_at = Utc::now();
    entry
}

async fn delete_from(tier: &Arc<dyn TierBackend>, keys: &[String]) -> usize {
    tier.delete_many(keys).await.unwrap_or_else(|e| {
        warn!(tier = %tier.kind(), error = %e, "Batch delete failed");
        0
    })
}
