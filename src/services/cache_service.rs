//! Cache administration and proxy-side cache flow
//!
//! `CacheService` ties the engine, the snapshot ledger, the freeze switch and
//! the origin forwarder together. The engine knows nothing about metadata;
//! every operation that must keep tiers and ledger in step lives here.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::entry::{storable_headers, Payload};
use crate::cache::{
    CacheEngine, CacheEntry, CacheError, CacheHit, CacheRequest, CacheSource, DeleteReport,
    EngineStats, FreezeController, FreezeState, Headers, PolicyRejection, SetOutcome,
};
use crate::proxy::{ForwardError, ForwardRequest, ForwardResponse, Forwarder};
use crate::snapshot::{
    RecordInput, SnapshotError, SnapshotFilter, SnapshotMetadata, SnapshotPage, SnapshotStats,
    SnapshotStore, SnapshotUpdate,
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Snapshot store error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Cache error: {0}")]
    Cache(String),
}

impl ServiceError {
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::NotFound(_) => 404,
            ServiceError::Unavailable(_) => 503,
            ServiceError::BadRequest(_) => 400,
            ServiceError::Upstream(_) => 502,
            ServiceError::Snapshot(_) | ServiceError::Cache(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Unavailable(_) => "UNAVAILABLE",
            ServiceError::BadRequest(_) => "BAD_REQUEST",
            ServiceError::Upstream(_) => "UPSTREAM_ERROR",
            ServiceError::Snapshot(_) => "SNAPSHOT_ERROR",
            ServiceError::Cache(_) => "CACHE_ERROR",
        }
    }
}

impl From<ForwardError> for ServiceError {
    fn from(e: ForwardError) -> Self {
        ServiceError::Upstream(e.to_string())
    }
}

impl From<CacheError> for ServiceError {
    fn from(e: CacheError) -> Self {
        match e {
            e @ (CacheError::InvalidPattern(_) | CacheError::InvalidRule { .. }) => {
                ServiceError::BadRequest(e.to_string())
            }
            other => ServiceError::Cache(other.to_string()),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// `GET /entries` result
#[derive(Debug, Serialize)]
pub struct EntryList {
    #[serde(flatten)]
    pub page: SnapshotPage,
    pub stats: SnapshotStats,
}

/// `GET /entries/{key}` result
#[derive(Debug, Serialize)]
pub struct EntryDetail {
    pub cache_key: String,
    pub metadata: Option<SnapshotMetadata>,
    pub payload: Option<Value>,
    pub headers: Option<Headers>,
    pub source: Option<CacheSource>,
    pub is_expired: bool,
    /// Seconds until expiry, zero once expired
    pub time_remaining: u64,
    pub size_bytes: u64,
}

/// Refresh request options
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefreshOptions {
    #[serde(default)]
    pub force: bool,
    pub ttl_override: Option<u64>,
    pub tags: Option<Vec<String>>,
}

/// Result of a refresh. Refusals are outcomes, not errors.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// The URL is frozen; nothing was fetched or written
    Frozen { cache_key: String, url: String },
    /// Entry is live and `force` was not set
    StillValid { cache_key: String, time_remaining: u64 },
    /// Another refresh of the same key is running
    InProgress { cache_key: String },
    Refreshed {
        cache_key: String,
        status_code: u16,
        ttl_seconds: u64,
        metadata: Option<SnapshotMetadata>,
    },
}

/// Removal counts across tiers and ledger
#[derive(Debug, Clone, Serialize)]
pub struct PurgeReport {
    pub tiers: DeleteReport,
    pub metadata: usize,
}

/// Result of an invalidation
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationReport {
    pub invalidated: usize,
    pub tiers: DeleteReport,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FreezeRequest {
    pub enabled: bool,
    #[serde(default)]
    pub global: Option<bool>,
    #[serde(default)]
    pub endpoints: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct ServiceStats {
    pub cache: EngineStats,
    /// `None` when the ledger is disabled or unreadable
    pub snapshots: Option<SnapshotStats>,
    pub freeze: FreezeState,
}

/// Removes a key from the in-flight refresh set when dropped
struct RefreshGuard<'a> {
    refreshing: &'a DashMap<String, ()>,
    key: String,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.refreshing.remove(&self.key);
    }
}

pub struct CacheService {
    engine: Arc<CacheEngine>,
    snapshots: Option<Arc<SnapshotStore>>,
    forwarder: Arc<dyn Forwarder>,
    freeze: Arc<FreezeController>,
    refreshing: DashMap<String, ()>,
}

impl CacheService {
    pub fn new(
        engine: Arc<CacheEngine>,
        snapshots: Option<Arc<SnapshotStore>>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Self {
        let freeze = Arc::clone(engine.freeze());
        Self {
            engine,
            snapshots,
            forwarder,
            freeze,
            refreshing: DashMap::new(),
        }
    }

    pub fn engine(&self) -> &Arc<CacheEngine> {
        &self.engine
    }

    pub fn snapshots(&self) -> Option<&Arc<SnapshotStore>> {
        self.snapshots.as_ref()
    }

    pub fn forwarder(&self) -> &Arc<dyn Forwarder> {
        &self.forwarder
    }

    fn ledger(&self) -> ServiceResult<&Arc<SnapshotStore>> {
        self.snapshots
            .as_ref()
            .ok_or_else(|| ServiceError::Unavailable("snapshot store is not enabled".into()))
    }

    // ------------------------------------------------------------------
    // Proxy flow
    // ------------------------------------------------------------------

    /// Cache lookup for a proxied request. A hit is counted in the ledger.
    pub async fn lookup(&self, request: &CacheRequest) -> Option<CacheHit> {
        let hit = self.engine.get(request).await?;
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.touch_access(&hit.key).await {
                debug!(key = %hit.key, error = %e, "Access not recorded");
            }
        }
        Some(hit)
    }

    /// Store an origin response for `request` and record its metadata
    pub async fn store(&self, request: &CacheRequest, response: &ForwardResponse) -> SetOutcome {
        let Some(payload) = Payload::from_body(response.content_type(), &response.body) else {
            debug!(url = %request.url, "Binary response body, not cached");
            return SetOutcome::Rejected(PolicyRejection::NotCacheable);
        };

        let outcome = self
            .engine
            .set(request, response.status, &response.headers, payload)
            .await;

        if let (SetOutcome::Stored { key, ttl_seconds, .. }, Some(store)) = (&outcome, &self.snapshots) {
            store
                .record(self.record_input(key, request, response, *ttl_seconds, Vec::new()))
                .await;
        }
        outcome
    }

    fn record_input(
        &self,
        key: &str,
        request: &CacheRequest,
        response: &ForwardResponse,
        ttl_seconds: u64,
        tags: Vec<String>,
    ) -> RecordInput {
        RecordInput {
            cache_key: key.to_string(),
            url: request.url.clone(),
            method: request.method.clone(),
            status_code: response.status,
            ttl_seconds,
            backend_host: self.forwarder.backend_host(),
            payload: Some(response.body.to_vec()),
            headers: serde_json::to_value(&response.headers).ok(),
            request_body: request
                .body
                .as_ref()
                .filter(|b| !b.is_empty())
                .map(|b| String::from_utf8_lossy(b).into_owned()),
            content_type: response.content_type().map(str::to_string),
            tags,
        }
    }

    // ------------------------------------------------------------------
    // Administrative surface
    // ------------------------------------------------------------------

    pub async fn list(&self, filter: SnapshotFilter) -> ServiceResult<EntryList> {
        let store = self.ledger()?;
        let page = store.list(filter).await?;
        let stats = store.stats().await?;
        Ok(EntryList { page, stats })
    }

    pub async fn get_entry(&self, key: &str) -> ServiceResult<EntryDetail> {
        let metadata = match &self.snapshots {
            Some(store) => store.get_by_key(key).await?,
            None => None,
        };
        let live = self.engine.peek(key).await;
        if metadata.is_none() && live.is_none() {
            return Err(ServiceError::NotFound(key.to_string()));
        }

        let now = Utc::now();
        let expires_at = match (&metadata, &live) {
            (Some(meta), _) => meta.expires_at,
            (None, Some((entry, _))) => entry.expires_at(),
            (None, None) => now,
        };
        let size_bytes = match (&live, &metadata) {
            (Some((entry, _)), _) => entry.size_bytes(),
            (None, Some(meta)) => meta.response_size,
            (None, None) => 0,
        };
        let (payload, headers, source) = match live {
            Some((entry, source)) => (Some(entry.data), Some(entry.headers), Some(source)),
            None => (None, None, None),
        };

        Ok(EntryDetail {
            cache_key: key.to_string(),
            metadata,
            payload,
            headers,
            source,
            is_expired: expires_at <= now,
            time_remaining: seconds_until(expires_at, now),
            size_bytes,
        })
    }

    /// Re-fetch a key from the origin and overwrite every tier and the
    /// ledger row. Freeze always wins, `force` only skips the liveness check.
    pub async fn refresh(&self, key: &str, options: RefreshOptions) -> ServiceResult<RefreshOutcome> {
        let store = self.ledger()?;
        let meta = store
            .get_by_key(key)
            .await?
            .ok_or_else(|| ServiceError::NotFound(key.to_string()))?;

        if self.freeze.is_frozen(&meta.url) {
            info!(key = %key, url = %meta.url, "Refresh refused, endpoint frozen");
            return Ok(RefreshOutcome::Frozen {
                cache_key: key.to_string(),
                url: meta.url,
            });
        }

        if !options.force {
            if let Some((entry, _)) = self.engine.peek(key).await {
                return Ok(RefreshOutcome::StillValid {
                    cache_key: key.to_string(),
                    time_remaining: entry.remaining_seconds(),
                });
            }
        }

        if self.refreshing.insert(key.to_string(), ()).is_some() {
            return Ok(RefreshOutcome::InProgress {
                cache_key: key.to_string(),
            });
        }
        let _guard = RefreshGuard {
            refreshing: &self.refreshing,
            key: key.to_string(),
        };

        let request_body = meta.request_body.clone().map(bytes::Bytes::from);
        let response = self
            .forwarder
            .forward(ForwardRequest {
                method: meta.method.clone(),
                path_and_query: meta.url.clone(),
                headers: Headers::new(),
                body: request_body.clone(),
            })
            .await?;

        let payload = Payload::from_body(response.content_type(), &response.body)
            .ok_or_else(|| ServiceError::Upstream("origin returned a binary body".into()))?;

        let mut request = CacheRequest::new(&meta.method, &meta.url);
        request.body = request_body;
        let ttl_seconds = options.ttl_override.unwrap_or_else(|| {
            self.engine
                .rules()
                .ttl_for(&meta.method, &meta.url, &request.headers, Some(response.status))
        });

        let entry = CacheEntry::from_payload(
            payload,
            storable_headers(&response.headers),
            response.status,
            ttl_seconds,
        );
        self.engine.store_entry(key, entry).await;

        let tags = options.tags.unwrap_or(meta.tags);
        store
            .record(self.record_input(key, &request, &response, ttl_seconds, tags))
            .await;

        info!(key = %key, status = response.status, ttl_seconds = ttl_seconds, "Cache entry refreshed");
        Ok(RefreshOutcome::Refreshed {
            cache_key: key.to_string(),
            status_code: response.status,
            ttl_seconds,
            metadata: store.get_by_key(key).await?,
        })
    }

    /// Partial metadata update. A new expiry is pushed into every tier.
    pub async fn update(&self, key: &str, update: SnapshotUpdate) -> ServiceResult<SnapshotMetadata> {
        if update.is_empty() {
            return Err(ServiceError::BadRequest("no fields to update".into()));
        }
        if let Some(hours) = update.ttl_extension_hours {
            if !hours.is_finite() {
                return Err(ServiceError::BadRequest("ttl_extension_hours must be finite".into()));
            }
        }

        let store = self.ledger()?;
        let changes_expiry = update.changes_expiry();
        let meta = store
            .update(key, update)
            .await?
            .ok_or_else(|| ServiceError::NotFound(key.to_string()))?;

        if changes_expiry {
            let retimed = self.engine.retime(key, meta.expires_at).await;
            debug!(key = %key, expires_at = %meta.expires_at, retimed = retimed, "Entry expiry updated");
        }
        Ok(meta)
    }

    pub async fn delete(&self, key: &str) -> ServiceResult<PurgeReport> {
        let tiers = self.engine.delete(key).await;
        let metadata = match &self.snapshots {
            Some(store) => usize::from(store.delete(key).await?),
            None => 0,
        };
        if tiers.keys == 0 && metadata == 0 {
            return Err(ServiceError::NotFound(key.to_string()));
        }
        Ok(PurgeReport { tiers, metadata })
    }

    pub async fn stats(&self) -> ServiceStats {
        let snapshots = match &self.snapshots {
            Some(store) => match store.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    warn!(error = %e, "Snapshot stats unavailable");
                    None
                }
            },
            None => None,
        };
        ServiceStats {
            cache: self.engine.stats().await,
            snapshots,
            freeze: self.freeze.status(),
        }
    }

    /// Purge expired entries from every tier and expired non-manual rows
    pub async fn cleanup(&self) -> ServiceResult<PurgeReport> {
        let tiers = self.engine.cleanup_expired().await;
        let metadata = match &self.snapshots {
            Some(store) => store.clean_expired().await?,
            None => 0,
        };
        Ok(PurgeReport { tiers, metadata })
    }

    /// Empty every tier. Manual snapshots stay in the ledger.
    pub async fn clear(&self) -> ServiceResult<PurgeReport> {
        let tiers = self.engine.clear().await;
        let metadata = match &self.snapshots {
            Some(store) => store.clear_non_manual().await?,
            None => 0,
        };
        Ok(PurgeReport { tiers, metadata })
    }

    pub fn freeze(&self, request: FreezeRequest) -> ServiceResult<FreezeState> {
        let state = match request.endpoints {
            Some(endpoints) if !endpoints.is_empty() => {
                self.freeze.set_endpoints(endpoints, request.enabled)
            }
            _ if request.global == Some(false) => {
                return Err(ServiceError::BadRequest(
                    "either global or a non-empty endpoints list is required".into(),
                ));
            }
            _ => self.freeze.set_global(request.enabled),
        };
        Ok(state)
    }

    pub async fn invalidate_pattern(&self, pattern: &str) -> ServiceResult<InvalidationReport> {
        if pattern.is_empty() {
            return Err(ServiceError::BadRequest("pattern must not be empty".into()));
        }
        let tiers = self.engine.invalidate_pattern(pattern).await?;
        Ok(InvalidationReport {
            invalidated: tiers.keys,
            tiers,
        })
    }

    pub async fn invalidate_age(&self, age_seconds: u64) -> ServiceResult<InvalidationReport> {
        let tiers = self.engine.invalidate_older_than(age_seconds).await;
        Ok(InvalidationReport {
            invalidated: tiers.keys,
            tiers,
        })
    }

    /// Drop payloads whose ledger row carries any of `tags`. Rows are kept.
    pub async fn invalidate_tags(&self, tags: Vec<String>) -> ServiceResult<InvalidationReport> {
        let tags: Vec<String> = tags
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if tags.is_empty() {
            return Err(ServiceError::BadRequest("at least one tag is required".into()));
        }

        let keys = self.ledger()?.keys_with_any_tag(tags.clone()).await?;
        let tiers = self.engine.invalidate_keys(&keys).await;
        info!(tags = ?tags, invalidated = tiers.keys, "Invalidated cache entries by tag");
        Ok(InvalidationReport {
            invalidated: tiers.keys,
            tiers,
        })
    }
}

fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (at - now).num_seconds().max(0) as u64
}

/// Spawn background maintenance: tier purge plus ledger expiry sweep
pub fn spawn_maintenance_task(service: Arc<CacheService>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match service.cleanup().await {
                Ok(report) if report.tiers.total() > 0 || report.metadata > 0 => info!(
                    memory = report.tiers.memory,
                    redis = report.tiers.redis,
                    file = report.tiers.file,
                    metadata = report.metadata,
                    "Expired cache entries purged"
                ),
                Ok(_) => debug!("Cache maintenance found nothing to purge"),
                Err(e) => warn!(error = %e, "Cache maintenance failed"),
            }
        }
    });

    info!(
        interval_secs = interval.as_secs(),
        "Cache maintenance task started"
    );
}
