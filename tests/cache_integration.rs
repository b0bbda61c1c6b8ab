//! Integration tests for the cache engine, snapshot ledger and admin service
//!
//! The origin is an in-process stub and Redis is replaced by a backend that
//! is permanently unreachable, so no network services are needed.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use glob::Pattern;
use hyper::StatusCode;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use cachegate::cache::{
    CacheConfig, CacheEngine, CacheEntry, CacheError, CacheRequest, CacheRule, CacheSource,
    FileTier, FreezeController, Headers, SetOutcome, StorageKind, TierBackend, TierStats,
};
use cachegate::logging::TracingErrorSink;
use cachegate::proxy::{ForwardError, ForwardRequest, ForwardResponse, Forwarder};
use cachegate::routes::cache_admin::{dispatch, AdminRoute};
use cachegate::services::{CacheService, FreezeRequest, RefreshOptions, RefreshOutcome};
use cachegate::snapshot::{SnapshotStore, SnapshotUpdate};

/// Origin answering every request with a JSON counter
struct CountingOrigin {
    calls: AtomicU32,
}

#[async_trait]
impl Forwarder for CountingOrigin {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let mut headers = Headers::new();
        headers.insert("content-type".into(), "application/json".into());
        Ok(ForwardResponse {
            status: 200,
            headers,
            body: Bytes::from(
                json!({"path": request.path_and_query, "n": n}).to_string(),
            ),
        })
    }

    fn backend_host(&self) -> String {
        "origin.test".into()
    }
}

/// Redis stand-in that is never reachable
struct DownTier;

#[async_trait]
impl TierBackend for DownTier {
    fn kind(&self) -> StorageKind {
        StorageKind::Redis
    }

    async fn init(&self) -> Result<(), CacheError> {
        Err(down())
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, CacheError> {
        Err(down())
    }

    async fn put(&self, _key: &str, _entry: &CacheEntry) -> Result<(), CacheError> {
        Err(down())
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(down())
    }

    async fn delete_many(&self, _keys: &[String]) -> Result<usize, CacheError> {
        Err(down())
    }

    async fn keys(&self) -> Result<Vec<String>, CacheError> {
        Err(down())
    }

    async fn find(&self, _pattern: &Pattern) -> Result<Vec<String>, CacheError> {
        Err(down())
    }

    async fn purge_expired(&self) -> Result<usize, CacheError> {
        Err(down())
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        Err(down())
    }

    async fn stats(&self) -> TierStats {
        TierStats {
            enabled: true,
            connected: false,
            ..TierStats::disabled("redis")
        }
    }
}

fn down() -> CacheError {
    CacheError::TierUnavailable {
        tier: "redis",
        reason: "connection refused".into(),
    }
}

struct Harness {
    _dir: TempDir,
    service: CacheService,
    origin: Arc<CountingOrigin>,
}

async fn harness_with(config: CacheConfig, ledger: bool) -> Harness {
    let dir = TempDir::new().unwrap();
    let file = FileTier::new(dir.path());
    file.init().await.unwrap();

    let engine = CacheEngine::with_tiers(
        config,
        Arc::new(FreezeController::new()),
        Some(Arc::new(DownTier)),
        Some(Arc::new(file)),
    )
    .unwrap();
    let snapshots = ledger.then(|| Arc::new(SnapshotStore::in_memory(Arc::new(TracingErrorSink)).unwrap()));
    let origin = Arc::new(CountingOrigin {
        calls: AtomicU32::new(0),
    });
    let service = CacheService::new(Arc::new(engine), snapshots, origin.clone());
    Harness {
        _dir: dir,
        service,
        origin,
    }
}

async fn harness() -> Harness {
    harness_with(CacheConfig::default(), true).await
}

/// Miss path: fetch from the origin and store
async fn populate(h: &Harness, url: &str) -> String {
    let request = CacheRequest::new("GET", url);
    let response = h
        .origin
        .forward(ForwardRequest {
            method: "GET".into(),
            path_and_query: url.into(),
            ..Default::default()
        })
        .await
        .unwrap();
    match h.service.store(&request, &response).await {
        SetOutcome::Stored { key, .. } => key,
        other => panic!("response not stored: {:?}", other),
    }
}

#[tokio::test]
async fn test_tier_fallback_with_redis_down() {
    let h = harness().await;
    let key = populate(&h, "/api/items").await;

    let hit = h.service.lookup(&CacheRequest::new("GET", "/api/items")).await.unwrap();
    assert_eq!(hit.source, CacheSource::Memory);

    h.service.engine().memory().remove(&key);
    let hit = h.service.lookup(&CacheRequest::new("GET", "/api/items")).await.unwrap();
    assert_eq!(hit.source, CacheSource::File);
    assert_eq!(hit.entry.data["path"], "/api/items");

    // Promoted back into memory
    let hit = h.service.lookup(&CacheRequest::new("GET", "/api/items")).await.unwrap();
    assert_eq!(hit.source, CacheSource::Memory);

    let stats = h.service.stats().await;
    assert!(stats.cache.redis.enabled);
    assert!(!stats.cache.redis.connected);
    assert_eq!(stats.cache.hits, 3);
}

#[tokio::test]
async fn test_freeze_blocks_refresh_and_leaves_entry_untouched() {
    let h = harness().await;
    let key = populate(&h, "/api/reports").await;
    let store = h.service.snapshots().unwrap();
    let meta_before = store.get_by_key(&key).await.unwrap().unwrap();
    let (entry_before, _) = h.service.engine().peek(&key).await.unwrap();

    h.service
        .freeze(FreezeRequest {
            enabled: true,
            global: Some(true),
            endpoints: None,
        })
        .unwrap();

    let outcome = h
        .service
        .refresh(
            &key,
            RefreshOptions {
                force: true,
                ttl_override: Some(5),
                tags: Some(vec!["changed".into()]),
            },
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RefreshOutcome::Frozen { .. }));
    assert_eq!(h.origin.calls.load(Ordering::SeqCst), 1);

    let (entry_after, _) = h.service.engine().peek(&key).await.unwrap();
    assert_eq!(entry_after.data, entry_before.data);
    assert_eq!(entry_after.ttl_seconds, entry_before.ttl_seconds);
    let meta_after = store.get_by_key(&key).await.unwrap().unwrap();
    assert_eq!(meta_after.expires_at, meta_before.expires_at);
    assert_eq!(meta_after.tags, meta_before.tags);
}

#[tokio::test]
async fn test_endpoint_freeze_only_blocks_matching_urls() {
    let h = harness().await;
    let frozen = populate(&h, "/api/reports/daily").await;
    let open = populate(&h, "/api/items").await;

    h.service
        .freeze(FreezeRequest {
            enabled: true,
            global: None,
            endpoints: Some(vec!["/api/reports".into()]),
        })
        .unwrap();

    let forced = RefreshOptions {
        force: true,
        ..Default::default()
    };
    assert!(matches!(
        h.service.refresh(&frozen, forced.clone()).await.unwrap(),
        RefreshOutcome::Frozen { .. }
    ));
    assert!(matches!(
        h.service.refresh(&open, forced).await.unwrap(),
        RefreshOutcome::Refreshed { .. }
    ));
}

#[tokio::test]
async fn test_metadata_survives_memory_eviction() {
    let h = harness().await;
    let key = populate(&h, "/api/items").await;
    let store = h.service.snapshots().unwrap();

    assert!(h.service.engine().memory().remove(&key));
    assert!(store.get_by_key(&key).await.unwrap().is_some());

    let hit = h.service.lookup(&CacheRequest::new("GET", "/api/items")).await.unwrap();
    assert_eq!(hit.source, CacheSource::File);
    h.service.lookup(&CacheRequest::new("GET", "/api/items")).await.unwrap();

    let meta = store.get_by_key(&key).await.unwrap().unwrap();
    assert_eq!(meta.access_count, 2);
    assert_eq!(meta.url, "/api/items");
}

#[tokio::test]
async fn test_invalidate_by_age_removes_only_old_entries() {
    let h = harness().await;
    let engine = h.service.engine();

    let mut old = CacheEntry::new(json!({"v": "old"}), Headers::new(), 200, 300);
    old.created_at = Utc::now() - ChronoDuration::seconds(30);
    engine.store_entry("GET::/old", old).await;
    let fresh = CacheEntry::new(json!({"v": "fresh"}), Headers::new(), 200, 300);
    engine.store_entry("GET::/fresh", fresh).await;

    let report = h.service.invalidate_age(10).await.unwrap();
    assert_eq!(report.invalidated, 1);
    assert!(engine.peek("GET::/old").await.is_none());
    assert!(engine.peek("GET::/fresh").await.is_some());

    let again = h.service.invalidate_age(10).await.unwrap();
    assert_eq!(again.invalidated, 0);
}

#[tokio::test]
async fn test_invalidate_by_tags_is_idempotent_and_keeps_metadata() {
    let h = harness().await;
    let tagged = populate(&h, "/api/reports").await;
    let other = populate(&h, "/api/items").await;
    h.service
        .update(
            &tagged,
            SnapshotUpdate {
                tags: Some(vec!["reports".into()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let report = h.service.invalidate_tags(vec!["reports".into(), "unused".into()]).await.unwrap();
    assert_eq!(report.invalidated, 1);
    assert!(h.service.engine().peek(&tagged).await.is_none());
    assert!(h.service.engine().peek(&other).await.is_some());
    assert!(h.service.snapshots().unwrap().get_by_key(&tagged).await.unwrap().is_some());

    let again = h.service.invalidate_tags(vec!["reports".into()]).await.unwrap();
    assert_eq!(again.invalidated, 0);
}

#[tokio::test]
async fn test_invalidate_by_pattern() {
    let h = harness().await;
    populate(&h, "/api/reports/1").await;
    populate(&h, "/api/reports/2").await;
    let kept = populate(&h, "/api/items").await;

    let report = h.service.invalidate_pattern("GET::*/reports/*").await.unwrap();
    assert_eq!(report.invalidated, 2);
    assert!(h.service.engine().peek(&kept).await.is_some());
}

#[tokio::test]
async fn test_rule_precedence_sets_ttl() {
    let config = CacheConfig {
        rules: vec![
            CacheRule::new("*/health*").with_ttl(30),
            CacheRule::new("*").with_ttl(300),
        ],
        ..Default::default()
    };
    let h = harness_with(config, true).await;

    let health = populate(&h, "/api/health/live").await;
    let other = populate(&h, "/api/other").await;

    let store = h.service.snapshots().unwrap();
    let health_meta = store.get_by_key(&health).await.unwrap().unwrap();
    let other_meta = store.get_by_key(&other).await.unwrap().unwrap();
    assert_eq!((health_meta.expires_at - health_meta.created_at).num_seconds(), 30);
    assert_eq!((other_meta.expires_at - other_meta.created_at).num_seconds(), 300);
}

#[tokio::test]
async fn test_admin_routes_report_status_codes() {
    let h = harness().await;
    let key = populate(&h, "/api/items").await;
    let empty = Bytes::new();

    let stats = dispatch(AdminRoute::Stats, None, &empty, &h.service).await;
    assert_eq!(stats.status(), StatusCode::OK);

    let list = dispatch(AdminRoute::ListEntries, Some("limit=10"), &empty, &h.service).await;
    assert_eq!(list.status(), StatusCode::OK);

    let entry = dispatch(AdminRoute::GetEntry(key.clone()), None, &empty, &h.service).await;
    assert_eq!(entry.status(), StatusCode::OK);

    let missing = dispatch(AdminRoute::RefreshEntry("nope".into()), None, &empty, &h.service).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let bad = Bytes::from_static(b"{\"pattern\": ");
    let invalid = dispatch(AdminRoute::InvalidatePattern, None, &bad, &h.service).await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let deleted = dispatch(AdminRoute::DeleteEntry(key), None, &empty, &h.service).await;
    assert_eq!(deleted.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_without_ledger_is_unavailable() {
    let h = harness_with(CacheConfig::default(), false).await;
    let empty = Bytes::new();

    let list = dispatch(AdminRoute::ListEntries, None, &empty, &h.service).await;
    assert_eq!(list.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Payload caching still works without metadata
    populate(&h, "/api/items").await;
    assert!(h.service.lookup(&CacheRequest::new("GET", "/api/items")).await.is_some());
}
