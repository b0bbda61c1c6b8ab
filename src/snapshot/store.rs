//! Async facade over the snapshot ledger
//!
//! Every call runs on the blocking pool inside `with_retry`. `record` never
//! fails: a ledger outage is reported to the error sink and swallowed so that
//! payload caching carries on without metadata.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::cache::sha256_hex;
use crate::logging::ErrorSink;

use super::db::{self, SnapshotDb};
use super::error::SnapshotError;
use super::model::{RecordInput, SnapshotFilter, SnapshotMetadata, SnapshotStats, SnapshotUpdate};
use super::retry::{with_retry, ResourceClass, RetryPolicy};

/// One page of `list` results
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotPage {
    pub items: Vec<SnapshotMetadata>,
    /// Rows matching the filter across all pages
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

pub struct SnapshotStore {
    db: Arc<SnapshotDb>,
    retry: RetryPolicy,
    sink: Arc<dyn ErrorSink>,
}

impl SnapshotStore {
    pub fn new(db: SnapshotDb, retry: RetryPolicy, sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            db: Arc::new(db),
            retry,
            sink,
        }
    }

    /// Open the on-disk ledger under `dir`
    pub fn open(dir: &Path, retry: RetryPolicy, sink: Arc<dyn ErrorSink>) -> Result<Self, SnapshotError> {
        Ok(Self::new(SnapshotDb::open(dir)?, retry, sink))
    }

    /// In-memory ledger (for testing)
    pub fn in_memory(sink: Arc<dyn ErrorSink>) -> Result<Self, SnapshotError> {
        Ok(Self::new(SnapshotDb::open_in_memory()?, RetryPolicy::default(), sink))
    }

    async fn run<T, F>(&self, operation: &'static str, f: F) -> Result<T, SnapshotError>
    where
        F: Fn(&SnapshotDb) -> Result<T, SnapshotError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let result = with_retry(&self.retry, operation, ResourceClass::Database, || {
            let db = Arc::clone(&self.db);
            let f = Arc::clone(&f);
            async move {
                tokio::task::spawn_blocking(move || (*f)(&db))
                    .await
                    .map_err(|e| SnapshotError::Join(e.to_string()))?
            }
        })
        .await;

        if let Err(ref e @ SnapshotError::RetriesExhausted { .. }) = result {
            self.sink.capture(operation, e);
        }
        result
    }

    /// Upsert the ledger row for a freshly cached response
    pub async fn record(&self, input: RecordInput) {
        let key = input.cache_key.clone();
        let meta = Self::metadata_for(input);
        let result = self
            .run("snapshot.record", move |ledger| {
                ledger.with_conn_mut(|conn| db::upsert_snapshot(conn, &meta))
            })
            .await;

        match result {
            Ok(()) => debug!(key = %key, "Snapshot recorded"),
            Err(SnapshotError::RetriesExhausted { .. }) => {}
            Err(e) => self.sink.capture("snapshot.record", &e),
        }
    }

    fn metadata_for(input: RecordInput) -> SnapshotMetadata {
        let now = Utc::now();
        let ttl = ChronoDuration::seconds(input.ttl_seconds.min(i64::MAX as u64) as i64);
        let response_size = input.payload.as_ref().map(|p| p.len() as u64).unwrap_or(0);
        let payload_hash = input.payload.as_deref().map(sha256_hex);
        let headers_hash = input
            .headers
            .as_ref()
            .and_then(|h| serde_json::to_vec(h).ok())
            .map(|bytes| sha256_hex(&bytes));

        SnapshotMetadata {
            cache_key: input.cache_key,
            url: input.url,
            method: input.method.to_ascii_uppercase(),
            status_code: input.status_code,
            created_at: now,
            expires_at: now + ttl,
            manual_snapshot: false,
            backend_host: input.backend_host,
            payload_hash,
            headers_hash,
            request_body: input.request_body,
            response_size,
            content_type: input.content_type,
            tags: input.tags,
            description: None,
            last_accessed_at: None,
            access_count: 0,
        }
    }

    /// Count one cache hit. Returns false when the key has no row.
    pub async fn touch_access(&self, key: &str) -> Result<bool, SnapshotError> {
        let key = key.to_string();
        self.run("snapshot.touch", move |ledger| {
            ledger.with_conn(|conn| db::touch_access(conn, &key, Utc::now()))
        })
        .await
    }

    pub async fn list(&self, filter: SnapshotFilter) -> Result<SnapshotPage, SnapshotError> {
        let (limit, offset) = (filter.limit, filter.offset);
        let (items, total) = self
            .run("snapshot.list", move |ledger| {
                ledger.with_conn(|conn| {
                    let items = db::list_snapshots(conn, &filter)?;
                    let total = db::count_snapshots(conn, &filter)?;
                    Ok((items, total))
                })
            })
            .await?;
        Ok(SnapshotPage {
            items,
            total,
            limit,
            offset,
        })
    }

    pub async fn get_by_key(&self, key: &str) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        let key = key.to_string();
        self.run("snapshot.get", move |ledger| {
            ledger.with_conn(|conn| db::get_snapshot(conn, &key))
        })
        .await
    }

    /// Apply a partial update; `None` when the key has no row
    pub async fn update(
        &self,
        key: &str,
        update: SnapshotUpdate,
    ) -> Result<Option<SnapshotMetadata>, SnapshotError> {
        let key = key.to_string();
        self.run("snapshot.update", move |ledger| {
            ledger.with_conn_mut(|conn| db::update_snapshot(conn, &key, &update))
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, SnapshotError> {
        let key = key.to_string();
        self.run("snapshot.delete", move |ledger| {
            ledger.with_conn(|conn| db::delete_snapshot(conn, &key))
        })
        .await
    }

    pub async fn stats(&self) -> Result<SnapshotStats, SnapshotError> {
        self.run("snapshot.stats", |ledger| {
            ledger.with_conn(|conn| db::snapshot_stats(conn, Utc::now()))
        })
        .await
    }

    /// Delete expired rows; manual snapshots are kept
    pub async fn clean_expired(&self) -> Result<usize, SnapshotError> {
        self.run("snapshot.clean_expired", |ledger| {
            ledger.with_conn(|conn| db::clean_expired(conn, Utc::now()))
        })
        .await
    }

    pub async fn clear_non_manual(&self) -> Result<usize, SnapshotError> {
        self.run("snapshot.clear", |ledger| ledger.with_conn(db::clear_non_manual))
            .await
    }

    pub async fn keys_with_any_tag(&self, tags: Vec<String>) -> Result<Vec<String>, SnapshotError> {
        self.run("snapshot.keys_by_tag", move |ledger| {
            ledger.with_conn(|conn| db::keys_with_any_tag(conn, &tags))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::TracingErrorSink;
    use serde_json::json;

    fn store() -> SnapshotStore {
        SnapshotStore::in_memory(Arc::new(TracingErrorSink)).unwrap()
    }

    fn input(key: &str) -> RecordInput {
        RecordInput {
            cache_key: key.to_string(),
            url: format!("/api/{}", key),
            method: "get".to_string(),
            status_code: 200,
            ttl_seconds: 300,
            backend_host: "origin.local".to_string(),
            payload: Some(br#"{"a":1}"#.to_vec()),
            headers: Some(json!({"content-type": "application/json"})),
            content_type: Some("application/json".to_string()),
            tags: vec!["api".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_record_computes_hashes_and_size() {
        let store = store();
        store.record(input("k")).await;

        let meta = store.get_by_key("k").await.unwrap().unwrap();
        assert_eq!(meta.method, "GET");
        assert_eq!(meta.response_size, 7);
        assert_eq!(meta.payload_hash.as_deref(), Some(sha256_hex(br#"{"a":1}"#).as_str()));
        assert!(meta.headers_hash.is_some());
        assert_eq!((meta.expires_at - meta.created_at).num_seconds(), 300);
        assert_eq!(meta.tags, vec!["api".to_string()]);
    }

    #[tokio::test]
    async fn test_touch_access_counts() {
        let store = store();
        store.record(input("k")).await;
        assert!(store.touch_access("k").await.unwrap());
        assert!(store.touch_access("k").await.unwrap());
        assert!(!store.touch_access("missing").await.unwrap());

        let meta = store.get_by_key("k").await.unwrap().unwrap();
        assert_eq!(meta.access_count, 2);
        assert!(meta.last_accessed_at.is_some());
    }

    #[tokio::test]
    async fn test_list_page_reports_total() {
        let store = store();
        for key in ["a", "b", "c"] {
            store.record(input(key)).await;
        }
        let page = store
            .list(SnapshotFilter {
                limit: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn test_update_delete_and_tags() {
        let store = store();
        store.record(input("k")).await;

        let updated = store
            .update(
                "k",
                SnapshotUpdate {
                    tags: Some(vec!["pinned".into(), "reports".into()]),
                    manual_snapshot: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.manual_snapshot);
        assert_eq!(
            store.keys_with_any_tag(vec!["reports".into()]).await.unwrap(),
            vec!["k".to_string()]
        );

        assert_eq!(store.clear_non_manual().await.unwrap(), 0);
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.stats().await.unwrap().total, 0);
    }

    #[derive(Default)]
    struct Recording(std::sync::Mutex<Vec<String>>);

    impl ErrorSink for Recording {
        fn capture(&self, context: &str, err: &(dyn std::error::Error + 'static)) {
            self.0.lock().unwrap().push(format!("{}: {}", context, err));
        }
    }

    #[tokio::test]
    async fn test_record_swallows_ledger_failure() {
        let db = SnapshotDb::open_in_memory().unwrap();
        db.with_conn(|c| {
            c.execute_batch("DROP TABLE snapshot_tags; DROP TABLE snapshots;")
                .map_err(crate::snapshot::error::db_err("drop tables"))
        })
        .unwrap();
        let sink = Arc::new(Recording::default());
        let store = SnapshotStore::new(db, RetryPolicy::default(), sink.clone());

        store.record(input("k")).await;

        let captured = sink.0.lock().unwrap().clone();
        assert_eq!(captured.len(), 1);
        assert!(captured[0].starts_with("snapshot.record"));
        assert!(store.get_by_key("k").await.is_err());
    }
}
