//! Snapshot ledger records, filters and inputs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provenance and lifecycle record for one cache key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub cache_key: String,
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Exempt from automatic expiry cleanup
    pub manual_snapshot: bool,
    pub backend_host: String,
    pub payload_hash: Option<String>,
    pub headers_hash: Option<String>,
    pub request_body: Option<String>,
    pub response_size: u64,
    pub content_type: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub access_count: u64,
}

impl SnapshotMetadata {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Data captured when a response is cached
#[derive(Debug, Clone, Default)]
pub struct RecordInput {
    pub cache_key: String,
    pub url: String,
    pub method: String,
    pub status_code: u16,
    pub ttl_seconds: u64,
    pub backend_host: String,
    /// Serialized payload, hashed and measured
    pub payload: Option<Vec<u8>>,
    /// Response headers as JSON, hashed
    pub headers: Option<serde_json::Value>,
    pub request_body: Option<String>,
    pub content_type: Option<String>,
    pub tags: Vec<String>,
}

/// `list` filters. Every field is optional; tags match any-of.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotFilter {
    pub method: Option<String>,
    /// Substring of the URL
    pub url: Option<String>,
    pub backend_host: Option<String>,
    pub manual: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub expires_after: Option<DateTime<Utc>>,
    pub expires_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

pub fn default_limit() -> u32 {
    50
}

impl Default for SnapshotFilter {
    fn default() -> Self {
        Self {
            method: None,
            url: None,
            backend_host: None,
            manual: None,
            created_after: None,
            created_before: None,
            expires_after: None,
            expires_before: None,
            tags: Vec::new(),
            limit: default_limit(),
            offset: 0,
        }
    }
}

/// Partial update; `None` fields are left as they are
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotUpdate {
    pub expires_at: Option<DateTime<Utc>>,
    pub manual_snapshot: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub description: Option<String>,
    /// Added to the current `expires_at` (not to now)
    pub ttl_extension_hours: Option<f64>,
}

impl SnapshotUpdate {
    pub fn is_empty(&self) -> bool {
        self.expires_at.is_none()
            && self.manual_snapshot.is_none()
            && self.tags.is_none()
            && self.description.is_none()
            && self.ttl_extension_hours.is_none()
    }

    pub fn changes_expiry(&self) -> bool {
        self.expires_at.is_some() || self.ttl_extension_hours.is_some()
    }
}

/// Ledger aggregates
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SnapshotStats {
    pub total: u64,
    pub manual: u64,
    pub expired: u64,
    pub total_size_bytes: u64,
    pub total_accesses: u64,
    pub unique_tags: u64,
    pub backend_hosts: u64,
}
