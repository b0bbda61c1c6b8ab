//! Cache entry definition
//!
//! One `CacheEntry` is the unit stored in every tier. Liveness is a pure
//! function of `created_at + ttl_seconds`; tiers never keep their own clocks.

use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Header map used for requests and stored responses (lower-cased names)
pub type Headers = BTreeMap<String, String>;

/// Connection-scoped headers that must never be cached or forwarded
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Returns true for headers that describe the connection rather than the payload
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// How `data` maps back to response bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// `data` is a JSON document whose compact serialization is the body
    #[default]
    Json,
    /// `data` is a string holding the body verbatim
    Text,
}

/// A response body in storable form
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub data: Value,
    pub encoding: PayloadEncoding,
}

impl Payload {
    /// Encode a response body.
    ///
    /// A JSON body is kept parsed only when its compact serialization
    /// reproduces the body exactly; anything else valid UTF-8 is kept as
    /// text. Binary bodies return `None` and are not cached.
    pub fn from_body(content_type: Option<&str>, body: &[u8]) -> Option<Self> {
        if is_json_content_type(content_type) {
            if let Ok(value) = serde_json::from_slice::<Value>(body) {
                if serde_json::to_vec(&value).ok().as_deref() == Some(body) {
                    return Some(Self {
                        data: value,
                        encoding: PayloadEncoding::Json,
                    });
                }
            }
        }
        std::str::from_utf8(body).ok().map(|text| Self {
            data: Value::String(text.to_string()),
            encoding: PayloadEncoding::Text,
        })
    }

    pub fn size(&self) -> u64 {
        payload_size(&self.data, self.encoding)
    }
}

impl From<Value> for Payload {
    fn from(data: Value) -> Self {
        Self {
            data,
            encoding: PayloadEncoding::Json,
        }
    }
}

/// A cached response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Opaque payload
    pub data: Value,
    #[serde(default)]
    pub encoding: PayloadEncoding,
    /// Response headers
    pub headers: Headers,
    /// HTTP status code
    pub status: u16,
    /// When the entry was populated
    pub created_at: DateTime<Utc>,
    /// Entry-specific TTL
    pub ttl_seconds: u64,
    /// Number of cache hits served from this entry
    #[serde(default)]
    pub access_count: u64,
    /// Last hit time
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create a fresh entry with zeroed access statistics
    pub fn new(data: Value, headers: Headers, status: u16, ttl_seconds: u64) -> Self {
        Self::from_payload(Payload::from(data), headers, status, ttl_seconds)
    }

    pub fn from_payload(payload: Payload, headers: Headers, status: u16, ttl_seconds: u64) -> Self {
        let now = Utc::now();
        Self {
            data: payload.data,
            encoding: payload.encoding,
            headers,
            status,
            created_at: now,
            ttl_seconds,
            access_count: 0,
            last_accessed_at: now,
        }
    }

    /// Instant after which the entry must not be served
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + ChronoDuration::seconds(self.ttl_seconds.min(i64::MAX as u64) as i64)
    }

    /// Live iff `now < created_at + ttl_seconds`
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    pub fn is_expired(&self) -> bool {
        !self.is_live_at(Utc::now())
    }

    /// Whole seconds until expiry (0 once expired)
    pub fn remaining_seconds(&self) -> u64 {
        (self.expires_at() - Utc::now()).num_seconds().max(0) as u64
    }

    /// Seconds until expiry rounded up, for stores with their own TTL clock.
    /// Zero only once the entry is no longer live at `now`.
    pub fn store_ttl_at(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.expires_at() - now).num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis as u64).div_ceil(1000)
        }
    }

    /// Response body size in bytes
    pub fn size_bytes(&self) -> u64 {
        payload_size(&self.data, self.encoding)
    }

    /// Response bytes exactly as the origin sent them
    pub fn body(&self) -> Bytes {
        payload_to_body(&self.data, self.encoding)
    }

    /// Seconds remaining from `created_at` until `target` (0 if already past)
    pub fn ttl_reaching(&self, target: DateTime<Utc>) -> u64 {
        (target - self.created_at).num_seconds().max(0) as u64
    }

    /// Structural validation applied to entries read back from Redis or disk
    pub fn validate(&self) -> Result<(), String> {
        if !(100..=599).contains(&self.status) {
            return Err(format!("status {} out of range", self.status));
        }
        if self.last_accessed_at < self.created_at - ChronoDuration::seconds(1) {
            return Err("last access precedes creation".to_string());
        }
        Ok(())
    }
}

/// Size of a payload once decoded into a body
pub fn payload_size(data: &Value, encoding: PayloadEncoding) -> u64 {
    match (data, encoding) {
        (Value::String(text), PayloadEncoding::Text) => text.len() as u64,
        (other, _) => serde_json::to_vec(other).map(|v| v.len() as u64).unwrap_or(0),
    }
}

fn is_json_content_type(content_type: Option<&str>) -> bool {
    content_type
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false)
}

/// Decode a stored payload back into response bytes
pub fn payload_to_body(data: &Value, encoding: PayloadEncoding) -> Bytes {
    match (data, encoding) {
        (Value::String(text), PayloadEncoding::Text) => Bytes::from(text.clone().into_bytes()),
        (other, _) => Bytes::from(serde_json::to_vec(other).unwrap_or_default()),
    }
}

/// Keep only headers worth storing alongside a payload
pub fn storable_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_liveness_window() {
        let mut entry = CacheEntry::new(json!({"ok": true}), Headers::new(), 200, 10);
        assert!(!entry.is_expired());
        assert!(entry.remaining_seconds() <= 10);

        entry.created_at = Utc::now() - ChronoDuration::seconds(10);
        assert!(entry.is_expired());
        assert_eq!(entry.remaining_seconds(), 0);
    }

    #[test]
    fn test_zero_ttl_is_never_live() {
        let entry = CacheEntry::new(json!(1), Headers::new(), 200, 0);
        assert!(!entry.is_live_at(entry.created_at));
    }

    #[test]
    fn test_validate_rejects_bad_status() {
        let entry = CacheEntry::new(json!(null), Headers::new(), 42, 10);
        assert!(entry.validate().is_err());

        let entry = CacheEntry::new(json!(null), Headers::new(), 204, 10);
        assert!(entry.validate().is_ok());
    }

    #[test]
    fn test_serialized_shape_is_camel_case() {
        let entry = CacheEntry::new(json!("body"), Headers::new(), 200, 30);
        let value = serde_json::to_value(&entry).unwrap();
        assert!(value.get("ttlSeconds").is_some());
        assert!(value.get("createdAt").is_some());
        assert!(value.get("accessCount").is_some());
    }

    fn served(content_type: &str, body: &[u8]) -> Vec<u8> {
        let payload = Payload::from_body(Some(content_type), body).unwrap();
        CacheEntry::from_payload(payload, Headers::new(), 200, 60).body().to_vec()
    }

    #[test]
    fn test_payload_json_and_text() {
        let json_payload = Payload::from_body(Some("application/json"), br#"{"a":1}"#).unwrap();
        assert_eq!(json_payload.encoding, PayloadEncoding::Json);
        assert_eq!(json_payload.data, json!({"a": 1}));
        assert_eq!(served("application/json", br#"{"a":1}"#), br#"{"a":1}"#);

        let text = Payload::from_body(Some("text/plain"), b"hello").unwrap();
        assert_eq!(text.encoding, PayloadEncoding::Text);
        assert_eq!(text.data, json!("hello"));
        assert_eq!(served("text/plain", b"hello"), b"hello");

        // A JSON string body keeps its quotes on the way out
        assert_eq!(served("application/json", br#""hi""#), br#""hi""#);
    }

    #[test]
    fn test_invalid_json_body_served_verbatim() {
        let payload = Payload::from_body(Some("application/json"), b"OK").unwrap();
        assert_eq!(payload.encoding, PayloadEncoding::Text);
        assert_eq!(served("application/json", b"OK"), b"OK");
        assert_eq!(served("application/json; charset=utf-8", b"{broken"), b"{broken");
    }

    #[test]
    fn test_json_body_bytes_preserved() {
        let ordered = Payload::from_body(Some("application/json"), br#"{"z":1,"a":2}"#).unwrap();
        assert_eq!(ordered.encoding, PayloadEncoding::Json);
        assert_eq!(served("application/json", br#"{"z":1,"a":2}"#), br#"{"z":1,"a":2}"#);

        let pretty = b"{\n  \"a\": 1\n}\n";
        assert_eq!(served("application/json", pretty), pretty);

        let big = br#"{"id":123456789012345678901234567890}"#;
        assert_eq!(served("application/json", big), big);
    }

    #[test]
    fn test_entry_without_encoding_field_reads_as_json() {
        let entry = CacheEntry::new(json!({"v": 1}), Headers::new(), 200, 30);
        let mut value = serde_json::to_value(&entry).unwrap();
        value.as_object_mut().unwrap().remove("encoding");
        let back: CacheEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back.encoding, PayloadEncoding::Json);
        assert_eq!(back.body().as_ref(), br#"{"v":1}"#);
    }

    #[test]
    fn test_binary_payload_not_storable() {
        assert!(Payload::from_body(Some("image/png"), &[0xff, 0xfe, 0x00]).is_none());
    }

    #[test]
    fn test_storable_headers_drop_hop_by_hop() {
        let mut headers = Headers::new();
        headers.insert("Content-Type".into(), "text/plain".into());
        headers.insert("Transfer-Encoding".into(), "chunked".into());
        headers.insert("connection".into(), "keep-alive".into());

        let kept = storable_headers(&headers);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get("content-type").map(String::as_str), Some("text/plain"));
    }

    #[test]
    fn test_store_ttl_rounds_up() {
        let entry = CacheEntry::new(json!(1), Headers::new(), 200, 1);
        let now = entry.created_at + ChronoDuration::milliseconds(1);
        assert_eq!(entry.store_ttl_at(now), 1);
        assert_eq!(entry.store_ttl_at(entry.created_at), 1);
        assert_eq!(entry.store_ttl_at(entry.expires_at()), 0);

        let entry = CacheEntry::new(json!(1), Headers::new(), 200, 300);
        let now = entry.created_at + ChronoDuration::milliseconds(1500);
        assert_eq!(entry.store_ttl_at(now), 299);
    }

    #[test]
    fn test_ttl_reaching() {
        let entry = CacheEntry::new(json!(1), Headers::new(), 200, 60);
        let target = entry.created_at + ChronoDuration::hours(2);
        assert_eq!(entry.ttl_reaching(target), 7200);
    }
}
