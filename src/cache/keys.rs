//! Cache key derivation
//!
//! Keys have the shape `METHOD::normalized-url::sorted-headers::body-hash`.
//! Long keys are collapsed to a readable prefix plus a SHA-256 digest.

use sha2::{Digest, Sha256};
use url::Url;

use super::entry::Headers;

/// Headers that vary per client and never distinguish cached responses
pub const DEFAULT_EXCLUDED_HEADERS: &[&str] = &[
    "user-agent",
    "connection",
    "accept-encoding",
    "cache-control",
    "pragma",
    "date",
    "x-request-id",
    "x-forwarded-for",
    "x-forwarded-proto",
    "x-real-ip",
    "content-length",
];

/// Key derivation settings
#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// Re-serialize query parameters in sorted order
    pub normalize_urls: bool,
    /// When set, only these headers (lower-cased) participate in the key
    pub include_headers: Option<Vec<String>>,
    /// Headers dropped when no include-list is set
    pub exclude_headers: Vec<String>,
    /// Use a body digest instead of the raw body
    pub hash_body: bool,
    /// Keys longer than this are hashed (when `hash_long_keys`)
    pub max_key_length: usize,
    pub hash_long_keys: bool,
    /// Readable characters kept in front of a hashed key (0 = none)
    pub readable_prefix_len: usize,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            normalize_urls: true,
            include_headers: None,
            exclude_headers: DEFAULT_EXCLUDED_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
            hash_body: true,
            max_key_length: 250,
            hash_long_keys: true,
            readable_prefix_len: 32,
        }
    }
}

/// Hex-encoded SHA-256 of arbitrary bytes
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Deterministic cache key generator
#[derive(Debug, Clone, Default)]
pub struct KeyCodec {
    config: KeyConfig,
}

impl KeyCodec {
    pub fn new(mut config: KeyConfig) -> Self {
        if let Some(ref mut include) = config.include_headers {
            for h in include.iter_mut() {
                *h = h.to_ascii_lowercase();
            }
        }
        for h in config.exclude_headers.iter_mut() {
            *h = h.to_ascii_lowercase();
        }
        Self { config }
    }

    pub fn config(&self) -> &KeyConfig {
        &self.config
    }

    /// Derive the cache key for a request. Never fails: if the URL cannot be
    /// normalized the key falls back to `METHOD::url-hash`.
    pub fn generate_key(
        &self,
        method: &str,
        url: &str,
        headers: &Headers,
        body: Option<&[u8]>,
    ) -> String {
        let method = method.to_ascii_uppercase();

        let normalized = if self.config.normalize_urls {
            match normalize_url(url) {
                Some(u) => u,
                None => return Self::coarse_key(&method, url),
            }
        } else {
            url.to_string()
        };

        let header_part = self.header_fragment(headers);
        let body_part = match body {
            Some(b) if !b.is_empty() => {
                if self.config.hash_body {
                    sha256_hex(b)
                } else {
                    String::from_utf8_lossy(b).into_owned()
                }
            }
            _ => String::new(),
        };

        let key = format!("{}::{}::{}::{}", method, normalized, header_part, body_part);

        if self.config.hash_long_keys && key.len() > self.config.max_key_length {
            return self.hashed_key(&key);
        }
        key
    }

    /// Method plus URL digest, used when the full derivation cannot run
    pub fn coarse_key(method: &str, url: &str) -> String {
        format!("{}::{}", method.to_ascii_uppercase(), sha256_hex(url.as_bytes()))
    }

    /// Filtered headers as sorted `name:value` pairs joined by `|`
    fn header_fragment(&self, headers: &Headers) -> String {
        let mut pairs: Vec<String> = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .filter(|(k, _)| match &self.config.include_headers {
                Some(include) => include.iter().any(|h| h == k),
                None => !self.config.exclude_headers.iter().any(|h| h == k),
            })
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        pairs.sort();
        pairs.join("|")
    }

    fn hashed_key(&self, key: &str) -> String {
        let digest = sha256_hex(key.as_bytes());
        if self.config.readable_prefix_len == 0 {
            return digest;
        }
        let prefix: String = key
            .chars()
            .take(self.config.readable_prefix_len)
            .map(|c| if c.is_ascii_graphic() { c } else { '_' })
            .collect();
        format!("{}#{}", prefix, digest)
    }
}

/// Parse a URL and re-serialize its query with keys in sorted order.
/// Relative targets (path + query) are resolved against a placeholder base
/// and returned relative again.
pub fn normalize_url(raw: &str) -> Option<String> {
    const PLACEHOLDER: &str = "http://cachegate.invalid";

    let (mut parsed, relative) = match Url::parse(raw) {
        Ok(u) => (u, false),
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(PLACEHOLDER).ok()?;
            (base.join(raw).ok()?, true)
        }
        Err(_) => return None,
    };

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }
    parsed.set_fragment(None);

    if relative {
        let mut out = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            out.push('?');
            out.push_str(q);
        }
        Some(out)
    } else {
        Some(parsed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_deterministic() {
        let codec = KeyCodec::default();
        let h = headers(&[("accept", "application/json")]);
        let k1 = codec.generate_key("get", "/api/items?b=2&a=1", &h, None);
        let k2 = codec.generate_key("GET", "/api/items?b=2&a=1", &h, None);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("GET::"));
    }

    #[test]
    fn test_query_order_normalized() {
        let codec = KeyCodec::default();
        let h = Headers::new();
        let k1 = codec.generate_key("GET", "/api/items?b=2&a=1", &h, None);
        let k2 = codec.generate_key("GET", "/api/items?a=1&b=2", &h, None);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_normalization_disabled_keeps_order() {
        let codec = KeyCodec::new(KeyConfig {
            normalize_urls: false,
            ..KeyConfig::default()
        });
        let h = Headers::new();
        let k1 = codec.generate_key("GET", "/x?b=2&a=1", &h, None);
        let k2 = codec.generate_key("GET", "/x?a=1&b=2", &h, None);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_absolute_url_normalized() {
        assert_eq!(
            normalize_url("https://api.example.com/v1?z=1&a=2#frag").as_deref(),
            Some("https://api.example.com/v1?a=2&z=1")
        );
        assert_eq!(normalize_url("/plain").as_deref(), Some("/plain"));
    }

    #[test]
    fn test_different_headers_different_keys() {
        let codec = KeyCodec::default();
        let k1 = codec.generate_key("GET", "/x", &headers(&[("accept-language", "en")]), None);
        let k2 = codec.generate_key("GET", "/x", &headers(&[("accept-language", "fr")]), None);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_excluded_headers_ignored() {
        let codec = KeyCodec::default();
        let k1 = codec.generate_key("GET", "/x", &headers(&[("user-agent", "curl")]), None);
        let k2 = codec.generate_key("GET", "/x", &headers(&[("User-Agent", "firefox")]), None);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_include_list_wins() {
        let codec = KeyCodec::new(KeyConfig {
            include_headers: Some(vec!["X-Tenant".into()]),
            ..KeyConfig::default()
        });
        let k1 = codec.generate_key(
            "GET",
            "/x",
            &headers(&[("x-tenant", "a"), ("accept", "json")]),
            None,
        );
        let k2 = codec.generate_key(
            "GET",
            "/x",
            &headers(&[("x-tenant", "a"), ("accept", "xml")]),
            None,
        );
        let k3 = codec.generate_key("GET", "/x", &headers(&[("x-tenant", "b")]), None);
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_different_bodies_different_keys() {
        let codec = KeyCodec::default();
        let h = Headers::new();
        let k1 = codec.generate_key("POST", "/search", &h, Some(br#"{"q":"a"}"#));
        let k2 = codec.generate_key("POST", "/search", &h, Some(br#"{"q":"b"}"#));
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_long_keys_hashed_to_fixed_length() {
        let codec = KeyCodec::new(KeyConfig {
            max_key_length: 64,
            ..KeyConfig::default()
        });
        let h = Headers::new();
        let base = "/very/long/path/".repeat(10);
        let k1 = codec.generate_key("GET", &format!("{}alpha", base), &h, None);
        let k2 = codec.generate_key("GET", &format!("{}omega", base), &h, None);

        assert_eq!(k1.len(), k2.len());
        assert_eq!(k1.len(), 32 + 1 + 64);
        // Identical up to the truncation point, still distinct
        assert_ne!(k1, k2);
        assert_eq!(&k1[..32], &k2[..32]);
    }

    #[test]
    fn test_long_keys_kept_when_hashing_disabled() {
        let codec = KeyCodec::new(KeyConfig {
            max_key_length: 16,
            hash_long_keys: false,
            ..KeyConfig::default()
        });
        let key = codec.generate_key("GET", "/this/is/longer/than/sixteen", &Headers::new(), None);
        assert!(key.len() > 16);
        assert!(key.contains("/this/is/longer/than/sixteen"));
    }

    #[test]
    fn test_unparseable_url_falls_back() {
        let codec = KeyCodec::default();
        let key = codec.generate_key("get", "http://[::1", &Headers::new(), None);
        assert_eq!(key, KeyCodec::coarse_key("GET", "http://[::1"));
        assert_eq!(key.len(), "GET::".len() + 64);
    }
}
