//! Origin forwarding
//!
//! The cache never talks to the origin itself. The proxy path and the admin
//! refresh operation go through a [`Forwarder`], which keeps the HTTP client
//! swappable in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::cache::entry::{is_hop_by_hop, Headers};

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Upstream request failed: {0}")]
    Request(String),

    #[error("Upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Failed to read upstream body: {0}")]
    Body(String),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
}

/// Request to replay against the origin
#[derive(Debug, Clone, Default)]
pub struct ForwardRequest {
    pub method: String,
    /// Path and query relative to the upstream base
    pub path_and_query: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

/// Origin response with connection headers removed
#[derive(Debug, Clone)]
pub struct ForwardResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl ForwardResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError>;

    /// Host recorded as `backend_host` in snapshot metadata
    fn backend_host(&self) -> String;
}

/// `reqwest` forwarder against a fixed upstream base URL
pub struct HttpForwarder {
    base: Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(upstream: &str, timeout: Duration) -> Result<Self, ForwardError> {
        let base = Url::parse(upstream).map_err(|e| ForwardError::InvalidUrl(format!("{}: {}", upstream, e)))?;
        if base.cannot_be_a_base() {
            return Err(ForwardError::InvalidUrl(upstream.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("cachegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForwardError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base,
            client,
            timeout,
        })
    }

    /// Join a request target onto the base URL, keeping any base path prefix
    pub fn target_url(&self, path_and_query: &str) -> Result<Url, ForwardError> {
        let base_path = self.base.path().trim_end_matches('/');
        let relative = if path_and_query.starts_with('/') {
            path_and_query.to_string()
        } else {
            format!("/{}", path_and_query)
        };
        let joined = format!(
            "{}://{}{}{}",
            self.base.scheme(),
            authority(&self.base),
            base_path,
            relative
        );
        Url::parse(&joined).map_err(|e| ForwardError::InvalidUrl(format!("{}: {}", joined, e)))
    }
}

fn authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ForwardError> {
        let url = self.target_url(&request.path_and_query)?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| ForwardError::Request(format!("Invalid method {}: {}", request.method, e)))?;

        let mut builder = self.client.request(method, url.clone());
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        debug!(method = %request.method, url = %url, "Forwarding to upstream");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ForwardError::Timeout(self.timeout)
            } else {
                ForwardError::Request(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers: Headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(|e| ForwardError::Body(e.to_string()))?;

        Ok(ForwardResponse {
            status,
            headers,
            body,
        })
    }

    fn backend_host(&self) -> String {
        authority(&self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_keeps_base_path() {
        let fwd = HttpForwarder::new("http://origin.local:8080/api/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            fwd.target_url("/users?id=3").unwrap().as_str(),
            "http://origin.local:8080/api/users?id=3"
        );
        assert_eq!(fwd.backend_host(), "origin.local:8080");
    }

    #[test]
    fn test_target_url_without_base_path() {
        let fwd = HttpForwarder::new("https://origin.local", Duration::from_secs(5)).unwrap();
        assert_eq!(
            fwd.target_url("items").unwrap().as_str(),
            "https://origin.local/items"
        );
    }

    #[test]
    fn test_rejects_invalid_upstream() {
        assert!(matches!(
            HttpForwarder::new("not a url", Duration::from_secs(1)),
            Err(ForwardError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_request_error() {
        let fwd = HttpForwarder::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let result = fwd
            .forward(ForwardRequest {
                method: "GET".into(),
                path_and_query: "/".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(
            result,
            Err(ForwardError::Request(_)) | Err(ForwardError::Timeout(_))
        ));
    }
}
