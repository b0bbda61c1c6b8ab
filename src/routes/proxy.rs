//! Caching proxy handler
//!
//! Every request outside the admin and health routes lands here. Hits are
//! answered from the cache with `X-Cache: HIT-<TIER>`. Misses are forwarded
//! to the origin, returned with `X-Cache: MISS` and stored in the background.
//! Cache trouble never turns into a 5xx; only an unreachable origin does.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request, Response, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error_response;
use crate::cache::entry::is_hop_by_hop;
use crate::cache::{CacheHit, CacheRequest, Headers};
use crate::proxy::{ForwardRequest, ForwardResponse};
use crate::services::CacheService;

pub const X_CACHE: &str = "x-cache";

pub async fn handle_proxy_request(
    req: Request<Incoming>,
    service: Arc<CacheService>,
) -> Response<Full<Bytes>> {
    let method = req.method().as_str().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = collect_headers(req.headers());

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return error_response(StatusCode::BAD_REQUEST, "Failed to read body", "BAD_REQUEST");
        }
    };
    let body = (!body.is_empty()).then_some(body);

    let mut cache_request = CacheRequest::new(&method, &target).with_headers(headers.clone());
    cache_request.body = body.clone();

    if let Some(hit) = service.lookup(&cache_request).await {
        debug!(key = %hit.key, source = hit.source.header_value(), "Serving from cache");
        return cached_response(&hit);
    }
    let cacheable = service.engine().evaluate(&cache_request, None).cacheable;

    let forward = ForwardRequest {
        method,
        path_and_query: target,
        headers,
        body,
    };
    let origin = match service.forwarder().forward(forward).await {
        Ok(response) => response,
        Err(e) => {
            warn!(url = %cache_request.url, error = %e, "Origin request failed");
            return error_response(StatusCode::BAD_GATEWAY, &e.to_string(), "UPSTREAM_ERROR");
        }
    };

    let response = origin_response(&origin, if cacheable { "MISS" } else { "BYPASS" });
    if cacheable {
        tokio::spawn(async move {
            let outcome = service.store(&cache_request, &origin).await;
            debug!(url = %cache_request.url, stored = outcome.is_stored(), "Origin response processed");
        });
    }
    response
}

/// Lower-cased request headers, connection headers removed
pub fn collect_headers(map: &HeaderMap) -> Headers {
    map.iter()
        .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn build_response(status: u16, headers: &Headers, body: Bytes, x_cache: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    let out = response.headers_mut();
    for (name, value) in headers {
        if is_hop_by_hop(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.append(name, value);
        }
    }
    out.insert(X_CACHE, HeaderValue::from_static(x_cache));
    response
}

pub fn cached_response(hit: &CacheHit) -> Response<Full<Bytes>> {
    build_response(
        hit.entry.status,
        &hit.entry.headers,
        hit.entry.body(),
        hit.source.header_value(),
    )
}

pub fn origin_response(origin: &ForwardResponse, x_cache: &'static str) -> Response<Full<Bytes>> {
    build_response(origin.status, &origin.headers, origin.body.clone(), x_cache)
}
