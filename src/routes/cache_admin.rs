//! Cache administration routes (`/admin/cache/*`)
//!
//! Endpoints:
//! - `GET    /admin/cache/entries`               list ledger rows + aggregates
//! - `GET    /admin/cache/entries/{key}`         metadata + live payload
//! - `PATCH  /admin/cache/entries/{key}`         partial metadata update
//! - `DELETE /admin/cache/entries/{key}`         remove from tiers + ledger
//! - `POST   /admin/cache/entries/{key}/refresh` re-fetch from the origin
//! - `GET    /admin/cache/stats`
//! - `POST   /admin/cache/cleanup`
//! - `POST   /admin/cache/clear`
//! - `GET|POST /admin/cache/freeze`
//! - `POST   /admin/cache/invalidate/{pattern,age,tags}`
//!
//! Keys are percent-encoded in the path.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{error_response, json_response, not_found_response};
use crate::services::{
    CacheService, FreezeRequest, RefreshOptions, RefreshOutcome, ServiceError,
};
use crate::snapshot::{default_limit, SnapshotFilter, SnapshotUpdate};

pub const ADMIN_PREFIX: &str = "/admin/cache";

/// Parsed admin endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRoute {
    ListEntries,
    GetEntry(String),
    UpdateEntry(String),
    DeleteEntry(String),
    RefreshEntry(String),
    Stats,
    Cleanup,
    Clear,
    FreezeStatus,
    SetFreeze,
    InvalidatePattern,
    InvalidateAge,
    InvalidateTags,
}

impl AdminRoute {
    /// Match a method and full request path. `None` for unknown endpoints.
    pub fn parse(method: &Method, path: &str) -> Option<Self> {
        let rest = path.strip_prefix(ADMIN_PREFIX)?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        let route = match (method, segments.as_slice()) {
            (&Method::GET, ["entries"]) => AdminRoute::ListEntries,
            (&Method::GET, ["entries", key]) => AdminRoute::GetEntry(decode_key(key)?),
            (&Method::PATCH, ["entries", key]) => AdminRoute::UpdateEntry(decode_key(key)?),
            (&Method::DELETE, ["entries", key]) => AdminRoute::DeleteEntry(decode_key(key)?),
            (&Method::POST, ["entries", key, "refresh"]) => {
                AdminRoute::RefreshEntry(decode_key(key)?)
            }
            (&Method::GET, ["stats"]) => AdminRoute::Stats,
            (&Method::POST, ["cleanup"]) => AdminRoute::Cleanup,
            (&Method::POST, ["clear"]) => AdminRoute::Clear,
            (&Method::GET, ["freeze"]) => AdminRoute::FreezeStatus,
            (&Method::POST, ["freeze"]) => AdminRoute::SetFreeze,
            (&Method::POST, ["invalidate", "pattern"]) => AdminRoute::InvalidatePattern,
            (&Method::POST, ["invalidate", "age"]) => AdminRoute::InvalidateAge,
            (&Method::POST, ["invalidate", "tags"]) => AdminRoute::InvalidateTags,
            _ => return None,
        };
        Some(route)
    }
}

fn decode_key(raw: &str) -> Option<String> {
    urlencoding::decode(raw)
        .ok()
        .map(|k| k.into_owned())
        .filter(|k| !k.is_empty())
}

/// Query string of `GET /entries`
#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub method: Option<String>,
    pub url: Option<String>,
    pub backend_host: Option<String>,
    pub manual: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub expires_after: Option<DateTime<Utc>>,
    pub expires_before: Option<DateTime<Utc>>,
    /// Comma separated
    pub tags: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListQuery {
    pub fn parse(query: Option<&str>) -> Result<Self, String> {
        match query {
            Some(q) if !q.is_empty() => {
                serde_urlencoded::from_str(q).map_err(|e| format!("Invalid query: {}", e))
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn into_filter(self) -> SnapshotFilter {
        SnapshotFilter {
            method: self.method,
            url: self.url,
            backend_host: self.backend_host,
            manual: self.manual,
            created_after: self.created_after,
            created_before: self.created_before,
            expires_after: self.expires_after,
            expires_before: self.expires_before,
            tags: self
                .tags
                .map(|t| {
                    t.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            limit: self.limit.unwrap_or_else(default_limit).clamp(1, 1000),
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PatternBody {
    pattern: String,
}

#[derive(Debug, Deserialize)]
struct AgeBody {
    age_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct TagsBody {
    tags: Vec<String>,
}

/// Handle a request under `/admin/cache`
pub async fn handle_cache_admin_request(
    req: Request<Incoming>,
    service: Arc<CacheService>,
) -> Response<Full<Bytes>> {
    let path = req.uri().path().to_string();
    let Some(route) = AdminRoute::parse(req.method(), &path) else {
        return not_found_response(&path);
    };
    let query = req.uri().query().map(str::to_string);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "Failed to read admin request body");
            return error_response(StatusCode::BAD_REQUEST, "Failed to read body", "BAD_REQUEST");
        }
    };

    dispatch(route, query.as_deref(), &body, &service).await
}

/// Execute a parsed admin route
pub async fn dispatch(
    route: AdminRoute,
    query: Option<&str>,
    body: &Bytes,
    service: &CacheService,
) -> Response<Full<Bytes>> {
    debug!(route = ?route, "Cache admin request");

    match route {
        AdminRoute::ListEntries => match ListQuery::parse(query) {
            Ok(q) => respond(service.list(q.into_filter()).await),
            Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg, "BAD_REQUEST"),
        },
        AdminRoute::GetEntry(key) => respond(service.get_entry(&key).await),
        AdminRoute::UpdateEntry(key) => match parse_body::<SnapshotUpdate>(body) {
            Ok(update) => respond(service.update(&key, update).await),
            Err(resp) => resp,
        },
        AdminRoute::DeleteEntry(key) => respond(service.delete(&key).await),
        AdminRoute::RefreshEntry(key) => {
            let options = if body.is_empty() {
                RefreshOptions::default()
            } else {
                match parse_body::<RefreshOptions>(body) {
                    Ok(o) => o,
                    Err(resp) => return resp,
                }
            };
            match service.refresh(&key, options).await {
                Ok(outcome @ RefreshOutcome::InProgress { .. }) => {
                    json_response(StatusCode::CONFLICT, &outcome)
                }
                Ok(outcome) => json_response(StatusCode::OK, &outcome),
                Err(e) => service_error_response(&e),
            }
        }
        AdminRoute::Stats => json_response(StatusCode::OK, &service.stats().await),
        AdminRoute::Cleanup => respond(service.cleanup().await),
        AdminRoute::Clear => respond(service.clear().await),
        AdminRoute::FreezeStatus => {
            json_response(StatusCode::OK, &service.engine().freeze().status())
        }
        AdminRoute::SetFreeze => match parse_body::<FreezeRequest>(body) {
            Ok(request) => respond(service.freeze(request)),
            Err(resp) => resp,
        },
        AdminRoute::InvalidatePattern => match parse_body::<PatternBody>(body) {
            Ok(b) => respond(service.invalidate_pattern(&b.pattern).await),
            Err(resp) => resp,
        },
        AdminRoute::InvalidateAge => match parse_body::<AgeBody>(body) {
            Ok(b) => respond(service.invalidate_age(b.age_seconds).await),
            Err(resp) => resp,
        },
        AdminRoute::InvalidateTags => match parse_body::<TagsBody>(body) {
            Ok(b) => respond(service.invalidate_tags(b.tags).await),
            Err(resp) => resp,
        },
    }
}

#[allow(clippy::result_large_err)]
fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, Response<Full<Bytes>>> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid JSON body: {}", e),
            "BAD_REQUEST",
        )
    })
}

fn respond<T: serde::Serialize>(result: Result<T, ServiceError>) -> Response<Full<Bytes>> {
    match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => service_error_response(&e),
    }
}

fn service_error_response(e: &ServiceError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(error = %e, "Cache admin request failed");
    }
    error_response(status, &e.to_string(), e.code())
}
