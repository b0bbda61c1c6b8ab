//! Liveness endpoint
//!
//! `/health` always answers 200 while the process is serving. Tier state is
//! reported for operators but never fails the check: a down Redis only
//! degrades the cache.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    /// `online`, or `degraded` when a configured tier is unreachable
    pub status: &'static str,
    pub version: &'static str,
    /// Seconds since startup
    pub uptime: u64,
    pub timestamp: String,
    pub tiers: TierHealth,
    pub global_freeze: bool,
}

#[derive(Debug, Serialize)]
pub struct TierHealth {
    pub memory_entries: usize,
    pub redis_enabled: bool,
    pub redis_connected: bool,
    pub durable_enabled: bool,
    pub snapshots_enabled: bool,
}

pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let engine = state.service.engine();
    let redis_enabled = engine.has_redis();
    let redis_connected = engine.redis_available();

    let status = if redis_enabled && !redis_connected {
        "degraded"
    } else {
        "online"
    };

    let body = HealthResponse {
        healthy: true,
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        tiers: TierHealth {
            memory_entries: engine.memory().len(),
            redis_enabled,
            redis_connected,
            durable_enabled: engine.has_durable(),
            snapshots_enabled: state.service.snapshots().is_some(),
        },
        global_freeze: engine.freeze().status().global_freeze,
    };

    super::json_response(StatusCode::OK, &body)
}
