//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::Args;
use crate::routes::{self, cache_admin::ADMIN_PREFIX};
use crate::services::{spawn_maintenance_task, CacheService};
use crate::types::GatewayError;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub service: Arc<CacheService>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, service: Arc<CacheService>) -> Self {
        Self {
            args,
            service,
            started_at: Instant::now(),
        }
    }
}

/// Bind, start background maintenance and serve until the process exits
pub async fn run(state: Arc<AppState>) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(state.args.listen).await?;
    info!("Cachegate listening on {}", state.args.listen);

    spawn_maintenance_task(Arc::clone(&state.service), state.args.cleanup_interval());

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .serve_connection(io, service)
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("[{}] {} {}", addr, method, path);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") | (&Method::GET, "/healthz") => routes::health_check(&state),
        _ if is_admin_path(&path) => {
            routes::handle_cache_admin_request(req, Arc::clone(&state.service)).await
        }
        _ => routes::handle_proxy_request(req, Arc::clone(&state.service)).await,
    };

    Ok(response)
}

fn is_admin_path(path: &str) -> bool {
    path == ADMIN_PREFIX || path.starts_with(&format!("{}/", ADMIN_PREFIX))
}
