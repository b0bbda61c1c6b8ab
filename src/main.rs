//! Cachegate - caching reverse proxy

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cachegate::{
    cache::{CacheEngine, FreezeController},
    config::Args,
    logging::TracingErrorSink,
    proxy::HttpForwarder,
    server,
    services::CacheService,
    snapshot::{RetryPolicy, SnapshotStore},
    GatewayError,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("cachegate={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.json_logs() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let config = args.cache_config()?;

    info!("======================================");
    info!("  Cachegate - caching reverse proxy");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Upstream: {}", args.upstream);
    info!(
        "Memory tier: {} entries ({:?})",
        config.memory_max_entries, config.eviction_policy
    );
    info!(
        "Redis tier: {}",
        args.redis.redis_url.as_deref().unwrap_or("disabled")
    );
    match config.durable {
        Some(kind) => info!("Durable tier: {} ({})", kind, args.cache_dir.display()),
        None => info!("Durable tier: disabled"),
    }
    info!("Rules: {}", config.rules.len());
    if args.snapshots.snapshots_enabled {
        info!("Snapshot DB: {}", args.snapshots.snapshot_dir.display());
    } else {
        info!("Snapshot DB: disabled");
    }
    info!("======================================");

    let freeze = Arc::new(FreezeController::new());
    let engine = Arc::new(CacheEngine::build(config, freeze).await?);

    if args.cache_warmup {
        engine.warm_up(args.warmup_limit).await;
    }

    let snapshots = if args.snapshots.snapshots_enabled {
        let retry = RetryPolicy {
            max_attempts: args.snapshots.snapshot_max_retries.max(1),
            ..RetryPolicy::default()
        };
        match SnapshotStore::open(&args.snapshots.snapshot_dir, retry, Arc::new(TracingErrorSink)) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("Snapshot store unavailable, continuing without metadata: {}", e);
                None
            }
        }
    } else {
        None
    };

    let forwarder = HttpForwarder::new(&args.upstream, args.upstream_timeout())
        .map_err(|e| GatewayError::Http(e.to_string()))?;
    let forwarder = Arc::new(forwarder);
    let service = Arc::new(CacheService::new(Arc::clone(&engine), snapshots, forwarder));
    let state = Arc::new(server::AppState::new(args, service));

    tokio::select! {
        result = server::run(state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
    }

    engine.shutdown().await;
    info!("Cachegate stopped");
    Ok(())
}
