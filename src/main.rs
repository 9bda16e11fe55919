//! predictive-cache: tiered response cache service.
//!
//! Serves cached lookups through a hierarchy of storage tiers:
//!   Hot (RAM) → Warm (RAM) → Cold (mounted network store)
//!
//! Exposes an admin HTTP API for stats, metrics, invalidation and job status.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use predictive_cache::cache::cold::{ColdStore, FileColdStore, InMemoryColdStore};
use predictive_cache::config::{Cli, Config};
use predictive_cache::metrics::CacheMetrics;
use predictive_cache::orchestrator::CacheOrchestrator;
use predictive_cache::server::admin_api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "predictive_cache=debug,tower_http=debug"
    } else {
        "predictive_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("predictive-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        hot = config.tiers.hot_capacity,
        warm = config.tiers.warm_capacity,
        shards = config.tiers.shards,
        ttl_secs = ?config.tiers.entry_ttl_secs,
        "Tier capacities"
    );
    info!(
        workers = config.queue.workers,
        queue_capacity = config.queue.capacity,
        rate_limit = config.rate_limit.max_requests,
        window_ms = config.rate_limit.window_ms,
        "Job pipeline"
    );

    // Pick the cold tier backend.
    let cold: Arc<dyn ColdStore> = match &config.cold.path {
        Some(path) => {
            info!(path = %path.display(), "Cold tier on mounted store");
            Arc::new(FileColdStore::new(path).await?)
        }
        None => {
            info!("No cold tier path configured, using in-memory cold tier");
            Arc::new(InMemoryColdStore::new())
        }
    };

    let metrics = Arc::new(CacheMetrics::new()?);
    let cache = Arc::new(CacheOrchestrator::start(&config, cold, metrics.clone()));

    // Build application state.
    let state = Arc::new(AppState {
        cache: cache.clone(),
        config: config.clone(),
        metrics,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    cache.shutdown().await;
    Ok(())
}
