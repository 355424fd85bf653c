//! Relay Server - destination execution over HTTP.
//!
//! ## Configuration
//!
//! - `RELAY_CONFIG`: Path to the TOML config (default: "config/relay.toml")
//! - `PORT`: Overrides `server.port`
//! - `RUST_LOG`: Logging level (default: "info")

use relay::cache::MemoryCache;
use relay::config::RelayConfig;
use relay::server::{self, AppState};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// How often expired cache entries are swept.
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // 2. Load Configuration
    let config = match RelayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            RelayConfig::default()
        }
    };

    // 3. Build Registry with the shared cache
    let cache = Arc::new(MemoryCache::new());
    let registry = config.build_registry(cache.clone());
    info!(destinations = ?registry.list(), "Destinations ready");

    tokio::spawn(purge_cache(cache));

    let app = server::router(AppState::new(registry), config.server.max_body_bytes);

    // 4. Start Server
    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!("Relay Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    info!("Relay Server stopped");
}

async fn purge_cache(cache: Arc<MemoryCache>) {
    let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
    loop {
        interval.tick().await;
        let purged = cache.purge_expired();
        if purged > 0 {
            debug!(purged, remaining = cache.len(), "Purged expired cache entries");
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
