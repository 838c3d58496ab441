//! dispatchd server binary.

use dispatchd_api::{AppState, routes};
use dispatchd_config::ServerConfig;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Cadence of the expiry sweeps over jobs and cached repositories.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (path from the first argument, if given)
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "dispatchd.yaml".to_string());
    let config = ServerConfig::load(&config_path)?;

    // Create app state
    let state = AppState::new(&config)?;

    // Periodic reclamation of stale jobs and idle repository copies
    let sweeper = state.clone();
    let job_max_age = config.compilation.job_expiration_seconds;
    let repo_max_age = config.git.cache_expiration_seconds;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.tick().await; // the first tick fires immediately
        loop {
            tick.tick().await;
            sweeper.scheduler.sweep_expired(job_max_age);
            sweeper.cache.evict_idle(repo_max_age).await;
        }
    });

    // Build router
    let app = routes::router(state.clone())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    // Start server
    let listener =
        TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    info!("Starting server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    // Let in-flight builds finish before exiting
    state.scheduler.shutdown().await;
    info!("Server stopped");

    Ok(())
}
