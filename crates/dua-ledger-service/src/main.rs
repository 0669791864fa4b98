//! DUA Ledger Service - HTTP API for credits and generation jobs
//!
//! This is the main entry point for the dua-ledger service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dua_ledger_service::jobs::spawn_periodic;
use dua_ledger_service::{create_router, AppState, ServiceConfig};
use dua_ledger_store::{MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dua_ledger=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting DUA Ledger Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        database_configured = %config.database_url.is_some(),
        suno_configured = %config.suno.api_key.is_some(),
        runway_configured = %config.runway.api_key.is_some(),
        callbacks = ?config.public_base_url,
        job_timeout_secs = config.tracking.job_timeout.as_secs(),
        "Service configuration loaded"
    );

    let store: Arc<dyn Store> = if let Some(url) = &config.database_url {
        tracing::info!(max_connections = config.database_max_connections, "Connecting to PostgreSQL");
        let store = PgStore::connect(url, config.database_max_connections).await?;
        store.migrate().await?;
        Arc::new(store)
    } else {
        tracing::warn!("DATABASE_URL not set - using in-memory store, data is lost on restart");
        Arc::new(MemoryStore::new())
    };

    // Build app state
    let state = AppState::new(store, config.clone());
    let tracker = state.tracker.clone();

    // Pick up jobs that were in flight before the restart; the first sweep
    // tick runs immediately.
    tracker.resume().await?;
    let sweeper = spawn_periodic(tracker.clone(), config.tracking.sweep_interval);

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Provider jobs keep running; they are resumed on next start.
    tracker.shutdown();
    sweeper.await?;
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
