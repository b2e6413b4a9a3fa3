//! # Parley Server
//!
//! Real-time chat server: rooms, messages and presence over socket.io-style
//! polling and WebSocket transports.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with a specific config file
//! parley --config /path/to/parley.toml
//!
//! # Same, layered with environment overrides
//! PARLEY_CONFIG=/path/to/parley.toml parley
//!
//! # Override settings from the environment
//! PARLEY_PORT=8080 PARLEY_HOST=0.0.0.0 PARLEY__STORAGE__DATABASE=/tmp/chat.db parley
//! ```

mod chat;
mod config;
mod http;
mod metrics;
mod rest;

use anyhow::{Context, Result};
use parley_core::{BroadcastRegistry, EventRouter, PresenceManager};
use parley_store::{ChatStore, SqliteStore};
use parley_transport::Engine;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::chat::ChatService;
use crate::http::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_core=debug,parley_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::args().skip_while(|arg| arg != "--config").nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };
    let addr = config.bind_addr()?;

    info!("Starting Parley server on {}", addr);

    metrics::init_metrics();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let database = config.database_path();
    let sqlite = Arc::new(
        SqliteStore::open(&database, config.storage.max_connections)
            .await
            .with_context(|| format!("Failed to open database {}", database.display()))?,
    );
    let store: Arc<dyn ChatStore> = sqlite.clone();

    let registry = Arc::new(BroadcastRegistry::new());
    let presence = PresenceManager::new(store.clone(), registry.clone(), config.call_timeout());
    let chat = Arc::new(ChatService::new(
        store.clone(),
        registry.clone(),
        presence.clone(),
        config.call_timeout(),
    ));

    let mut router = EventRouter::new(registry.clone());
    chat.register(&mut router)
        .context("Failed to register chat handlers")?;
    let engine = Engine::new(config.engine_config(), Arc::new(router));

    let cancel = CancellationToken::new();
    let sweeper = presence.spawn_sweeper(
        Duration::from_secs(config.presence.sweep_interval_secs),
        Duration::from_secs(config.presence.stale_after_secs),
        cancel.clone(),
    );
    let reporter = metrics::spawn_gauge_reporter(
        engine.clone(),
        registry.clone(),
        Duration::from_secs(5),
        cancel.clone(),
    );

    let state = Arc::new(AppState {
        engine: engine.clone(),
        store,
        config: config.clone(),
    });
    let app = http::router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Parley server listening on {}", addr);
    info!("Engine endpoint: http://{}{}", addr, config.transport.path);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(engine, cancel))
    .await
    .context("Server error")?;

    let _ = tokio::join!(sweeper, reporter);
    sqlite.close().await;
    info!("Shutdown complete");

    Ok(())
}

/// Wait for ctrl-c, then stop background tasks and close every session.
async fn shutdown_signal(engine: Engine, cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
    info!("Shutting down");
    cancel.cancel();
    engine.shutdown().await;
}
