//! # Voice Gateway - Main Application Entry Point
//!
//! Real-time voice-streaming gateway. Clients stream audio over a WebSocket; the gateway
//! forwards every frame to a remote speech API through a bounded pool of upstream
//! connections and streams the API's audio back to the client.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every session, pool wait and upstream call is a suspended future,
//!   not a blocked thread
//! - **Traits**: The pool and sessions only see `RemoteAudioConnection`, never a concrete binding
//! - **Ownership**: A pooled connection is moved into exactly one session at a time
//! - **CancellationToken**: One root scope; shutting down cancels every session under it
//!
//! ## Application Architecture:
//! - **config**: Defaults, `config.toml`, `APP__*` and legacy environment variables
//! - **audio**: μ-law codec, chunking and the client-edge audio processor
//! - **upstream**: The remote audio connection trait and its HTTP / WebSocket bindings
//! - **pool**: Bounded, health-aware upstream connection pool
//! - **session**: Per-client read / dispatch / keepalive pipeline
//! - **websocket**: The `/ws` endpoint and its socket actor
//! - **state**: Shared state and gateway-wide counters
//! - **health**: Liveness, pool stats and metrics endpoints
//! - **error**: Domain error types and HTTP error responses

// Module declarations
mod audio;       // Audio codec (audio/ directory)
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod health;      // Health, stats and metrics endpoints (health.rs)
mod pool;        // Upstream connection pool (pool.rs)
mod session;     // Session pipeline (session.rs)
mod state;       // Application state management (state.rs)
mod upstream;    // Remote audio connections (upstream/ directory)
mod websocket;   // WebSocket endpoint (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::pool::ConnectionPool;
use crate::state::AppState;
use crate::upstream::UpstreamFactory;

/// How long in-flight HTTP work may take to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// The application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from `.env`, files and environment variables
/// 2. **Sets up logging** with the configured verbosity
/// 3. **Builds the upstream pool** (fatal if it cannot be built)
/// 4. **Serves** `/ws`, `/health`, `/stats` and `/api/v1/metrics`
/// 5. **Drains** on SIGINT/SIGTERM: sessions first, then the HTTP server, then the pool
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    // A missing API key stops the process here
    let config = AppConfig::load()?;
    config.validate()?;

    init_tracing(&config.log_filter())?;

    info!("Starting voice-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        transport = ?config.upstream.transport,
        pool_size = config.pool.max_size,
        client_encoding = ?config.audio.client_encoding,
        "Configuration loaded"
    );

    let factory = UpstreamFactory::from_config(&config)?;
    let pool = ConnectionPool::new(config.pool.max_size, config.acquire_timeout(), Arc::new(factory));

    let app_state = AppState::new(config.clone(), pool.clone());
    let shutdown = app_state.shutdown.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // Signals cancel the root scope; every session is a child of it
    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/ws", web::get().to(websocket::gateway_websocket))
            .route("/health", web::get().to(health::health_check))
            .route("/stats", web::get().to(health::pool_stats))
    })
    // Sessions end on their own through the root token
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, draining sessions...");
            if tokio::time::timeout(SHUTDOWN_GRACE, server_handle.stop(true)).await.is_err() {
                warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "Shutdown timed out, forcing stop");
                server_handle.stop(false).await;
            }
        }
    }

    pool.shutdown().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Overrides everything (e.g., "voice_gateway=trace")
/// - Otherwise `voice_gateway=<LOG_LEVEL>,actix_web=info`
fn init_tracing(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGTERM or SIGINT.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Failed to install signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        shutdown.cancel();
    });
}
