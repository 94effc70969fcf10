//! # Call Relay Backend - Main Application Entry Point
//!
//! An Actix-web server that pairs callers with operators over WebSockets,
//! relays binary audio between them in real time, and records each
//! direction to time-windowed `.webm` segments on disk.
//!
//! ## Application Architecture:
//! - **config**: TOML file + environment variable configuration
//! - **state**: Shared application state and HTTP metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and per-endpoint metrics
//! - **handlers**: The HTTP query surface (segments, sessions, config)
//! - **relay**: Pairing, forwarding, buffering, segment storage
//! - **websocket**: The `/ws/client` and `/ws/operator` peer transport
//! - **error**: Custom error types and HTTP error responses

mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod relay;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use relay::registry::CallRegistry;
use relay::storage::SegmentStore;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting call-relay-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, audio dir {}",
        config.server.host, config.server.port, config.storage.audio_dir
    );

    // The registry captures the flush interval and queue bound at startup;
    // runtime config updates to those take effect on the next restart.
    let store = SegmentStore::new(&config.storage.audio_dir)?;
    let registry = Arc::new(CallRegistry::new(
        store,
        Duration::from_secs(config.storage.flush_interval_secs),
        config.performance.max_waiting_peers,
    ));

    let app_state = AppState::new(config.clone(), registry);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

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
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // Real-time peer endpoints
            .route("/ws/client", web::get().to(websocket::client_websocket))
            .route("/ws/operator", web::get().to(websocket::operator_websocket))
            // Session and segment query surface
            .route(
                "/session_files/{session_id}",
                web::get().to(handlers::list_session_files),
            )
            .route("/audio/{session_id}", web::get().to(handlers::session_audio))
            .route(
                "/audio/download/{filename}",
                web::get().to(handlers::download_segment),
            )
            .route("/active_sessions", web::get().to(handlers::active_sessions))
            .route(
                "/sessions/{session_id}/files",
                web::delete().to(handlers::purge_session_files),
            )
            // Management API
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            // Health check at root level for load balancers
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console logging via tracing; `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_relay_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag; cheap enough at a 100ms cadence.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
