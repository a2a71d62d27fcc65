//! # Call Processing Backend
//!
//! Service entry point. Ingests audio-metadata packets for telephone calls
//! over HTTP, persists them in Postgres, drives a per-call AI processing
//! worker with bounded retries, and pushes state changes to dashboard
//! clients over WebSocket.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment)
//! - **store**: transactional persistence and row-lock primitives
//! - **calls**: ingestion coordinator and the per-call processor
//! - **transcription**: the fallible transcription client contract
//! - **notifier**: state-change fan-out to subscribers
//! - **handlers / websocket / health**: the HTTP and WebSocket surface
//! - **middleware**: request logging and metrics
//! - **error**: HTTP error envelope

mod calls;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod notifier;
mod state;
mod store;
mod transcription;
mod websocket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calls::{CallProcessor, IngestionCoordinator};
use config::AppConfig;
use notifier::Notifier;
use state::AppState;
use store::postgres::PgCallStore;
use store::CallStore;
use transcription::MockTranscriptionClient;

/// Set by the signal handler; the main task polls it to stop the server.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::load()?;
    config.validate()?;
    init_tracing(&config.logging.level);

    info!(
        "starting call-processing-backend v{}",
        env!("CARGO_PKG_VERSION")
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database.url)
        .await
        .context("could not connect to the database")?;

    let pg_store = PgCallStore::new(pool);
    pg_store
        .init_schema()
        .await
        .context("schema initialization failed")?;
    info!("database schema ready");

    // Wire the pipeline: store -> processor -> coordinator, sharing the
    // live configuration so the retry budget can change at runtime.
    let store: Arc<dyn CallStore> = Arc::new(pg_store);
    let shared_config = Arc::new(RwLock::new(config.clone()));
    let notifier = Arc::new(Notifier::new());
    let transcription_client = Arc::new(MockTranscriptionClient::new(
        config.processing.ai_failure_rate,
    ));
    let processor = Arc::new(CallProcessor::new(
        store.clone(),
        transcription_client,
        notifier.clone(),
        shared_config.clone(),
    ));
    let coordinator = Arc::new(IngestionCoordinator::new(store.clone(), processor));

    let app_state = AppState::new(shared_config, store, notifier, coordinator);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/v1")
                    .route(
                        "/call/stream/{call_id}",
                        web::post().to(handlers::ingest_packet),
                    )
                    .route(
                        "/call/{call_id}/status",
                        web::get().to(handlers::call_status),
                    )
                    .route(
                        "/call/{call_id}/result",
                        web::get().to(handlers::call_result),
                    )
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/", web::get().to(health::root))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route(
                "/ws/dashboard",
                web::get().to(websocket::dashboard_websocket),
            )
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
                        error!("server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("shutdown signal received, stopping server");
            server_handle.stop(true).await;
        }
    }

    info!("server stopped gracefully");
    Ok(())
}

/// Console logging with an EnvFilter. `RUST_LOG` overrides the configured
/// level when set.
fn init_tracing(level: &str) {
    let default_filter = format!(
        "call_processing_backend={},actix_web=info,sqlx=warn",
        level
    );
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Flip the shutdown flag on SIGTERM or SIGINT so in-flight requests can
/// finish before the process exits.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
