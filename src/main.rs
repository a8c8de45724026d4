//! # Whisper Speech-to-Text Backend
//!
//! HTTP service wrapping a Whisper inference engine behind a single-slot
//! model lifecycle: the model loads lazily on first use, stays warm across
//! requests, degrades to a smaller variant when a load fails, and is evicted
//! after an idle period to free device memory.
//!
//! ## Modules:
//! - **config**: Layered configuration (config.toml + environment)
//! - **device**: Accelerator probing and device/precision resolution
//! - **engine**: The inference boundary and the candle Whisper implementation
//! - **lifecycle**: The model slot, eviction timer, and preference store
//! - **export**: Transcript rendering for downloads (txt/srt/vtt)
//! - **handlers**: HTTP endpoints
//! - **health / middleware / state / error**: Service plumbing

mod config;
mod device;
mod engine;
mod error;
mod export;
mod handlers;
mod health;
mod lifecycle;
mod middleware;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use engine::whisper::WhisperEngineFactory;
use lifecycle::prefs::PreferenceStore;
use lifecycle::ModelManager;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting whisper-stt-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let device_pref = config
        .model
        .device
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid device setting: {}", e))?;
    let compute_pref = config
        .model
        .compute_type
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid compute_type setting: {}", e))?;

    let manager = ModelManager::new(
        Arc::new(WhisperEngineFactory),
        PreferenceStore::new(&config.model.settings_file, &config.model.default_model),
        device_pref,
        compute_pref,
        Duration::from_secs(config.model.unload_delay_secs),
    );

    let app_state = AppState::new(config.clone(), manager);
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
            .wrap(middleware::RequestLogging)
            .route("/", web::get().to(handlers::root))
            .route("/health", web::get().to(health::health_check))
            .route("/models", web::get().to(handlers::list_models))
            .route("/change_model", web::post().to(handlers::change_model))
            .route("/status", web::get().to(handlers::get_status))
            .route("/transcribe", web::post().to(handlers::transcribe))
            .route("/download", web::post().to(handlers::download))
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

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_stt_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        let sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate());
        let sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt());
        let (mut sigterm, mut sigint) = match (sigterm, sigint) {
            (Ok(t), Ok(i)) => (t, i),
            _ => {
                error!("Failed to install signal handlers");
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

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
