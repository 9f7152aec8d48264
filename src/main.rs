//! Recording playback server
//!
//! Serves time-ranged excerpts of recorded fragmented-MP4 segments as a
//! streamed fMP4 or a self-contained MP4, and packages excerpts as HLS
//! through an external encoder.

mod auth;
mod config;
mod config_file;
mod error;
mod fmp4;
mod http;
#[cfg(test)]
mod integration;
mod mux;
mod playlist;
mod request;
mod seek;
mod segment;
mod state;
mod transcode;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServerConfig;
use crate::error::{PlaybackError, Result};
use crate::http::create_router;
use crate::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
const APP_NAME: &str = "recording-playback";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let first = args.next();

    if first.as_deref() == Some("--generate-config") {
        let path = args.next().unwrap_or_else(|| "config.toml".to_string());
        crate::config_file::generate_default_config(&path)
            .map_err(|e| PlaybackError::Config(e.to_string()))?;
        return Ok(());
    }

    // Load configuration
    let config_path = first.unwrap_or_else(|| "config.toml".to_string());
    let (config, load_error) = load_config(&config_path);

    // Initialize logging
    init_logging(&config);

    tracing::info!("{} v{} starting", APP_NAME, VERSION);
    if let Some(e) = load_error {
        tracing::warn!(
            "Failed to load config file {}: {}. Using defaults.",
            config_path,
            e
        );
    }
    tracing::info!("Configuration loaded: {:?}", config);

    // Create application state
    let state = Arc::new(AppState::new(config.clone()));

    // HLS output directory and its janitor
    tokio::fs::create_dir_all(&config.hls.output_dir).await?;
    transcode::janitor::start_janitor(
        config.hls.output_dir.clone(),
        config.hls.ttl(),
        Arc::clone(&state.coordinator),
    );

    // Build router
    let app = create_router(state);

    // Start server
    let addr: SocketAddr = config
        .socket_addr()
        .parse()
        .map_err(|e| PlaybackError::Config(format!("invalid listen address: {}", e)))?;
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Read the configuration file, falling back to defaults when it is missing
/// or invalid. Returns the load error so it can be logged once logging is up.
fn load_config(path: &str) -> (ServerConfig, Option<String>) {
    if !std::path::Path::new(path).exists() {
        return (ServerConfig::default(), None);
    }
    match crate::config_file::ConfigFile::from_file(path) {
        Ok(cf) => (cf.into_server_config(), None),
        Err(e) => (ServerConfig::default(), Some(e.to_string())),
    }
}

/// Initialize logging with tracing
fn init_logging(config: &ServerConfig) {
    let default_filter = format!("recording_playback={},tower_http=debug", config.log_level);
    let json = config.log_format == "json";

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();
}
