//! Axum router configuration

use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::handlers::{active_jobs, delete_hls, health_check, playback};

/// CORS policy for the configured origin. Credentials are allowed, so a
/// wildcard origin is answered by echoing the request's origin.
fn cors_layer(allow_origin: &str) -> CorsLayer {
    let origin = if allow_origin == "*" {
        AllowOrigin::mirror_request()
    } else {
        match HeaderValue::from_str(allow_origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(e) => {
                tracing::warn!("Invalid allow_origin {:?}: {}", allow_origin, e);
                AllowOrigin::mirror_request()
            }
        }
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::OPTIONS, Method::DELETE])
        .allow_headers([header::AUTHORIZATION])
}

/// Create the Axum router with all routes
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.allow_origin);

    Router::new()
        .route("/health", get(health_check))
        .route("/get", get(playback))
        .route("/hls", delete(delete_hls))
        .route("/debug/jobs", get(active_jobs))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
