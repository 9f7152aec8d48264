//! HTTP server module
//!
//! This module handles HTTP request routing and handling:
//! - Axum router with the playback, HLS and debug endpoints
//! - Request handlers and the error-to-status mapping
//! - Streaming of muxer output into response bodies
//! - CORS middleware

pub mod body;
pub mod handlers;
pub mod routes;

pub use routes::create_router;
