//! Application state management
//!
//! This module defines the AppState structure that holds:
//! - Server configuration and the replaceable path table
//! - The transcode job coordinator
//! - Segment lookup, authentication and encoder collaborators

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AllowAll, AuthManager, BasicAuth, PAUSE_AFTER_AUTH_ERROR};
use crate::config::{find_path_conf, PathConfig, ResolvedPath, ServerConfig};
use crate::error::Result;
use crate::segment::{FsSegmentStore, Segment, SegmentStore};
use crate::transcode::{output_dir, Coordinator, FfmpegEncoder, SharedEncoder};

/// Shared state, created once at startup
pub struct AppState {
    /// Server configuration
    pub config: ServerConfig,

    /// Per-path settings, replaceable at runtime
    paths: RwLock<Vec<PathConfig>>,

    /// In-flight HLS jobs
    pub coordinator: Arc<Coordinator>,

    pub store: Arc<dyn SegmentStore>,

    pub auth: Arc<dyn AuthManager>,

    pub encoder: SharedEncoder,

    /// Delay before answering with rejected credentials
    pub auth_pause: Duration,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: ServerConfig) -> Self {
        let auth: Arc<dyn AuthManager> = match &config.auth {
            Some(creds) => Arc::new(BasicAuth::new(creds)),
            None => Arc::new(AllowAll),
        };
        let encoder = Arc::new(FfmpegEncoder::new(config.hls.encoder_path.clone()));
        Self::with_collaborators(config, Arc::new(FsSegmentStore), auth, encoder)
    }

    /// Create an AppState around explicit collaborators
    pub fn with_collaborators(
        config: ServerConfig,
        store: Arc<dyn SegmentStore>,
        auth: Arc<dyn AuthManager>,
        encoder: SharedEncoder,
    ) -> Self {
        Self {
            paths: RwLock::new(config.paths.clone()),
            coordinator: Arc::new(Coordinator::new(config.hls.max_concurrent_jobs())),
            store,
            auth,
            encoder,
            auth_pause: PAUSE_AFTER_AUTH_ERROR,
            config,
        }
    }

    /// Replace the path table
    pub fn reload_paths(&self, paths: Vec<PathConfig>) {
        tracing::info!("Reloaded {} path configuration(s)", paths.len());
        *self.paths.write() = paths;
    }

    /// Resolve the configuration for a path name
    pub fn resolve_path(&self, name: &str) -> Result<ResolvedPath> {
        find_path_conf(&self.config.record, &self.paths.read(), name)
    }

    /// Segments of `name` covering `[start, end)`
    pub fn find_segments(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(ResolvedPath, Vec<Segment>)> {
        let conf = self.resolve_path(name)?;
        let segments = self.store.find_segments(&conf, name, start, end)?;
        tracing::debug!("{} segment(s) for {} from {}", segments.len(), name, start);
        Ok((conf, segments))
    }

    /// Output directory of the HLS job identified by `token`
    pub fn hls_dir(&self, token: &str) -> PathBuf {
        output_dir(&self.config.hls.output_dir, token)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}
