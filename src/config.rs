//! Server configuration

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PlaybackError, Result};

/// Container family the recorder writes segments in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    Fmp4,
    Mpegts,
}

impl RecordFormat {
    /// File extension used by segments of this family
    pub fn extension(&self) -> &'static str {
        match self {
            RecordFormat::Fmp4 => "mp4",
            RecordFormat::Mpegts => "ts",
        }
    }
}

/// Default recording location and format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Root directory; each path records into `<root>/<path name>/`
    pub root: PathBuf,

    /// Container family of stored segments
    pub format: RecordFormat,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./recordings"),
            format: RecordFormat::Fmp4,
        }
    }
}

/// Per-path override. A name starting with `~` is a regular expression,
/// `all_others` matches every path not matched before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub name: String,
    pub record_root: Option<PathBuf>,
    pub record_format: Option<RecordFormat>,
}

impl PathConfig {
    /// Catch-all entry using the default record settings
    pub fn all_others() -> Self {
        Self {
            name: "all_others".to_string(),
            record_root: None,
            record_format: None,
        }
    }
}

/// Path configuration resolved for one request
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPath {
    pub record_root: PathBuf,
    pub record_format: RecordFormat,
}

/// HLS packaging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsConfig {
    /// Directory holding one output directory per job token
    pub output_dir: PathBuf,

    /// Encoder executable
    pub encoder_path: PathBuf,

    /// Wall-clock deadline for one encoder run, in seconds
    pub job_timeout_secs: u64,

    /// Encoder processes allowed per available CPU
    pub concurrency_per_cpu: usize,

    /// Target HLS segment duration in seconds
    pub segment_secs: u64,

    /// Idle time after which the janitor deletes an output directory
    pub ttl_secs: u64,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./playback_hls"),
            encoder_path: PathBuf::from("ffmpeg"),
            job_timeout_secs: 120,
            concurrency_per_cpu: 2,
            segment_secs: 10,
            ttl_secs: 3600,
        }
    }
}

impl HlsConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Number of encoder processes that may run at once
    pub fn max_concurrent_jobs(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus * self.concurrency_per_cpu).max(1)
    }
}

/// Static credentials for basic authentication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub user: String,
    pub pass: String,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Value of Access-Control-Allow-Origin
    pub allow_origin: String,

    /// Default record settings
    pub record: RecordConfig,

    /// Per-path settings, matched in order
    pub paths: Vec<PathConfig>,

    /// HLS packaging settings
    pub hls: HlsConfig,

    /// Allowed drift between the end of one segment and the start of the next
    pub concat_tolerance_ms: u64,

    /// Optional basic authentication
    pub auth: Option<AuthConfig>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log output format (pretty, json)
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9996,
            allow_origin: "*".to_string(),
            record: RecordConfig::default(),
            paths: vec![PathConfig::all_others()],
            hls: HlsConfig::default(),
            concat_tolerance_ms: 500,
            auth: None,
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn concat_tolerance(&self) -> Duration {
        Duration::from_millis(self.concat_tolerance_ms)
    }
}

/// Rejects path names that could escape the record root.
pub fn validate_path_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PlaybackError::InvalidRequest("invalid path: empty".into()));
    }
    if name.starts_with('/')
        || name.ends_with('/')
        || name.contains('\\')
        || name.split('/').any(|p| p.is_empty() || p == "." || p == "..")
    {
        return Err(PlaybackError::InvalidRequest(format!(
            "invalid path: {}",
            name
        )));
    }
    Ok(())
}

/// Find the configuration that applies to `name`.
pub fn find_path_conf(
    record: &RecordConfig,
    paths: &[PathConfig],
    name: &str,
) -> Result<ResolvedPath> {
    validate_path_name(name)?;

    for conf in paths {
        let matched = if conf.name == "all_others" {
            true
        } else if let Some(expr) = conf.name.strip_prefix('~') {
            let re = Regex::new(expr).map_err(|e| {
                PlaybackError::Config(format!("invalid path regex {}: {}", conf.name, e))
            })?;
            re.is_match(name)
        } else {
            conf.name == name
        };

        if matched {
            return Ok(ResolvedPath {
                record_root: conf
                    .record_root
                    .clone()
                    .unwrap_or_else(|| record.root.clone()),
                record_format: conf.record_format.unwrap_or(record.format),
            });
        }
    }

    Err(PlaybackError::InvalidRequest(format!(
        "path '{}' is not configured",
        name
    )))
}
