//! Configuration file support
//!
//! Loads server configuration from TOML files.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::{
    AuthConfig, HlsConfig, PathConfig, RecordConfig, RecordFormat, ServerConfig,
};

/// Configuration file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Server settings
    pub server: ServerSettings,
    /// Recording settings
    pub record: RecordSettings,
    /// Per-path overrides
    #[serde(default)]
    pub paths: Vec<PathConfig>,
    /// HLS packaging settings
    pub hls: Option<HlsSettings>,
    /// Authentication settings
    pub auth: Option<AuthConfig>,
    /// Logging settings
    pub logging: Option<LoggingSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Allowed CORS origin
    pub allow_origin: Option<String>,
    /// Concatenation tolerance between segments in milliseconds
    pub concat_tolerance_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSettings {
    /// Root of the recordings tree
    pub root: PathBuf,
    /// Container family of stored segments
    pub format: RecordFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsSettings {
    pub output_dir: Option<PathBuf>,
    pub encoder_path: Option<PathBuf>,
    pub job_timeout_secs: Option<u64>,
    pub concurrency_per_cpu: Option<usize>,
    pub segment_secs: Option<u64>,
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: Option<String>,
}

impl ConfigFile {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ConfigFile = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Generate default configuration file
    pub fn default_config() -> Self {
        let defaults = ServerConfig::default();
        Self {
            server: ServerSettings {
                host: defaults.host,
                port: defaults.port,
                allow_origin: Some(defaults.allow_origin),
                concat_tolerance_ms: Some(defaults.concat_tolerance_ms),
            },
            record: RecordSettings {
                root: defaults.record.root,
                format: defaults.record.format,
            },
            paths: defaults.paths,
            hls: Some(HlsSettings {
                output_dir: Some(defaults.hls.output_dir),
                encoder_path: Some(defaults.hls.encoder_path),
                job_timeout_secs: Some(defaults.hls.job_timeout_secs),
                concurrency_per_cpu: Some(defaults.hls.concurrency_per_cpu),
                segment_secs: Some(defaults.hls.segment_secs),
                ttl_secs: Some(defaults.hls.ttl_secs),
            }),
            auth: None,
            logging: Some(LoggingSettings {
                level: "info".to_string(),
                format: Some("pretty".to_string()),
            }),
        }
    }

    /// Convert to ServerConfig
    pub fn into_server_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        let hls_defaults = HlsConfig::default();
        let hls = self.hls.map_or(hls_defaults.clone(), |h| HlsConfig {
            output_dir: h.output_dir.unwrap_or(hls_defaults.output_dir),
            encoder_path: h.encoder_path.unwrap_or(hls_defaults.encoder_path),
            job_timeout_secs: h.job_timeout_secs.unwrap_or(hls_defaults.job_timeout_secs),
            concurrency_per_cpu: h
                .concurrency_per_cpu
                .unwrap_or(hls_defaults.concurrency_per_cpu),
            segment_secs: h.segment_secs.unwrap_or(hls_defaults.segment_secs),
            ttl_secs: h.ttl_secs.unwrap_or(hls_defaults.ttl_secs),
        });

        ServerConfig {
            host: self.server.host,
            port: self.server.port,
            allow_origin: self.server.allow_origin.unwrap_or(defaults.allow_origin),
            record: RecordConfig {
                root: self.record.root,
                format: self.record.format,
            },
            paths: if self.paths.is_empty() {
                defaults.paths
            } else {
                self.paths
            },
            hls,
            concat_tolerance_ms: self
                .server
                .concat_tolerance_ms
                .unwrap_or(defaults.concat_tolerance_ms),
            auth: self.auth,
            log_level: self
                .logging
                .as_ref()
                .map(|l| l.level.clone())
                .unwrap_or(defaults.log_level),
            log_format: self
                .logging
                .and_then(|l| l.format)
                .unwrap_or(defaults.log_format),
        }
    }
}

/// Generate default configuration file at the specified path
pub fn generate_default_config<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
    let config = ConfigFile::default_config();
    config.to_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ConfigFile::default_config();
        assert_eq!(config.server.port, 9996);
        assert_eq!(config.record.format, RecordFormat::Fmp4);
    }

    #[test]
    fn test_config_file_roundtrip() {
        let config = ConfigFile::default_config();

        let mut temp_file = NamedTempFile::new().unwrap();
        let content = toml::to_string_pretty(&config).unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();

        let loaded = ConfigFile::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.paths.len(), 1);
    }

    #[test]
    fn test_partial_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(
            temp_file,
            r#"
[server]
host = "127.0.0.1"
port = 8000

[record]
root = "/data/rec"
format = "mpegts"

[[paths]]
name = "cam1"

[hls]
job_timeout_secs = 30
"#
        )
        .unwrap();

        let config = ConfigFile::from_file(temp_file.path())
            .unwrap()
            .into_server_config();
        assert_eq!(config.port, 8000);
        assert_eq!(config.record.format, RecordFormat::Mpegts);
        assert_eq!(config.paths[0].name, "cam1");
        assert_eq!(config.hls.job_timeout_secs, 30);
        assert_eq!(config.hls.segment_secs, 10);
        assert_eq!(config.concat_tolerance_ms, 500);
    }

    #[test]
    fn test_generate_default_config() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();

        generate_default_config(&path).unwrap();

        let loaded = ConfigFile::from_file(&path).unwrap();
        assert_eq!(loaded.server.port, 9996);
    }
}
