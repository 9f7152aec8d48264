//! Playback request parameters
//!
//! Parsing and validation of the query string accepted by the playback
//! endpoints. Everything here runs before any file is touched.

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{PlaybackError, Result};

/// Output format selected by the `format` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Streamed fragmented MP4
    Fmp4,
    /// Self-contained MP4 with a single index
    Mp4,
    /// HLS package produced by the encoder
    Hls,
}

impl FromStr for Format {
    type Err = PlaybackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "fmp4" => Ok(Format::Fmp4),
            "mp4" => Ok(Format::Mp4),
            "hls" => Ok(Format::Hls),
            other => Err(PlaybackError::InvalidRequest(format!(
                "invalid format: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Format::Fmp4 => write!(f, "fmp4"),
            Format::Mp4 => write!(f, "mp4"),
            Format::Hls => write!(f, "hls"),
        }
    }
}

/// Parse a duration given either as decimal seconds or, for older clients,
/// as a duration string such as `1m30s`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();

    if let Ok(secs) = raw.parse::<f64>() {
        if !secs.is_finite() || secs < 0.0 {
            return Err(PlaybackError::InvalidRequest(format!(
                "invalid duration: {}",
                raw
            )));
        }
        return Duration::try_from_secs_f64(secs)
            .map_err(|e| PlaybackError::InvalidRequest(format!("invalid duration: {}", e)));
    }

    humantime::parse_duration(raw).or_else(|e| {
        parse_fractional_units(raw)
            .ok_or_else(|| PlaybackError::InvalidRequest(format!("invalid duration: {}", e)))
    })
}

/// Duration strings with fractional components such as `1.5h` or
/// `1m30.5s`, as written by Go's `time.Duration`.
fn parse_fractional_units(raw: &str) -> Option<Duration> {
    let re = Regex::new(r"(\d*\.?\d+|\d+\.)(ns|us|µs|μs|ms|s|m|h)").ok()?;

    let mut pos = 0;
    let mut secs = 0.0;
    for cap in re.captures_iter(raw) {
        let whole = cap.get(0)?;
        if whole.start() != pos {
            return None;
        }
        pos = whole.end();

        let value: f64 = cap[1].parse().ok()?;
        let unit = match &cap[2] {
            "ns" => 1e-9,
            "us" | "µs" | "μs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            _ => 3600.0,
        };
        secs += value * unit;
    }

    if pos == 0 || pos != raw.len() {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

/// Canonical textual form of a duration, accepted back by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

/// Parse an RFC 3339 timestamp.
pub fn parse_start(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PlaybackError::InvalidRequest(format!("invalid start: {}", e)))
}

/// Canonical textual form of a timestamp.
pub fn format_start(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// A validated playback request
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackRequest {
    pub path: String,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub format: Format,
    /// Name of a previously generated HLS file
    pub file: Option<String>,
}

impl PlaybackRequest {
    /// Build a request from decoded query parameters.
    pub fn from_query(query: &HashMap<String, String>) -> Result<Self> {
        let path = query
            .get("path")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| PlaybackError::InvalidRequest("missing path".into()))?
            .clone();

        let start = query
            .get("start")
            .ok_or_else(|| PlaybackError::InvalidRequest("missing start".into()))
            .and_then(|s| parse_start(s))?;

        let duration = query
            .get("duration")
            .ok_or_else(|| PlaybackError::InvalidRequest("missing duration".into()))
            .and_then(|d| parse_duration(d))?;

        let format = query
            .get("format")
            .map(|f| f.parse())
            .transpose()?
            .unwrap_or(Format::Fmp4);

        let file = query.get("file").filter(|f| !f.is_empty()).cloned();

        Ok(Self {
            path,
            start,
            duration,
            format,
            file,
        })
    }

    /// Exclusive end of the requested window
    pub fn end(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|d| self.start.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
