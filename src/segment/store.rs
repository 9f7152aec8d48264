//! Segment lookup
//!
//! Recordings are stored as `<record root>/<path name>/<timestamp>.<ext>`,
//! where the timestamp is the UTC start of the segment formatted as
//! `%Y-%m-%d_%H-%M-%S-%6f`.

use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};

use super::Segment;
use crate::config::ResolvedPath;
use crate::error::{PlaybackError, Result};

/// strftime layout of segment file stems
pub const SEGMENT_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S-%6f";

/// Finds the segments covering a time window
pub trait SegmentStore: Send + Sync {
    /// Segments in ascending start order whose content may fall inside
    /// `[start, end)`. Fails with `NotFound` when there are none.
    fn find_segments(
        &self,
        conf: &ResolvedPath,
        path_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Segment>>;
}

/// Segment store backed by the recordings directory tree
#[derive(Debug, Default, Clone)]
pub struct FsSegmentStore;

/// File name of a segment starting at `start`
pub fn segment_file_name(start: DateTime<Utc>, extension: &str) -> String {
    format!("{}.{}", start.format(SEGMENT_NAME_FORMAT), extension)
}

fn parse_segment_name(file: &Path, extension: &str) -> Option<DateTime<Utc>> {
    if file.extension()?.to_str()? != extension {
        return None;
    }
    let stem = file.file_stem()?.to_str()?;
    NaiveDateTime::parse_from_str(stem, SEGMENT_NAME_FORMAT)
        .ok()
        .map(|t| t.and_utc())
}

impl FsSegmentStore {
    fn list(&self, dir: &Path, extension: &str) -> Result<Vec<Segment>> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut segments = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path: PathBuf = entry.path();
            if let Some(start) = parse_segment_name(&path, extension) {
                segments.push(Segment { path, start });
            }
        }
        segments.sort_by_key(|s| s.start);
        Ok(segments)
    }
}

impl SegmentStore for FsSegmentStore {
    fn find_segments(
        &self,
        conf: &ResolvedPath,
        path_name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Segment>> {
        let dir = conf.record_root.join(path_name);
        let all = self.list(&dir, conf.record_format.extension())?;

        // The last segment starting at or before the window start may
        // still contain it.
        let first = all.iter().rposition(|s| s.start <= start);
        let from = first.unwrap_or(0);

        let found: Vec<Segment> = all
            .into_iter()
            .skip(from)
            .take_while(|s| s.start < end)
            .collect();

        tracing::debug!(
            "Found {} segments for {} in {}",
            found.len(),
            path_name,
            dir.display()
        );

        if found.is_empty() {
            return Err(PlaybackError::NotFound("no recordings found".into()));
        }
        Ok(found)
    }
}
