//! Recorded segments
//!
//! This module handles reading recorded segment files: header parsing,
//! media extraction into a muxer, continuity between neighbouring files,
//! and locating the files that cover a time window.

pub mod continuity;
pub mod reader;
pub mod store;

use chrono::{DateTime, Utc};
use std::path::PathBuf;

pub use continuity::can_concatenate;
pub use reader::{mux_parts, read_header, ReadSeek};
pub use store::{FsSegmentStore, SegmentStore};

/// One recorded container file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    /// Absolute time of the first sample
    pub start: DateTime<Utc>,
}
