//! Seek-and-mux orchestration
//!
//! Walks the segments covering a window and writes the window's media into
//! a muxer, stitching consecutive segments while they remain continuous.

use chrono::{DateTime, Utc};
use std::fs::File;
use std::time::Duration;

use crate::config::RecordFormat;
use crate::error::{PlaybackError, Result};
use crate::mux::Muxer;
use crate::segment::{can_concatenate, read_header, Segment};

fn advance(t: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| t.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Write `[start, start + duration)` into `muxer`.
///
/// A window starting before the first segment is clamped to that segment's
/// start. Stops at the first segment that does not continue the previous
/// one. Returns the duration of media produced, measured from the clamped
/// start.
pub fn seek_and_mux(
    record_format: RecordFormat,
    segments: &[Segment],
    start: DateTime<Utc>,
    duration: Duration,
    tolerance: Duration,
    muxer: &mut dyn Muxer,
) -> Result<Duration> {
    if record_format == RecordFormat::Mpegts {
        return Err(PlaybackError::UnsupportedFormat(
            "recording is stored as MPEG-TS".into(),
        ));
    }

    let (first, rest) = segments
        .split_first()
        .ok_or_else(|| PlaybackError::NotFound("no recordings found".into()))?;

    let end = advance(start, duration);
    let start = start.max(first.start);
    let window = end
        .signed_duration_since(start)
        .to_std()
        .unwrap_or(Duration::ZERO);

    let mut file = File::open(&first.path)?;
    let (first_init, _) = read_header(&mut file)?;
    muxer.write_init(&first_init)?;

    let offset = first.start.signed_duration_since(start);
    let mut produced = muxer.write_media_span(&mut file, offset, window, &first_init)?;
    let mut segment_end = advance(start, produced);

    tracing::debug!("Muxed {:?} from {}", produced, first.path.display());

    for segment in rest {
        if produced >= window {
            break;
        }

        let mut file = File::open(&segment.path)?;
        let (init, _) = read_header(&mut file)?;

        if !can_concatenate(&first_init, segment_end, &init, segment.start, tolerance) {
            tracing::debug!(
                "Stopping at {}: not continuous with previous segment (expected start {}, found {})",
                segment.path.display(),
                segment_end,
                segment.start
            );
            break;
        }

        let offset = segment.start.signed_duration_since(start);
        // a segment without samples leaves the produced media unchanged
        produced = produced.max(muxer.write_media_span(&mut file, offset, window, &first_init)?);
        segment_end = advance(start, produced);

        tracing::debug!("Muxed up to {:?} from {}", produced, segment.path.display());
    }

    muxer.flush()?;
    Ok(produced)
}
