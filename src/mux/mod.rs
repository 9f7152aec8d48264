//! Output muxers
//!
//! A muxer receives the container header of the first segment followed by
//! re-timestamped samples, one track at a time, and writes an output
//! container. Decode times are expressed in track ticks relative to the
//! start of the requested window and may be negative for samples that
//! precede it.
//!
//! - `fmp4`: streamed fragmented MP4
//! - `mp4`: buffered, self-contained MP4 with one index

pub mod fmp4;
pub mod mp4;

use bytes::Bytes;
use std::time::Duration;

use crate::error::{PlaybackError, Result};
use crate::fmp4::Init;
use crate::segment::reader::{mux_parts, ReadSeek};

pub use self::fmp4::FragmentedMuxer;
pub use self::mp4::Mp4Muxer;

/// Sink for container structure and media samples
pub trait Muxer {
    /// Set the container header. Called once, before any sample.
    fn write_init(&mut self, init: &Init) -> Result<()>;

    /// Select the track subsequent samples belong to.
    fn set_track(&mut self, track_id: u32) -> Result<()>;

    /// Append a sample to the current track.
    fn write_sample(
        &mut self,
        dts: i64,
        pts_offset: i32,
        is_non_sync: bool,
        payload: Bytes,
    ) -> Result<()>;

    /// Close the current track's last sample at `dts`.
    fn write_final_dts(&mut self, dts: i64) -> Result<()>;

    /// Write out everything still buffered. Only the first call has any
    /// effect.
    fn flush(&mut self) -> Result<()>;

    /// Mux the media of one segment. See [`mux_parts`].
    fn write_media_span(
        &mut self,
        reader: &mut dyn ReadSeek,
        offset: chrono::Duration,
        duration: Duration,
        init: &Init,
    ) -> Result<Duration> {
        mux_parts(reader, offset, duration, init, self)
    }
}

/// A sample whose duration is known
#[derive(Debug, Clone)]
pub(crate) struct BufferedSample {
    pub dts: i64,
    pub duration: i64,
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload: Bytes,
}

impl BufferedSample {
    fn end(&self) -> i64 {
        self.dts + self.duration
    }
}

/// A sample placed on the output timeline
#[derive(Debug, Clone)]
pub(crate) struct OutputSample {
    pub dts: u64,
    pub duration: u32,
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload: Bytes,
}

struct PendingSample {
    dts: i64,
    pts_offset: i32,
    is_non_sync: bool,
    payload: Bytes,
}

/// Per-track sample accumulator shared by both muxers
pub(crate) struct TrackBuffer {
    pub id: u32,
    pub time_scale: u32,
    pub samples: Vec<BufferedSample>,
    pending: Option<PendingSample>,
    last_dts: Option<i64>,
    /// Final DTS of the previous segment
    segment_end: Option<i64>,
    /// Added to the DTS of the current segment's samples
    shift: i64,
}

impl TrackBuffer {
    pub fn new(id: u32, time_scale: u32) -> Self {
        Self {
            id,
            time_scale,
            samples: Vec::new(),
            pending: None,
            last_dts: None,
            segment_end: None,
            shift: 0,
        }
    }

    fn close_pending(&mut self, dts: i64) {
        if let Some(p) = self.pending.take() {
            self.samples.push(BufferedSample {
                dts: p.dts,
                duration: dts - p.dts,
                pts_offset: p.pts_offset,
                is_non_sync: p.is_non_sync,
                payload: p.payload,
            });
        }
    }

    pub fn push(
        &mut self,
        dts: i64,
        pts_offset: i32,
        is_non_sync: bool,
        payload: Bytes,
    ) -> Result<()> {
        // Segments may overlap slightly; move the new one past the old.
        if self.pending.is_none() {
            if let Some(end) = self.segment_end.take() {
                self.shift = (end - dts).max(0);
            }
        }
        let dts = dts + self.shift;

        if let Some(last) = self.last_dts {
            if dts < last {
                return Err(PlaybackError::MalformedContainer(
                    "DTS is not monotonically increasing".into(),
                ));
            }
        }
        self.close_pending(dts);

        // A sync sample at or before the window start makes everything
        // before it useless.
        if !is_non_sync && dts <= 0 {
            self.samples.clear();
        }

        self.pending = Some(PendingSample {
            dts,
            pts_offset,
            is_non_sync,
            payload,
        });
        self.last_dts = Some(dts);
        Ok(())
    }

    pub fn finish(&mut self, dts: i64) -> Result<()> {
        let dts = dts + self.shift;
        if let Some(p) = &self.pending {
            if dts < p.dts {
                return Err(PlaybackError::MalformedContainer(
                    "final DTS precedes the last sample".into(),
                ));
            }
        }
        self.close_pending(dts);
        self.segment_end = Some(dts);
        Ok(())
    }

    /// Close a sample left open with a zero duration.
    pub fn finish_open(&mut self) {
        if let Some(dts) = self.pending.as_ref().map(|p| p.dts) {
            self.close_pending(dts);
        }
    }

    /// Decode time of the most recent sample
    pub fn last_dts(&self) -> Option<i64> {
        self.last_dts
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// End of the last closed sample
    pub fn end(&self) -> Option<i64> {
        self.samples.last().map(BufferedSample::end)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.samples.iter().map(|s| s.payload.len()).sum()
    }

    /// Move closed samples onto the output timeline. Samples before zero
    /// are pinned at zero with no duration.
    pub fn drain_output(&mut self) -> Result<Vec<OutputSample>> {
        let samples = std::mem::take(&mut self.samples);
        let mut out = Vec::with_capacity(samples.len());

        for (i, s) in samples.iter().enumerate() {
            let dts = s.dts.max(0);
            let end = match samples.get(i + 1) {
                Some(next) => next.dts.max(0),
                None => s.end().max(0),
            }
            .max(dts);
            let duration = u32::try_from(end - dts).map_err(|_| {
                PlaybackError::MalformedContainer("sample duration out of range".into())
            })?;
            out.push(OutputSample {
                dts: dts as u64,
                duration,
                pts_offset: s.pts_offset,
                is_non_sync: s.is_non_sync,
                payload: s.payload.clone(),
            });
        }
        Ok(out)
    }
}

/// Build track buffers for every track of `init`.
pub(crate) fn track_buffers(init: &Init) -> Vec<TrackBuffer> {
    init.tracks
        .iter()
        .map(|t| TrackBuffer::new(t.id, t.time_scale))
        .collect()
}

pub(crate) fn find_track(tracks: &[TrackBuffer], id: u32) -> Result<usize> {
    tracks
        .iter()
        .position(|t| t.id == id)
        .ok_or_else(|| PlaybackError::Internal(format!("unknown track {}", id)))
}
