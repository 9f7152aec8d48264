//! Streamed fragmented MP4 muxer

use bytes::Bytes;
use std::io::Write;

use super::{find_track, track_buffers, Muxer, TrackBuffer};
use crate::error::{PlaybackError, Result};
use crate::fmp4::{Init, Part, PartSample, PartTrack};

/// Buffered media size that triggers writing a fragment
const PART_FLUSH_BYTES: usize = 1024 * 1024;

/// Writes the window as `ftyp` + `moov` followed by `moof` + `mdat` pairs
/// as soon as enough media is buffered. Suitable for a network sink.
pub struct FragmentedMuxer<W: Write> {
    writer: W,
    init: Option<Init>,
    init_written: bool,
    tracks: Vec<TrackBuffer>,
    current: Option<usize>,
    sequence_number: u32,
    flushed: bool,
}

impl<W: Write> FragmentedMuxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            init: None,
            init_written: false,
            tracks: Vec::new(),
            current: None,
            sequence_number: 0,
            flushed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// A fragment may only be cut once every track has reached the window
    /// start, since an upcoming sync sample could still discard what is
    /// buffered.
    fn can_emit(&self) -> bool {
        self.tracks
            .iter()
            .all(|t| t.last_dts().map_or(true, |dts| dts >= 0))
    }

    fn maybe_write_part(&mut self) -> Result<()> {
        let buffered: usize = self.tracks.iter().map(|t| t.buffered_bytes()).sum();
        if buffered >= PART_FLUSH_BYTES && self.can_emit() {
            self.write_part(false)?;
        }
        Ok(())
    }

    fn write_part(&mut self, last: bool) -> Result<()> {
        let mut part_tracks = Vec::new();

        for track in &mut self.tracks {
            if track.samples.is_empty() {
                continue;
            }
            // nothing of this track reaches into the window
            if last && track.end().map_or(true, |end| end <= 0) {
                track.samples.clear();
                continue;
            }
            let samples = track.drain_output()?;
            part_tracks.push(PartTrack {
                id: track.id,
                base_time: samples[0].dts,
                samples: samples
                    .into_iter()
                    .map(|s| PartSample {
                        duration: s.duration,
                        pts_offset: s.pts_offset,
                        is_non_sync: s.is_non_sync,
                        payload: s.payload,
                    })
                    .collect(),
            });
        }

        if part_tracks.is_empty() {
            return Ok(());
        }

        if !self.init_written {
            let init = self
                .init
                .as_ref()
                .ok_or_else(|| PlaybackError::Internal("init was not written".into()))?;
            self.writer.write_all(&init.marshal())?;
            self.init_written = true;
        }

        self.sequence_number += 1;
        let part = Part {
            sequence_number: self.sequence_number,
            tracks: part_tracks,
        };
        self.writer.write_all(&part.marshal()?)?;
        Ok(())
    }

    fn current_track(&mut self) -> Result<&mut TrackBuffer> {
        let idx = self
            .current
            .ok_or_else(|| PlaybackError::Internal("no track selected".into()))?;
        Ok(&mut self.tracks[idx])
    }
}

impl<W: Write> Muxer for FragmentedMuxer<W> {
    fn write_init(&mut self, init: &Init) -> Result<()> {
        self.tracks = track_buffers(init);
        self.init = Some(init.clone());
        Ok(())
    }

    fn set_track(&mut self, track_id: u32) -> Result<()> {
        self.maybe_write_part()?;
        self.current = Some(find_track(&self.tracks, track_id)?);
        Ok(())
    }

    fn write_sample(
        &mut self,
        dts: i64,
        pts_offset: i32,
        is_non_sync: bool,
        payload: Bytes,
    ) -> Result<()> {
        self.current_track()?
            .push(dts, pts_offset, is_non_sync, payload)
    }

    fn write_final_dts(&mut self, dts: i64) -> Result<()> {
        self.current_track()?.finish(dts)
    }

    fn flush(&mut self) -> Result<()> {
        if self.flushed {
            return Ok(());
        }
        self.flushed = true;

        for track in &mut self.tracks {
            track.finish_open();
        }
        self.write_part(true)?;
        self.writer.flush()?;
        Ok(())
    }
}
