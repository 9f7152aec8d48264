//! Self-contained MP4 muxer
//!
//! All samples are held in memory until `flush`, which writes `ftyp`,
//! a `moov` with complete sample tables, and a single `mdat`. Each track's
//! samples form one chunk.

use bytes::Bytes;
use std::io::Write;

use super::{find_track, track_buffers, Muxer, OutputSample, TrackBuffer};
use crate::error::{PlaybackError, Result};
use crate::fmp4::boxes::{
    fullbox_header, mdat_header, write_box, write_container_box, write_ftyp,
};
use crate::fmp4::init::{write_mvhd, write_stsd, write_trak, MOVIE_TIMESCALE};
use crate::fmp4::{Init, InitTrack};

pub struct Mp4Muxer<W: Write> {
    writer: W,
    init: Option<Init>,
    tracks: Vec<TrackBuffer>,
    current: Option<usize>,
    flushed: bool,
}

struct TrackOutput<'a> {
    track: &'a InitTrack,
    samples: Vec<OutputSample>,
}

impl TrackOutput<'_> {
    fn first_dts(&self) -> u64 {
        self.samples.first().map_or(0, |s| s.dts)
    }

    fn media_duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }

    fn data_len(&self) -> u64 {
        self.samples.iter().map(|s| s.payload.len() as u64).sum()
    }
}

fn to_movie_time(ticks: u64, time_scale: u32) -> u64 {
    (ticks as u128 * MOVIE_TIMESCALE as u128 / time_scale as u128) as u64
}

fn write_stts(samples: &[OutputSample]) -> Vec<u8> {
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for s in samples {
        match entries.last_mut() {
            Some((count, delta)) if *delta == s.duration => *count += 1,
            _ => entries.push((1, s.duration)),
        }
    }
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (count, delta) in entries {
        content.extend_from_slice(&count.to_be_bytes());
        content.extend_from_slice(&delta.to_be_bytes());
    }
    write_box(b"stts", &content)
}

fn write_ctts(samples: &[OutputSample]) -> Option<Vec<u8>> {
    if samples.iter().all(|s| s.pts_offset == 0) {
        return None;
    }
    let mut entries: Vec<(u32, i32)> = Vec::new();
    for s in samples {
        match entries.last_mut() {
            Some((count, offset)) if *offset == s.pts_offset => *count += 1,
            _ => entries.push((1, s.pts_offset)),
        }
    }
    // version 1: signed offsets
    let mut content = fullbox_header(1, 0).to_vec();
    content.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (count, offset) in entries {
        content.extend_from_slice(&count.to_be_bytes());
        content.extend_from_slice(&offset.to_be_bytes());
    }
    Some(write_box(b"ctts", &content))
}

fn write_stss(samples: &[OutputSample]) -> Option<Vec<u8>> {
    if samples.iter().all(|s| !s.is_non_sync) {
        return None;
    }
    let sync: Vec<u32> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_non_sync)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&(sync.len() as u32).to_be_bytes());
    for n in sync {
        content.extend_from_slice(&n.to_be_bytes());
    }
    Some(write_box(b"stss", &content))
}

fn write_stsc(sample_count: u32) -> Vec<u8> {
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&sample_count.to_be_bytes());
    content.extend_from_slice(&1u32.to_be_bytes());
    write_box(b"stsc", &content)
}

fn write_stsz(samples: &[OutputSample]) -> Vec<u8> {
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&(samples.len() as u32).to_be_bytes());
    for s in samples {
        content.extend_from_slice(&(s.payload.len() as u32).to_be_bytes());
    }
    write_box(b"stsz", &content)
}

fn write_co64(chunk_offset: u64) -> Vec<u8> {
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&chunk_offset.to_be_bytes());
    write_box(b"co64", &content)
}

/// Edit list delaying a track that starts after the window start.
fn write_edts(delay: u64, duration: u64) -> Vec<u8> {
    let mut content = fullbox_header(1, 0).to_vec();
    content.extend_from_slice(&2u32.to_be_bytes());
    // empty edit
    content.extend_from_slice(&delay.to_be_bytes());
    content.extend_from_slice(&(-1i64).to_be_bytes());
    content.extend_from_slice(&0x00010000u32.to_be_bytes());
    content.extend_from_slice(&duration.to_be_bytes());
    content.extend_from_slice(&0i64.to_be_bytes());
    content.extend_from_slice(&0x00010000u32.to_be_bytes());
    let elst = write_box(b"elst", &content);
    write_container_box(b"edts", &[&elst])
}

fn write_moov(outputs: &[TrackOutput], chunk_offsets: &[u64], next_track_id: u32) -> Vec<u8> {
    let mut movie_duration = 0;
    let mut traks = Vec::with_capacity(outputs.len());

    for (out, chunk_offset) in outputs.iter().zip(chunk_offsets) {
        let ts = out.track.time_scale;
        let media_duration = out.media_duration();
        let delay = to_movie_time(out.first_dts(), ts);
        let track_duration = to_movie_time(media_duration, ts);
        movie_duration = movie_duration.max(delay + track_duration);

        let stsd = write_stsd(out.track);
        let stts = write_stts(&out.samples);
        let ctts = write_ctts(&out.samples);
        let stss = write_stss(&out.samples);
        let stsc = write_stsc(out.samples.len() as u32);
        let stsz = write_stsz(&out.samples);
        let co64 = write_co64(*chunk_offset);

        let mut children: Vec<&[u8]> = vec![stsd.as_slice(), stts.as_slice()];
        if let Some(ctts) = &ctts {
            children.push(ctts);
        }
        if let Some(stss) = &stss {
            children.push(stss);
        }
        children.extend([stsc.as_slice(), stsz.as_slice(), co64.as_slice()]);
        let stbl = write_container_box(b"stbl", &children);

        let edts = (delay > 0).then(|| write_edts(delay, track_duration));
        traks.push(write_trak(
            out.track,
            delay + track_duration,
            media_duration,
            edts.as_deref(),
            &stbl,
        ));
    }

    let mvhd = write_mvhd(MOVIE_TIMESCALE, movie_duration, next_track_id);
    let mut children: Vec<&[u8]> = vec![mvhd.as_slice()];
    children.extend(traks.iter().map(|t| t.as_slice()));
    write_container_box(b"moov", &children)
}

impl<W: Write> Mp4Muxer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            init: None,
            tracks: Vec::new(),
            current: None,
            flushed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn current_track(&mut self) -> Result<&mut TrackBuffer> {
        let idx = self
            .current
            .ok_or_else(|| PlaybackError::Internal("no track selected".into()))?;
        Ok(&mut self.tracks[idx])
    }

    fn write_file(&mut self) -> Result<()> {
        let Some(init) = self.init.as_ref() else {
            return Ok(());
        };

        let mut outputs = Vec::new();
        for buffer in &mut self.tracks {
            buffer.finish_open();
            if buffer.end().map_or(true, |end| end <= 0) {
                continue;
            }
            let Some(track) = init.track(buffer.id) else {
                continue;
            };
            outputs.push(TrackOutput {
                track,
                samples: buffer.drain_output()?,
            });
        }

        if outputs.is_empty() {
            return Ok(());
        }

        let ftyp = write_ftyp();
        let next_track_id = init.next_track_id();
        let data_len: u64 = outputs.iter().map(|o| o.data_len()).sum();
        let mdat_hdr = mdat_header(data_len);

        // co64 entries have a fixed size, so the moov length does not
        // depend on the offsets written into it.
        let moov_len = write_moov(&outputs, &vec![0; outputs.len()], next_track_id).len() as u64;

        let mut chunk_offsets = Vec::with_capacity(outputs.len());
        let mut pos = ftyp.len() as u64 + moov_len + mdat_hdr.len() as u64;
        for out in &outputs {
            chunk_offsets.push(pos);
            pos += out.data_len();
        }
        let moov = write_moov(&outputs, &chunk_offsets, next_track_id);

        self.writer.write_all(&ftyp)?;
        self.writer.write_all(&moov)?;
        self.writer.write_all(&mdat_hdr)?;
        for out in &outputs {
            for s in &out.samples {
                self.writer.write_all(&s.payload)?;
            }
        }
        Ok(())
    }
}

impl<W: Write> Muxer for Mp4Muxer<W> {
    fn write_init(&mut self, init: &Init) -> Result<()> {
        self.tracks = track_buffers(init);
        self.init = Some(init.clone());
        Ok(())
    }

    fn set_track(&mut self, track_id: u32) -> Result<()> {
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
        self.write_file()?;
        self.writer.flush()?;
        Ok(())
    }
}
