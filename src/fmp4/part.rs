//! Media fragments (`moof` + `mdat`).
//!
//! Recorded segments are read as a flat list of sample references per
//! fragment; payloads stay on disk until a muxer asks for them. Output
//! fragments are built from owned sample payloads.

use bytes::Bytes;

use super::boxes::{
    fullbox_header, mdat_header, walk_boxes, write_box, write_container_box, ByteReader,
};
use crate::error::{PlaybackError, Result};

const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
const TFHD_DEFAULT_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_FLAGS: u32 = 0x000020;
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_DURATION: u32 = 0x000100;
const TRUN_SIZE: u32 = 0x000200;
const TRUN_FLAGS: u32 = 0x000400;
const TRUN_CTS: u32 = 0x000800;

/// `sample_is_non_sync_sample` bit of the sample flags
const SAMPLE_NON_SYNC: u32 = 0x0001_0000;

/// Upper bound on the samples of one `trun` that carries no per-sample
/// fields and so is not bounded by its own size
const MAX_TRUN_SAMPLES: u32 = 1 << 20;

/// A sample located inside a recorded segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRef {
    /// Absolute byte offset of the payload in the file
    pub offset: u64,
    pub size: u32,
    pub duration: u32,
    pub pts_offset: i32,
    pub is_non_sync: bool,
}

/// Samples of one track inside one fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentTrack {
    pub track_id: u32,
    /// Decode time of the first sample, in track timescale
    pub base_time: u64,
    pub samples: Vec<SampleRef>,
}

#[derive(Default)]
struct TfhdInfo {
    track_id: u32,
    base_data_offset: Option<u64>,
    default_base_is_moof: bool,
    default_duration: Option<u32>,
    default_size: Option<u32>,
    default_flags: Option<u32>,
}

fn parse_tfhd(payload: &[u8]) -> Result<TfhdInfo> {
    let mut r = ByteReader::new(payload, "tfhd");
    let (_, flags) = r.full_box_header()?;
    let mut info = TfhdInfo {
        track_id: r.u32()?,
        default_base_is_moof: flags & TFHD_DEFAULT_BASE_IS_MOOF != 0,
        ..Default::default()
    };
    if flags & TFHD_BASE_DATA_OFFSET != 0 {
        info.base_data_offset = Some(r.u64()?);
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        r.skip(4)?;
    }
    if flags & TFHD_DEFAULT_DURATION != 0 {
        info.default_duration = Some(r.u32()?);
    }
    if flags & TFHD_DEFAULT_SIZE != 0 {
        info.default_size = Some(r.u32()?);
    }
    if flags & TFHD_DEFAULT_FLAGS != 0 {
        info.default_flags = Some(r.u32()?);
    }
    Ok(info)
}

fn parse_tfdt(payload: &[u8]) -> Result<u64> {
    let mut r = ByteReader::new(payload, "tfdt");
    let (version, _) = r.full_box_header()?;
    if version == 1 {
        r.u64()
    } else {
        Ok(r.u32()? as u64)
    }
}

/// Resolve the samples of one `trun`. `cursor` is where the run's data
/// starts when the run carries no explicit data offset; it is advanced past
/// the run's data.
fn parse_trun(
    payload: &[u8],
    tfhd: &TfhdInfo,
    base: u64,
    cursor: &mut u64,
    out: &mut Vec<SampleRef>,
) -> Result<()> {
    let mut r = ByteReader::new(payload, "trun");
    let (_, flags) = r.full_box_header()?;
    let count = r.u32()?;

    if flags & TRUN_DATA_OFFSET != 0 {
        let rel = r.i32()? as i64;
        *cursor = base.checked_add_signed(rel).ok_or_else(|| {
            PlaybackError::MalformedContainer("trun data offset out of range".into())
        })?;
    }
    let first_flags = if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        Some(r.u32()?)
    } else {
        None
    };

    let entry_size = [TRUN_DURATION, TRUN_SIZE, TRUN_FLAGS, TRUN_CTS]
        .iter()
        .filter(|&&f| flags & f != 0)
        .count()
        * 4;
    if count > MAX_TRUN_SAMPLES || (count as usize).saturating_mul(entry_size) > r.remaining() {
        return Err(PlaybackError::MalformedContainer(format!(
            "trun sample count {} exceeds its contents",
            count
        )));
    }

    let missing =
        |what: &str| PlaybackError::MalformedContainer(format!("sample {} is not specified", what));

    for i in 0..count {
        let duration = if flags & TRUN_DURATION != 0 {
            r.u32()?
        } else {
            tfhd.default_duration.ok_or_else(|| missing("duration"))?
        };
        let size = if flags & TRUN_SIZE != 0 {
            r.u32()?
        } else {
            tfhd.default_size.ok_or_else(|| missing("size"))?
        };
        let sample_flags = if flags & TRUN_FLAGS != 0 {
            r.u32()?
        } else {
            match first_flags {
                Some(f) if i == 0 => f,
                _ => tfhd.default_flags.unwrap_or(0),
            }
        };
        let pts_offset = if flags & TRUN_CTS != 0 { r.i32()? } else { 0 };

        out.push(SampleRef {
            offset: *cursor,
            size,
            duration,
            pts_offset,
            is_non_sync: sample_flags & SAMPLE_NON_SYNC != 0,
        });
        *cursor = cursor.checked_add(size as u64).ok_or_else(|| {
            PlaybackError::MalformedContainer("sample offset out of range".into())
        })?;
    }
    Ok(())
}

fn parse_traf(
    payload: &[u8],
    moof_start: u64,
    prev_end: Option<u64>,
) -> Result<(FragmentTrack, u64)> {
    let mut tfhd = None;
    let mut base_time = None;
    let mut truns: Vec<&[u8]> = Vec::new();

    walk_boxes(payload, &[], &mut |t, p| {
        match t {
            b"tfhd" => tfhd = Some(parse_tfhd(p)?),
            b"tfdt" => base_time = Some(parse_tfdt(p)?),
            b"trun" => truns.push(p),
            _ => {}
        }
        Ok(())
    })?;

    let tfhd = tfhd.ok_or_else(|| PlaybackError::MalformedContainer("traf without tfhd".into()))?;
    let base_time =
        base_time.ok_or_else(|| PlaybackError::MalformedContainer("traf without tfdt".into()))?;

    let base = match (tfhd.base_data_offset, tfhd.default_base_is_moof, prev_end) {
        (Some(offset), _, _) => offset,
        (None, true, _) | (None, false, None) => moof_start,
        (None, false, Some(end)) => end,
    };

    let mut cursor = base;
    let mut samples = Vec::new();
    for trun in truns {
        parse_trun(trun, &tfhd, base, &mut cursor, &mut samples)?;
    }

    Ok((
        FragmentTrack {
            track_id: tfhd.track_id,
            base_time,
            samples,
        },
        cursor,
    ))
}

/// Decode the payload of a `moof` box that starts at `moof_start` in the file.
pub fn parse_moof(payload: &[u8], moof_start: u64) -> Result<Vec<FragmentTrack>> {
    let mut tracks = Vec::new();
    let mut prev_end = None;

    walk_boxes(payload, &[], &mut |t, p| {
        if t == b"traf" {
            let (track, end) = parse_traf(p, moof_start, prev_end)?;
            prev_end = Some(end);
            tracks.push(track);
        }
        Ok(())
    })?;

    Ok(tracks)
}

/// A sample of an output fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartSample {
    pub duration: u32,
    pub pts_offset: i32,
    pub is_non_sync: bool,
    pub payload: Bytes,
}

/// One track of an output fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartTrack {
    pub id: u32,
    pub base_time: u64,
    pub samples: Vec<PartSample>,
}

/// An output fragment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub sequence_number: u32,
    pub tracks: Vec<PartTrack>,
}

fn sample_flags(is_non_sync: bool) -> u32 {
    if is_non_sync {
        // depends on others, non-sync
        0x0100_0000 | SAMPLE_NON_SYNC
    } else {
        0x0200_0000
    }
}

impl Part {
    fn write_moof(&self, data_offsets: &[i32]) -> Vec<u8> {
        let mut mfhd = fullbox_header(0, 0).to_vec();
        mfhd.extend_from_slice(&self.sequence_number.to_be_bytes());
        let mfhd = write_box(b"mfhd", &mfhd);

        let trafs: Vec<Vec<u8>> = self
            .tracks
            .iter()
            .zip(data_offsets)
            .map(|(track, data_offset)| {
                let mut tfhd = fullbox_header(0, TFHD_DEFAULT_BASE_IS_MOOF).to_vec();
                tfhd.extend_from_slice(&track.id.to_be_bytes());
                let tfhd = write_box(b"tfhd", &tfhd);

                let mut tfdt = fullbox_header(1, 0).to_vec();
                tfdt.extend_from_slice(&track.base_time.to_be_bytes());
                let tfdt = write_box(b"tfdt", &tfdt);

                let flags = TRUN_DATA_OFFSET | TRUN_DURATION | TRUN_SIZE | TRUN_FLAGS | TRUN_CTS;
                let mut trun = Vec::with_capacity(12 + track.samples.len() * 16);
                trun.extend_from_slice(&fullbox_header(1, flags));
                trun.extend_from_slice(&(track.samples.len() as u32).to_be_bytes());
                trun.extend_from_slice(&data_offset.to_be_bytes());
                for s in &track.samples {
                    trun.extend_from_slice(&s.duration.to_be_bytes());
                    trun.extend_from_slice(&(s.payload.len() as u32).to_be_bytes());
                    trun.extend_from_slice(&sample_flags(s.is_non_sync).to_be_bytes());
                    trun.extend_from_slice(&s.pts_offset.to_be_bytes());
                }
                let trun = write_box(b"trun", &trun);

                write_container_box(b"traf", &[&tfhd, &tfdt, &trun])
            })
            .collect();

        let mut children: Vec<&[u8]> = vec![mfhd.as_slice()];
        children.extend(trafs.iter().map(|t| t.as_slice()));
        write_container_box(b"moof", &children)
    }

    /// Encode as `moof` + `mdat`.
    pub fn marshal(&self) -> Result<Vec<u8>> {
        let track_sizes: Vec<u64> = self
            .tracks
            .iter()
            .map(|t| t.samples.iter().map(|s| s.payload.len() as u64).sum())
            .collect();
        let mdat_len: u64 = track_sizes.iter().sum();
        let mdat_hdr = mdat_header(mdat_len);

        // The moof size does not depend on the offsets it carries.
        let moof_len = self.write_moof(&vec![0; self.tracks.len()]).len() as u64;

        let mut offsets = Vec::with_capacity(self.tracks.len());
        let mut pos = moof_len + mdat_hdr.len() as u64;
        for size in &track_sizes {
            let offset = i32::try_from(pos).map_err(|_| {
                PlaybackError::Internal("fragment too large for 32-bit data offset".into())
            })?;
            offsets.push(offset);
            pos += size;
        }

        let mut out = self.write_moof(&offsets);
        out.reserve(mdat_hdr.len() + mdat_len as usize);
        out.extend_from_slice(&mdat_hdr);
        for track in &self.tracks {
            for s in &track.samples {
                out.extend_from_slice(&s.payload);
            }
        }
        Ok(out)
    }
}
