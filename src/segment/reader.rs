//! Segment header reader and span extraction

use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::time::Duration;

use crate::error::{PlaybackError, Result};
use crate::fmp4::boxes::{read_box_header, read_payload};
use crate::fmp4::part::parse_moof;
use crate::fmp4::Init;
use crate::mux::Muxer;

/// A seekable byte source
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

const NANOS_PER_SEC: i128 = 1_000_000_000;

fn to_ticks(nanos: i128, time_scale: u32) -> i128 {
    nanos * time_scale as i128 / NANOS_PER_SEC
}

fn to_nanos(ticks: i128, time_scale: u32) -> i128 {
    ticks * NANOS_PER_SEC / time_scale as i128
}

/// Parse the container header at the start of a segment.
///
/// Returns the header and the offset of the first byte after `moov`; the
/// reader is left positioned there.
pub fn read_header<R: Read + Seek + ?Sized>(r: &mut R) -> Result<(Init, u64)> {
    r.seek(SeekFrom::Start(0))?;

    let first = read_box_header(r)?
        .ok_or_else(|| PlaybackError::MalformedContainer("empty file".into()))?;
    if &first.box_type != b"ftyp" {
        return Err(PlaybackError::MalformedContainer(format!(
            "expected ftyp, found '{}'",
            first.type_str()
        )));
    }
    read_payload(r, &first)?;

    loop {
        let header = read_box_header(r)?
            .ok_or_else(|| PlaybackError::MalformedContainer("moov not found".into()))?;

        if &header.box_type == b"moov" {
            let payload = read_payload(r, &header)?;
            let init = Init::unmarshal(&payload)?;
            let pos = r.stream_position()?;
            return Ok((init, pos));
        }

        let len = header.payload_len().ok_or_else(|| {
            PlaybackError::MalformedContainer("moov not found".into())
        })?;
        r.seek(SeekFrom::Current(len as i64))?;
    }
}

struct TrackCursor {
    time_scale: u32,
    /// Window start expressed in track ticks, relative to the segment's zero
    offset_ticks: i128,
    duration_ticks: i128,
    /// End of the last emitted sample
    last_end: Option<i128>,
    done: bool,
}

/// Feed the media of one segment into `muxer`.
///
/// `segment_offset` is the segment's start relative to the window start and
/// is negative when the window begins inside the segment. Samples whose
/// decode time lies at or beyond `duration` are not emitted. Returns the
/// end of the produced media, relative to the window start and capped at
/// `duration`.
pub fn mux_parts<R, M>(
    r: &mut R,
    segment_offset: chrono::Duration,
    duration: Duration,
    init: &Init,
    muxer: &mut M,
) -> Result<Duration>
where
    R: Read + Seek + ?Sized,
    M: Muxer + ?Sized,
{
    let offset_nanos = segment_offset.num_nanoseconds().ok_or_else(|| {
        PlaybackError::InvalidRequest("segment offset is out of range".into())
    })? as i128;
    let duration_nanos = duration.as_nanos() as i128;

    let mut cursors: HashMap<u32, TrackCursor> = init
        .tracks
        .iter()
        .map(|t| {
            (
                t.id,
                TrackCursor {
                    time_scale: t.time_scale,
                    offset_ticks: to_ticks(offset_nanos, t.time_scale),
                    duration_ticks: to_ticks(duration_nanos, t.time_scale),
                    last_end: None,
                    done: false,
                },
            )
        })
        .collect();

    let media_start = r.stream_position()?;
    let file_len = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(media_start))?;

    loop {
        if cursors.values().all(|c| c.done) {
            break;
        }

        let moof_start = r.stream_position()?;
        let Some(header) = read_box_header(r)? else {
            break;
        };

        if &header.box_type != b"moof" {
            match header.payload_len() {
                Some(len) => {
                    r.seek(SeekFrom::Current(len as i64))?;
                    continue;
                }
                None => break,
            }
        }

        let payload = read_payload(r, &header)?;
        let resume_at = r.stream_position()?;
        let fragments = parse_moof(&payload, moof_start)?;

        for fragment in fragments {
            let Some(cursor) = cursors.get_mut(&fragment.track_id) else {
                continue;
            };
            if cursor.done {
                continue;
            }

            muxer.set_track(fragment.track_id)?;

            let mut dts = fragment.base_time as i128 + cursor.offset_ticks;
            for sample in &fragment.samples {
                if dts >= cursor.duration_ticks {
                    cursor.done = true;
                    break;
                }

                if sample
                    .offset
                    .checked_add(sample.size as u64)
                    .map_or(true, |end| end > file_len)
                {
                    return Err(PlaybackError::MalformedContainer(
                        "sample data is truncated".into(),
                    ));
                }
                r.seek(SeekFrom::Start(sample.offset))?;
                let mut buf = vec![0u8; sample.size as usize];
                r.read_exact(&mut buf).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        PlaybackError::MalformedContainer("sample data is truncated".into())
                    } else {
                        PlaybackError::Io(e)
                    }
                })?;

                let out_dts = i64::try_from(dts).map_err(|_| {
                    PlaybackError::MalformedContainer("decode time out of range".into())
                })?;
                muxer.write_sample(
                    out_dts,
                    sample.pts_offset,
                    sample.is_non_sync,
                    Bytes::from(buf),
                )?;

                dts += sample.duration as i128;
                cursor.last_end = Some(dts);
            }
        }

        r.seek(SeekFrom::Start(resume_at))?;
    }

    let mut produced: i128 = 0;
    for track in &init.tracks {
        let Some(cursor) = cursors.get(&track.id) else {
            continue;
        };
        let Some(end) = cursor.last_end else {
            continue;
        };
        muxer.set_track(track.id)?;
        muxer.write_final_dts(i64::try_from(end).map_err(|_| {
            PlaybackError::MalformedContainer("decode time out of range".into())
        })?)?;
        produced = produced.max(to_nanos(end, cursor.time_scale));
    }

    let produced = produced.clamp(0, duration_nanos);
    Ok(Duration::from_nanos(produced as u64))
}
