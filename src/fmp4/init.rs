//! Container header (`ftyp` + `moov`) of a fragmented MP4 file.
//!
//! Only the fields that identify a track are decoded; the codec sample
//! entry is kept as opaque bytes and re-emitted verbatim.

use bytes::Bytes;

use super::boxes::{
    fullbox_header, walk_boxes, write_box, write_container_box, write_ftyp, ByteReader,
};
use crate::error::{PlaybackError, Result};

/// Timescale used for movie-level durations
pub const MOVIE_TIMESCALE: u32 = 1000;

/// One track of a container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitTrack {
    pub id: u32,
    pub time_scale: u32,
    /// Handler type (`vide`, `soun`, ...)
    pub handler: [u8; 4],
    /// Display size in pixels, zero for non-visual tracks
    pub width: u32,
    pub height: u32,
    /// First sample entry of `stsd` (e.g. a complete `avc1` box)
    pub sample_entry: Bytes,
}

impl InitTrack {
    pub fn is_video(&self) -> bool {
        &self.handler == b"vide"
    }
}

/// Parsed container header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    pub tracks: Vec<InitTrack>,
}

#[derive(Default)]
struct TrakFields {
    id: Option<u32>,
    time_scale: Option<u32>,
    handler: Option<[u8; 4]>,
    width: u32,
    height: u32,
    sample_entry: Option<Bytes>,
}

fn parse_tkhd(payload: &[u8], fields: &mut TrakFields) -> Result<()> {
    let mut r = ByteReader::new(payload, "tkhd");
    let (version, _) = r.full_box_header()?;
    if version == 1 {
        r.skip(16)?;
        fields.id = Some(r.u32()?);
        r.skip(4 + 8)?;
    } else {
        r.skip(8)?;
        fields.id = Some(r.u32()?);
        r.skip(4 + 4)?;
    }
    // reserved, layer, alternate_group, volume, reserved, matrix
    r.skip(8 + 2 + 2 + 2 + 2 + 36)?;
    fields.width = r.u32()? >> 16;
    fields.height = r.u32()? >> 16;
    Ok(())
}

fn parse_mdhd(payload: &[u8], fields: &mut TrakFields) -> Result<()> {
    let mut r = ByteReader::new(payload, "mdhd");
    let (version, _) = r.full_box_header()?;
    r.skip(if version == 1 { 16 } else { 8 })?;
    fields.time_scale = Some(r.u32()?);
    Ok(())
}

fn parse_hdlr(payload: &[u8], fields: &mut TrakFields) -> Result<()> {
    let mut r = ByteReader::new(payload, "hdlr");
    r.full_box_header()?;
    r.skip(4)?;
    let t = r.bytes(4)?;
    fields.handler = Some([t[0], t[1], t[2], t[3]]);
    Ok(())
}

fn parse_stsd(payload: &[u8], fields: &mut TrakFields) -> Result<()> {
    let mut r = ByteReader::new(payload, "stsd");
    r.full_box_header()?;
    let count = r.u32()?;
    if count == 0 {
        return Err(PlaybackError::MalformedContainer(
            "stsd has no sample entries".into(),
        ));
    }
    let rest = &payload[8..];
    if rest.len() < 8 {
        return Err(PlaybackError::MalformedContainer("stsd is truncated".into()));
    }
    let size = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    if size < 8 || size > rest.len() {
        return Err(PlaybackError::MalformedContainer(
            "stsd sample entry overruns its parent".into(),
        ));
    }
    fields.sample_entry = Some(Bytes::copy_from_slice(&rest[..size]));
    Ok(())
}

fn parse_trak(payload: &[u8]) -> Result<InitTrack> {
    let mut fields = TrakFields::default();

    walk_boxes(payload, &[b"mdia", b"minf", b"stbl"], &mut |t, p| match t {
        b"tkhd" => parse_tkhd(p, &mut fields),
        b"mdhd" => parse_mdhd(p, &mut fields),
        b"hdlr" => parse_hdlr(p, &mut fields),
        b"stsd" => parse_stsd(p, &mut fields),
        _ => Ok(()),
    })?;

    let missing = |what: &str| PlaybackError::MalformedContainer(format!("trak without {}", what));

    let id = fields.id.filter(|id| *id != 0).ok_or_else(|| missing("track id"))?;
    let time_scale = fields
        .time_scale
        .filter(|ts| *ts != 0)
        .ok_or_else(|| missing("timescale"))?;

    Ok(InitTrack {
        id,
        time_scale,
        handler: fields.handler.ok_or_else(|| missing("hdlr"))?,
        width: fields.width,
        height: fields.height,
        sample_entry: fields.sample_entry.ok_or_else(|| missing("sample entry"))?,
    })
}

impl Init {
    /// Decode the payload of a `moov` box.
    pub fn unmarshal(moov: &[u8]) -> Result<Self> {
        let mut tracks: Vec<InitTrack> = Vec::new();

        walk_boxes(moov, &[], &mut |t, p| {
            if t == b"trak" {
                let track = parse_trak(p)?;
                if tracks.iter().any(|other| other.id == track.id) {
                    return Err(PlaybackError::MalformedContainer(format!(
                        "duplicate track id {}",
                        track.id
                    )));
                }
                tracks.push(track);
            }
            Ok(())
        })?;

        if tracks.is_empty() {
            return Err(PlaybackError::MalformedContainer("moov has no tracks".into()));
        }

        Ok(Self { tracks })
    }

    pub fn track(&self, id: u32) -> Option<&InitTrack> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Encode as a fragmented-MP4 initialization segment (`ftyp` + `moov`
    /// with `mvex`).
    pub fn marshal(&self) -> Vec<u8> {
        let mvhd = write_mvhd(MOVIE_TIMESCALE, 0, self.next_track_id());

        let traks: Vec<Vec<u8>> = self
            .tracks
            .iter()
            .map(|t| write_trak(t, 0, 0, None, &empty_stbl(t)))
            .collect();

        let trexs: Vec<Vec<u8>> = self.tracks.iter().map(|t| write_trex(t.id)).collect();
        let trex_refs: Vec<&[u8]> = trexs.iter().map(|v| v.as_slice()).collect();
        let mvex = write_container_box(b"mvex", &trex_refs);

        let mut children: Vec<&[u8]> = vec![mvhd.as_slice()];
        children.extend(traks.iter().map(|v| v.as_slice()));
        children.push(&mvex);
        let moov = write_container_box(b"moov", &children);

        let mut out = write_ftyp();
        out.extend_from_slice(&moov);
        out
    }

    pub(crate) fn next_track_id(&self) -> u32 {
        self.tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1
    }
}

// ---------------------------------------------------------------------------
// moov building blocks, shared with the progressive MP4 muxer
// ---------------------------------------------------------------------------

const IDENTITY_MATRIX: [u32; 9] = [0x00010000, 0, 0, 0, 0x00010000, 0, 0, 0, 0x40000000];

fn push_matrix(content: &mut Vec<u8>) {
    for v in IDENTITY_MATRIX {
        content.extend_from_slice(&v.to_be_bytes());
    }
}

/// Movie header, version 1 for 64-bit durations.
pub(crate) fn write_mvhd(timescale: u32, duration: u64, next_track_id: u32) -> Vec<u8> {
    let mut content = Vec::with_capacity(112);
    content.extend_from_slice(&fullbox_header(1, 0));
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&timescale.to_be_bytes());
    content.extend_from_slice(&duration.to_be_bytes());
    // rate 1.0, volume 1.0
    content.extend_from_slice(&0x00010000u32.to_be_bytes());
    content.extend_from_slice(&0x0100u16.to_be_bytes());
    content.extend_from_slice(&[0u8; 10]);
    push_matrix(&mut content);
    content.extend_from_slice(&[0u8; 24]);
    content.extend_from_slice(&next_track_id.to_be_bytes());
    write_box(b"mvhd", &content)
}

fn write_tkhd(track: &InitTrack, duration: u64) -> Vec<u8> {
    let mut content = Vec::with_capacity(96);
    // enabled | in_movie
    content.extend_from_slice(&fullbox_header(1, 3));
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&track.id.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&duration.to_be_bytes());
    content.extend_from_slice(&[0u8; 8]);
    content.extend_from_slice(&0u16.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    let volume: u16 = if &track.handler == b"soun" { 0x0100 } else { 0 };
    content.extend_from_slice(&volume.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    push_matrix(&mut content);
    content.extend_from_slice(&(track.width << 16).to_be_bytes());
    content.extend_from_slice(&(track.height << 16).to_be_bytes());
    write_box(b"tkhd", &content)
}

fn write_mdhd(timescale: u32, duration: u64) -> Vec<u8> {
    let mut content = Vec::with_capacity(36);
    content.extend_from_slice(&fullbox_header(1, 0));
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&0u64.to_be_bytes());
    content.extend_from_slice(&timescale.to_be_bytes());
    content.extend_from_slice(&duration.to_be_bytes());
    // language: undetermined
    content.extend_from_slice(&0x55C4u16.to_be_bytes());
    content.extend_from_slice(&0u16.to_be_bytes());
    write_box(b"mdhd", &content)
}

fn write_hdlr(handler: &[u8; 4]) -> Vec<u8> {
    let name: &[u8] = match handler {
        b"vide" => b"VideoHandler",
        b"soun" => b"SoundHandler",
        _ => b"DataHandler",
    };
    let mut content = Vec::with_capacity(25 + name.len());
    content.extend_from_slice(&fullbox_header(0, 0));
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(handler);
    content.extend_from_slice(&[0u8; 12]);
    content.extend_from_slice(name);
    content.push(0);
    write_box(b"hdlr", &content)
}

fn write_media_header(handler: &[u8; 4]) -> Vec<u8> {
    match handler {
        b"vide" => {
            let mut content = fullbox_header(0, 1).to_vec();
            content.extend_from_slice(&[0u8; 8]);
            write_box(b"vmhd", &content)
        }
        b"soun" => {
            let mut content = fullbox_header(0, 0).to_vec();
            content.extend_from_slice(&[0u8; 4]);
            write_box(b"smhd", &content)
        }
        _ => write_box(b"nmhd", &fullbox_header(0, 0)),
    }
}

fn write_dinf() -> Vec<u8> {
    let url = write_box(b"url ", &fullbox_header(0, 1));
    let mut dref = fullbox_header(0, 0).to_vec();
    dref.extend_from_slice(&1u32.to_be_bytes());
    dref.extend_from_slice(&url);
    let dref = write_box(b"dref", &dref);
    write_container_box(b"dinf", &[&dref])
}

pub(crate) fn write_stsd(track: &InitTrack) -> Vec<u8> {
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&track.sample_entry);
    write_box(b"stsd", &content)
}

/// A full box whose body is a single zero entry count.
fn write_empty_table(box_type: &[u8; 4]) -> Vec<u8> {
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&0u32.to_be_bytes());
    write_box(box_type, &content)
}

fn empty_stbl(track: &InitTrack) -> Vec<u8> {
    let stsd = write_stsd(track);
    let stts = write_empty_table(b"stts");
    let stsc = write_empty_table(b"stsc");
    let mut stsz = fullbox_header(0, 0).to_vec();
    stsz.extend_from_slice(&[0u8; 8]);
    let stsz = write_box(b"stsz", &stsz);
    let stco = write_empty_table(b"stco");
    write_container_box(b"stbl", &[&stsd, &stts, &stsc, &stsz, &stco])
}

/// Build a `trak` around an already serialized `stbl`.
pub(crate) fn write_trak(
    track: &InitTrack,
    movie_duration: u64,
    media_duration: u64,
    edts: Option<&[u8]>,
    stbl: &[u8],
) -> Vec<u8> {
    let tkhd = write_tkhd(track, movie_duration);
    let mdhd = write_mdhd(track.time_scale, media_duration);
    let hdlr = write_hdlr(&track.handler);
    let mhd = write_media_header(&track.handler);
    let dinf = write_dinf();
    let minf = write_container_box(b"minf", &[&mhd, &dinf, stbl]);
    let mdia = write_container_box(b"mdia", &[&mdhd, &hdlr, &minf]);

    match edts {
        Some(edts) => write_container_box(b"trak", &[&tkhd, edts, &mdia]),
        None => write_container_box(b"trak", &[&tkhd, &mdia]),
    }
}

fn write_trex(track_id: u32) -> Vec<u8> {
    let mut content = fullbox_header(0, 0).to_vec();
    content.extend_from_slice(&track_id.to_be_bytes());
    content.extend_from_slice(&1u32.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    content.extend_from_slice(&0u32.to_be_bytes());
    write_box(b"trex", &content)
}
