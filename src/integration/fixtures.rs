//! Test fixtures for integration tests
//!
//! Synthesises recorded fragmented-MP4 segments so the readers, muxers
//! and HTTP handlers can be exercised without real recordings.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{PlaybackError, Result};
use crate::fmp4::init::tests::{audio_track, video_track};
use crate::fmp4::{Init, Part, PartSample, PartTrack};
use crate::mux::Muxer;
use crate::segment::store::segment_file_name;
use crate::transcode::encoder::{Encoder, EncoderFuture};
use crate::transcode::Job;

/// Sample duration in ticks for a fixture track
fn sample_duration(time_scale: u32) -> u32 {
    match time_scale {
        // 30 fps
        90000 => 3000,
        // 50 frames of 960 samples per second
        48000 => 960,
        ts => ts / 10,
    }
}

/// Video only, 90 kHz
pub fn video_init() -> Init {
    Init {
        tracks: vec![video_track(1)],
    }
}

/// Video and audio
pub fn av_init() -> Init {
    Init {
        tracks: vec![video_track(1), audio_track(2)],
    }
}

/// A complete segment of `secs` seconds with one fragment per second.
/// Decode times start at `base_secs`; the first sample of every second is a
/// sync sample.
pub fn segment_bytes(init: &Init, base_secs: u64, secs: u32) -> Vec<u8> {
    let mut out = init.marshal();

    for sec in 0..secs {
        let tracks = init
            .tracks
            .iter()
            .map(|t| {
                let dur = sample_duration(t.time_scale);
                let count = t.time_scale / dur;
                PartTrack {
                    id: t.id,
                    base_time: (base_secs + sec as u64) * t.time_scale as u64,
                    samples: (0..count)
                        .map(|i| PartSample {
                            duration: dur,
                            pts_offset: 0,
                            is_non_sync: i != 0,
                            payload: Bytes::from(vec![t.id as u8, sec as u8, i as u8, 0xAA]),
                        })
                        .collect(),
                }
            })
            .collect();

        let part = Part {
            sequence_number: sec + 1,
            tracks,
        };
        out.extend_from_slice(&part.marshal().expect("fixture fragment"));
    }
    out
}

/// Write a segment into `<root>/<path>/` named after its start time.
pub fn write_segment(
    root: &Path,
    path: &str,
    start: DateTime<Utc>,
    init: &Init,
    secs: u32,
) -> PathBuf {
    let dir = root.join(path);
    std::fs::create_dir_all(&dir).expect("create recording dir");
    let file = dir.join(segment_file_name(start, "mp4"));
    std::fs::write(&file, segment_bytes(init, 0, secs)).expect("write segment");
    file
}

/// Reference time used by fixtures
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-05-01T08:00:00Z")
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

/// Muxer that records every call
#[derive(Debug, Default)]
pub struct RecordingMuxer {
    pub inits: Vec<Init>,
    /// (dts, track id, is_non_sync)
    pub samples: Vec<(i64, u32, bool)>,
    pub final_dts: Vec<i64>,
    pub flushes: usize,
    current: u32,
}

impl RecordingMuxer {
    pub fn track_samples(&self, id: u32) -> Vec<i64> {
        self.samples
            .iter()
            .filter(|s| s.1 == id)
            .map(|s| s.0)
            .collect()
    }
}

impl Muxer for RecordingMuxer {
    fn write_init(&mut self, init: &Init) -> Result<()> {
        self.inits.push(init.clone());
        Ok(())
    }

    fn set_track(&mut self, track_id: u32) -> Result<()> {
        self.current = track_id;
        Ok(())
    }

    fn write_sample(
        &mut self,
        dts: i64,
        _pts_offset: i32,
        is_non_sync: bool,
        _payload: Bytes,
    ) -> Result<()> {
        self.samples.push((dts, self.current, is_non_sync));
        Ok(())
    }

    fn write_final_dts(&mut self, dts: i64) -> Result<()> {
        self.final_dts.push(dts);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

/// Playlist written by [`FakeEncoder`]
pub const FAKE_PLAYLIST: &str =
    "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nindex0.ts\n#EXT-X-ENDLIST\n";

/// Encoder stand-in that writes a fixed playlist next to the last argument
#[derive(Debug, Default)]
pub struct FakeEncoder {
    runs: AtomicUsize,
    last_args: Mutex<Vec<String>>,
    fail: bool,
    delay: Duration,
}

impl FakeEncoder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn last_args(&self) -> Vec<String> {
        self.last_args.lock().clone()
    }
}

impl Encoder for FakeEncoder {
    fn run<'a>(&'a self, args: Vec<String>, _deadline: Duration, job: &'a Job) -> EncoderFuture<'a> {
        Box::pin(async move {
            self.runs.fetch_add(1, Ordering::SeqCst);
            *self.last_args.lock() = args.clone();
            job.set_running(Some(4242));

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(PlaybackError::SubprocessFailure("exit status: 1".into()));
            }

            let playlist = PathBuf::from(args.last().cloned().unwrap_or_default());
            if let Some(dir) = playlist.parent() {
                std::fs::write(dir.join("index0.ts"), b"segment")?;
            }
            std::fs::write(&playlist, FAKE_PLAYLIST)?;
            Ok(())
        })
    }
}
