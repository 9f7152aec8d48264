//! HLS packaging
//!
//! This module turns a recorded window into an HLS package on disk:
//! - `token`: request fingerprints used as job and directory names
//! - `coordinator`: deduplication and bounded execution of jobs
//! - `encoder`: the external encoder process
//! - `janitor`: removal of idle output directories

pub mod coordinator;
pub mod encoder;
pub mod janitor;
pub mod token;

use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RecordFormat;
use crate::error::{PlaybackError, Result};
use crate::mux::Mp4Muxer;
use crate::seek::seek_and_mux;
use crate::segment::Segment;

pub use coordinator::{Coordinator, Job, JobInfo, JobState};
pub use encoder::{Encoder, FfmpegEncoder, SharedEncoder};
pub use token::compute_token;

/// Manifest written by the encoder
pub const PLAYLIST_NAME: &str = "index.m3u8";

/// Written once a package is complete
pub const DONE_MARKER: &str = ".done";

const TRIMMED_NAME: &str = "trimmed.mp4";
const CONCAT_LIST_NAME: &str = "list.txt";

/// Everything a job needs to produce one package
#[derive(Debug, Clone)]
pub struct HlsJobSpec {
    pub dir: PathBuf,
    pub segments: Vec<Segment>,
    pub record_format: RecordFormat,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub segment_secs: u64,
    pub tolerance: Duration,
    pub deadline: Duration,
}

/// Output directory of the job identified by `token`
pub fn output_dir(root: &Path, token: &str) -> PathBuf {
    root.join(token)
}

/// Whether `dir` holds a finished package
pub fn is_complete(dir: &Path) -> bool {
    dir.join(DONE_MARKER).is_file()
}

/// Refresh the package's last-use time so the janitor keeps it.
pub async fn touch(dir: &Path) {
    if let Err(e) = tokio::fs::write(dir.join(DONE_MARKER), b"").await {
        tracing::debug!("Failed to touch {}: {}", dir.display(), e);
    }
}

fn secs_arg(d: Duration) -> String {
    format!("{:.3}", d.as_secs_f64())
}

/// Encoder arguments packaging `input` into `playlist`.
pub fn encoder_args(input: Vec<String>, segment_secs: u64, playlist: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-loglevel".into(), "error".into()];
    args.extend(input);
    args.extend(
        [
            "-c",
            "copy",
            "-f",
            "hls",
            "-hls_time",
            &segment_secs.to_string(),
            "-hls_list_size",
            "0",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(playlist.to_string_lossy().to_string());
    args
}

/// Lines of an ffmpeg concat list referencing `segments`.
fn concat_list(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| {
            let path = s.path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", path)
        })
        .collect()
}

/// Remux the window into a self-contained MP4 the encoder can seek in.
async fn remux_window(spec: &HlsJobSpec) -> Result<Vec<String>> {
    let path = spec.dir.join(TRIMMED_NAME);
    let segments = spec.segments.clone();
    let (start, duration, tolerance) = (spec.start, spec.duration, spec.tolerance);
    let out = path.clone();

    let written = tokio::task::spawn_blocking(move || -> Result<u64> {
        let file = File::create(&out)?;
        let mut muxer = Mp4Muxer::new(BufWriter::new(file));
        seek_and_mux(
            RecordFormat::Fmp4,
            &segments,
            start,
            duration,
            tolerance,
            &mut muxer,
        )?;
        muxer.into_inner().flush()?;
        Ok(std::fs::metadata(&out)?.len())
    })
    .await
    .map_err(|e| PlaybackError::Internal(format!("remux task failed: {}", e)))??;

    if written == 0 {
        return Err(PlaybackError::NotFound(
            "no media in the requested window".into(),
        ));
    }
    Ok(vec!["-i".into(), path.to_string_lossy().to_string()])
}

/// Concatenate MPEG-TS segments through the encoder's concat demuxer.
async fn concat_input(spec: &HlsJobSpec) -> Result<Vec<String>> {
    let first = spec
        .segments
        .first()
        .ok_or_else(|| PlaybackError::NotFound("no recordings found".into()))?;

    let list = spec.dir.join(CONCAT_LIST_NAME);
    tokio::fs::write(&list, concat_list(&spec.segments)).await?;

    let offset = spec
        .start
        .signed_duration_since(first.start)
        .to_std()
        .unwrap_or(Duration::ZERO);

    Ok(vec![
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.to_string_lossy().to_string(),
        "-ss".into(),
        secs_arg(offset),
        "-t".into(),
        secs_arg(spec.duration),
    ])
}

async fn build_package(spec: &HlsJobSpec, encoder: &dyn Encoder, job: &Job) -> Result<()> {
    // an earlier job for this token may have finished since the caller looked
    if is_complete(&spec.dir) {
        tracing::debug!("Output {} is already complete", spec.dir.display());
        return Ok(());
    }

    match tokio::fs::remove_dir_all(&spec.dir).await {
        Ok(()) => tracing::debug!("Replaced incomplete output {}", spec.dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(&spec.dir).await?;

    let input = match spec.record_format {
        RecordFormat::Fmp4 => remux_window(spec).await?,
        RecordFormat::Mpegts => concat_input(spec).await?,
    };

    let playlist = spec.dir.join(PLAYLIST_NAME);
    let args = encoder_args(input, spec.segment_secs, &playlist);
    encoder.run(args, spec.deadline, job).await?;

    if !tokio::fs::try_exists(&playlist).await.unwrap_or(false) {
        return Err(PlaybackError::SubprocessFailure(
            "encoder did not write a playlist".into(),
        ));
    }
    tokio::fs::write(spec.dir.join(DONE_MARKER), b"").await?;
    Ok(())
}

/// Produce the package described by `spec`. A failed job leaves no
/// directory behind.
pub async fn generate(spec: HlsJobSpec, encoder: SharedEncoder, job: Arc<Job>) -> Result<()> {
    let result = build_package(&spec, encoder.as_ref(), &job).await;

    if result.is_err() {
        if let Err(e) = tokio::fs::remove_dir_all(&spec.dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {}", spec.dir.display(), e);
            }
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integration::fixtures::{t0, video_init, write_segment, FakeEncoder};
    use tempfile::TempDir;

    fn spec(root: &TempDir, segments: Vec<Segment>, format: RecordFormat) -> HlsJobSpec {
        HlsJobSpec {
            dir: output_dir(&root.path().join("hls"), "token"),
            segments,
            record_format: format,
            start: t0() + chrono::Duration::seconds(2),
            duration: Duration::from_secs(4),
            segment_secs: 10,
            tolerance: Duration::from_millis(500),
            deadline: Duration::from_secs(5),
        }
    }

    fn job() -> Arc<Job> {
        Coordinator::new(1).acquire_or_join("c", "token").1
    }

    #[test]
    fn test_encoder_args() {
        let args = encoder_args(
            vec!["-i".into(), "in.mp4".into()],
            6,
            Path::new("/out/index.m3u8"),
        );
        assert_eq!(args[..5], ["-y", "-loglevel", "error", "-i", "in.mp4"]);
        let pos = args.iter().position(|a| a == "-hls_time").unwrap();
        assert_eq!(args[pos + 1], "6");
        assert_eq!(args.last().unwrap(), "/out/index.m3u8");
    }

    #[test]
    fn test_concat_list_quotes() {
        let list = concat_list(&[Segment {
            path: PathBuf::from("/rec/it's.ts"),
            start: t0(),
        }]);
        assert_eq!(list, "file '/rec/it'\\''s.ts'\n");
    }

    #[tokio::test]
    async fn test_generate_from_fmp4() {
        let root = TempDir::new().unwrap();
        let file = write_segment(root.path(), "cam", t0(), &video_init(), 10);
        let spec = spec(&root, vec![Segment { path: file, start: t0() }], RecordFormat::Fmp4);
        let encoder = Arc::new(FakeEncoder::default());

        generate(spec.clone(), encoder.clone(), job()).await.unwrap();

        assert!(is_complete(&spec.dir));
        assert!(spec.dir.join(PLAYLIST_NAME).is_file());
        assert!(std::fs::metadata(spec.dir.join(TRIMMED_NAME)).unwrap().len() > 0);
        assert_eq!(encoder.runs(), 1);
    }

    #[tokio::test]
    async fn test_generate_from_mpegts() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("seg.ts");
        std::fs::write(&path, b"ts").unwrap();
        let spec = spec(&root, vec![Segment { path, start: t0() }], RecordFormat::Mpegts);
        let encoder = Arc::new(FakeEncoder::default());

        generate(spec.clone(), encoder.clone(), job()).await.unwrap();

        let args = encoder.last_args();
        assert!(args.windows(2).any(|w| w[0] == "-f" && w[1] == "concat"));
        assert!(args.windows(2).any(|w| w[0] == "-ss" && w[1] == "2.000"));
        assert!(args.windows(2).any(|w| w[0] == "-t" && w[1] == "4.000"));
        assert!(spec.dir.join(CONCAT_LIST_NAME).is_file());
    }

    #[tokio::test]
    async fn test_generate_keeps_completed_output() {
        let root = TempDir::new().unwrap();
        let file = write_segment(root.path(), "cam", t0(), &video_init(), 10);
        let spec = spec(&root, vec![Segment { path: file, start: t0() }], RecordFormat::Fmp4);
        std::fs::create_dir_all(&spec.dir).unwrap();
        std::fs::write(spec.dir.join(PLAYLIST_NAME), "#EXTM3U\n").unwrap();
        std::fs::write(spec.dir.join(DONE_MARKER), b"").unwrap();
        let encoder = Arc::new(FakeEncoder::default());

        generate(spec.clone(), encoder.clone(), job()).await.unwrap();

        assert_eq!(encoder.runs(), 0);
        assert_eq!(
            std::fs::read_to_string(spec.dir.join(PLAYLIST_NAME)).unwrap(),
            "#EXTM3U\n"
        );
        assert!(!spec.dir.join(TRIMMED_NAME).exists());
    }

    #[tokio::test]
    async fn test_failed_job_removes_directory() {
        let root = TempDir::new().unwrap();
        let file = write_segment(root.path(), "cam", t0(), &video_init(), 10);
        let spec = spec(&root, vec![Segment { path: file, start: t0() }], RecordFormat::Fmp4);
        let encoder = Arc::new(FakeEncoder::failing());

        let err = generate(spec.clone(), encoder, job()).await.unwrap_err();
        assert!(matches!(err, PlaybackError::SubprocessFailure(_)));
        assert!(!spec.dir.exists());
    }
}
