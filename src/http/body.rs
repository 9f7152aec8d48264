//! Streamed muxer output
//!
//! Muxing runs on the blocking pool and hands its output to the response
//! body through a bounded channel. The response status is decided when the
//! first chunk arrives: a failure before that point is still reported to
//! the client, a failure after it can only be logged.

use axum::{
    body::Body,
    http::{header, HeaderValue},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::{self, BufWriter, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use crate::config::RecordFormat;
use crate::error::{PlaybackError, Result};
use crate::mux::{FragmentedMuxer, Mp4Muxer};
use crate::request::Format;
use crate::seek::seek_and_mux;
use crate::segment::Segment;

/// Size of the chunks handed to the response body
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the muxer and the socket
const CHANNEL_DEPTH: usize = 8;

/// `Write` adapter that forwards every write as one chunk
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response body dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Everything needed to mux one window
pub struct MuxJob {
    pub format: Format,
    pub record_format: RecordFormat,
    pub segments: Vec<Segment>,
    pub start: DateTime<Utc>,
    pub duration: Duration,
    pub tolerance: Duration,
}

impl MuxJob {
    fn run(self, tx: mpsc::Sender<Bytes>) -> Result<Duration> {
        let writer = BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx });
        let MuxJob {
            format,
            record_format,
            segments,
            start,
            duration,
            tolerance,
        } = self;

        match format {
            Format::Mp4 => {
                let mut muxer = Mp4Muxer::new(writer);
                let produced =
                    seek_and_mux(record_format, &segments, start, duration, tolerance, &mut muxer)?;
                muxer.into_inner().flush()?;
                Ok(produced)
            }
            Format::Fmp4 | Format::Hls => {
                let mut muxer = FragmentedMuxer::new(writer);
                let produced =
                    seek_and_mux(record_format, &segments, start, duration, tolerance, &mut muxer)?;
                muxer.into_inner().flush()?;
                Ok(produced)
            }
        }
    }
}

fn log_outcome(path: &str, result: std::result::Result<Result<Duration>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(produced)) => tracing::info!("Served {:?} of {}", produced, path),
        Ok(Err(e)) if e.is_client_abort() => tracing::debug!("Client went away while streaming {}", path),
        Ok(Err(e)) => tracing::error!("Streaming {} failed after the response started: {}", path, e),
        Err(e) => tracing::error!("Mux task for {} failed: {}", path, e),
    }
}

fn video_response(body: Body) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("none"));
    response
}

async fn join(task: JoinHandle<Result<Duration>>) -> Result<Duration> {
    task.await
        .map_err(|e| PlaybackError::Internal(format!("mux task failed: {}", e)))?
}

/// Start muxing `job` and build the response once its outcome is known or
/// its first bytes are ready.
pub async fn stream_mux(path: String, job: MuxJob) -> Result<Response> {
    let (tx, mut rx) = mpsc::channel::<Bytes>(CHANNEL_DEPTH);
    let task = tokio::task::spawn_blocking(move || job.run(tx));

    let first = match rx.recv().await {
        Some(chunk) => chunk,
        None => {
            // the muxer finished without writing anything
            let produced = join(task).await?;
            tracing::info!("Served {:?} of {}", produced, path);
            return Ok(video_response(Body::empty()));
        }
    };

    tokio::spawn(async move { log_outcome(&path, task.await) });

    let stream = tokio_stream::once(first)
        .chain(ReceiverStream::new(rx))
        .map(Ok::<_, io::Error>);
    Ok(video_response(Body::from_stream(stream)))
}
