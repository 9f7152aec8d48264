//! External encoder invocation
//!
//! The encoder is an `ffmpeg`-compatible executable run as a subprocess
//! under a wall-clock deadline. It sits behind the [`Encoder`] trait so
//! tests can substitute an in-process fake.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use super::coordinator::Job;
use crate::error::{PlaybackError, Result};

/// Future returned by [`Encoder::run`]
pub type EncoderFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Runs one encoder invocation to completion
pub trait Encoder: Send + Sync {
    /// Run with `args`, killing the process once `deadline` elapses.
    /// Implementations record the process id on `job` once started.
    fn run<'a>(&'a self, args: Vec<String>, deadline: Duration, job: &'a Job) -> EncoderFuture<'a>;
}

/// Encoder backed by an executable on disk
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
}

impl FfmpegEncoder {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    async fn execute(&self, args: Vec<String>, deadline: Duration, job: &Job) -> Result<()> {
        let name = self.program_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            PlaybackError::SubprocessFailure(format!("failed to spawn {}: {}", name, e))
        })?;

        let pid = child.id();
        job.set_running(pid);
        tracing::debug!("{} started (pid {:?}): {}", name, pid, args.join(" "));

        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                Err(PlaybackError::SubprocessFailure(format!(
                    "{} exited with {}: {}",
                    name,
                    output.status,
                    tail.join(" | ")
                )))
            }
            Ok(Err(e)) => Err(PlaybackError::SubprocessFailure(format!(
                "failed waiting for {}: {}",
                name, e
            ))),
            Err(_) => Err(PlaybackError::SubprocessFailure(format!(
                "{} timed out after {:?}",
                name, deadline
            ))),
        }
    }
}

impl Encoder for FfmpegEncoder {
    fn run<'a>(&'a self, args: Vec<String>, deadline: Duration, job: &'a Job) -> EncoderFuture<'a> {
        Box::pin(self.execute(args, deadline, job))
    }
}

/// Shared handle to an encoder
pub type SharedEncoder = Arc<dyn Encoder>;
