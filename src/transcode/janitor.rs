//! Removal of idle HLS output directories

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::coordinator::Coordinator;
use super::DONE_MARKER;

/// How often the janitor sweeps
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Remove every entry below `dir`. Returns the number of entries removed.
pub fn clear_all(dir: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Last time a job directory was written or served
fn last_used(dir: &Path) -> io::Result<SystemTime> {
    let dir_time = std::fs::metadata(dir)?.modified()?;
    let marker_time = std::fs::metadata(dir.join(DONE_MARKER))
        .and_then(|m| m.modified())
        .unwrap_or(dir_time);
    Ok(dir_time.max(marker_time))
}

/// Remove job directories idle for longer than `ttl`, skipping those for
/// which `is_active` returns true. Returns the removed paths.
pub fn sweep<F>(dir: &Path, ttl: Duration, now: SystemTime, is_active: F) -> io::Result<Vec<PathBuf>>
where
    F: Fn(&str) -> bool,
{
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if is_active(&name) {
            continue;
        }

        let idle = now
            .duration_since(last_used(&path)?)
            .unwrap_or(Duration::ZERO);
        if idle > ttl {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed.push(path),
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
    Ok(removed)
}

/// Clear `dir` now, then sweep it every [`SWEEP_INTERVAL`].
pub fn start_janitor(
    dir: PathBuf,
    ttl: Duration,
    coordinator: Arc<Coordinator>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let startup_dir = dir.clone();
        match tokio::task::spawn_blocking(move || clear_all(&startup_dir)).await {
            Ok(Ok(n)) if n > 0 => tracing::info!("Removed {} stale HLS output(s)", n),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Failed to clear {}: {}", dir.display(), e),
            Err(e) => tracing::warn!("Janitor task failed: {}", e),
        }

        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let sweep_dir = dir.clone();
            let coordinator = coordinator.clone();
            let result = tokio::task::spawn_blocking(move || {
                sweep(&sweep_dir, ttl, SystemTime::now(), |token| {
                    coordinator.has_token(token)
                })
            })
            .await;

            match result {
                Ok(Ok(removed)) if !removed.is_empty() => {
                    tracing::info!("Removed {} idle HLS output(s)", removed.len())
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!("HLS sweep of {} failed: {}", dir.display(), e),
                Err(e) => tracing::warn!("Janitor task failed: {}", e),
            }
        }
    })
}
