//! Transcode job coordinator
//!
//! Keeps a per-client registry of in-flight HLS jobs keyed by token. The
//! first request for a token owns the job and starts it in a background
//! task; later identical requests wait for the same outcome. A counting
//! semaphore bounds how many jobs execute at once.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use crate::error::{PlaybackError, Result};

/// Lifecycle of a job
#[derive(Debug, Clone)]
pub enum JobState {
    /// Registered, waiting for an execution slot
    Pending,
    /// Executing; `pid` is set once the encoder process has started
    Running { pid: Option<u32> },
    Done,
    Failed(Arc<PlaybackError>),
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed(_))
    }

    fn name(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running { .. } => "running",
            JobState::Done => "done",
            JobState::Failed(_) => "failed",
        }
    }
}

/// One transcode job, shared by its owner and all waiters
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub client: String,
    pub token: String,
    pub created: DateTime<Utc>,
    state: watch::Sender<JobState>,
}

impl Job {
    fn new(client: &str, token: &str) -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        Self {
            id: Uuid::new_v4(),
            client: client.to_string(),
            token: token.to_string(),
            created: Utc::now(),
            state,
        }
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Record that the job is executing, optionally with the encoder's pid.
    pub fn set_running(&self, pid: Option<u32>) {
        self.state.send_replace(JobState::Running { pid });
    }

    fn finish(&self, result: &Result<()>) {
        let state = match result {
            Ok(()) => JobState::Done,
            Err(e) => JobState::Failed(Arc::new(e.duplicate())),
        };
        self.state.send_replace(state);
    }

    /// Wait until the job has finished and return its outcome.
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(JobState::is_finished)
            .await
            .map_err(|_| PlaybackError::Internal("job was dropped".into()))?
            .clone();
        match state {
            JobState::Failed(e) => Err(e.duplicate()),
            _ => Ok(()),
        }
    }

    /// Wait for the outcome unless `cancel` completes first, in which case
    /// `None` is returned and the job carries on.
    pub async fn wait_or_cancel<C>(&self, cancel: C) -> Option<Result<()>>
    where
        C: Future<Output = ()>,
    {
        tokio::select! {
            result = self.wait() => Some(result),
            _ = cancel => None,
        }
    }
}

/// Snapshot of an in-flight job
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub client: String,
    pub token: String,
    pub state: &'static str,
    pub pid: Option<u32>,
    pub created: DateTime<Utc>,
}

/// Registry of in-flight jobs
pub struct Coordinator {
    /// client key -> token -> job
    jobs: Mutex<HashMap<String, HashMap<String, Arc<Job>>>>,
    semaphore: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Return the job registered for `(client, token)`, creating it if
    /// there is none. The boolean is true when the caller created the job
    /// and must run it.
    pub fn acquire_or_join(&self, client: &str, token: &str) -> (bool, Arc<Job>) {
        let mut jobs = self.jobs.lock();
        let per_client = jobs.entry(client.to_string()).or_default();

        if let Some(job) = per_client.get(token) {
            return (false, job.clone());
        }

        let job = Arc::new(Job::new(client, token));
        per_client.insert(token.to_string(), job.clone());
        (true, job)
    }

    /// Look up an in-flight job.
    pub fn find(&self, client: &str, token: &str) -> Option<Arc<Job>> {
        self.jobs.lock().get(client)?.get(token).cloned()
    }

    /// Whether any client has an in-flight job for `token`.
    pub fn has_token(&self, token: &str) -> bool {
        self.jobs
            .lock()
            .values()
            .any(|per_client| per_client.contains_key(token))
    }

    /// Run `f` while holding the registry, so no job for `(client, token)`
    /// can start meanwhile. Returns `None` without running `f` when such a
    /// job is in flight.
    pub fn with_idle<R>(&self, client: &str, token: &str, f: impl FnOnce() -> R) -> Option<R> {
        let jobs = self.jobs.lock();
        if jobs.get(client).is_some_and(|per_client| per_client.contains_key(token)) {
            return None;
        }
        Some(f())
    }

    fn evict(&self, job: &Job) {
        let mut jobs = self.jobs.lock();
        if let Some(per_client) = jobs.get_mut(&job.client) {
            per_client.remove(&job.token);
            if per_client.is_empty() {
                jobs.remove(&job.client);
            }
        }
    }

    /// Execute an owned job: wait for a slot, run `work`, evict the job
    /// and publish the outcome to every waiter.
    pub async fn run_job<F, Fut>(&self, job: &Arc<Job>, work: F) -> Result<()>
    where
        F: FnOnce(Arc<Job>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let started = Instant::now();

        let result = match self.semaphore.acquire().await {
            Ok(_permit) => {
                job.set_running(None);
                work(job.clone()).await
            }
            Err(_) => Err(PlaybackError::Internal("job slots are closed".into())),
        };

        self.evict(job);
        job.finish(&result);

        match &result {
            Ok(()) => tracing::info!(
                "Job {} for {} completed in {:?}",
                job.token,
                job.client,
                started.elapsed()
            ),
            Err(e) => tracing::warn!("Job {} for {} failed: {}", job.token, job.client, e),
        }
        result
    }

    /// Register the job for `(client, token)` and, if it is new, start
    /// `work` in a background task. Returns the job to wait on.
    pub fn submit<F, Fut>(self: &Arc<Self>, client: &str, token: &str, work: F) -> Arc<Job>
    where
        F: FnOnce(Arc<Job>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (is_owner, job) = self.acquire_or_join(client, token);
        if is_owner {
            tracing::info!("Starting job {} for {}", token, client);
            let coordinator = Arc::clone(self);
            let owned = job.clone();
            tokio::spawn(async move {
                let _ = coordinator.run_job(&owned, work).await;
            });
        } else {
            tracing::debug!("Joining job {} for {}", token, client);
        }
        job
    }

    /// Snapshot of all in-flight jobs
    pub fn jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock();
        let mut out: Vec<JobInfo> = jobs
            .values()
            .flat_map(|per_client| per_client.values())
            .map(|job| {
                let state = job.state();
                JobInfo {
                    id: job.id.to_string(),
                    client: job.client.clone(),
                    token: job.token.clone(),
                    state: state.name(),
                    pid: match state {
                        JobState::Running { pid } => pid,
                        _ => None,
                    },
                    created: job.created,
                }
            })
            .collect();
        out.sort_by_key(|j| j.created);
        out
    }

    /// Number of in-flight jobs
    pub fn len(&self) -> usize {
        self.jobs.lock().values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
