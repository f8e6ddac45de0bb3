//! Client for enqueueing and inspecting jobs.

use chrono::Utc;

use crate::backend::{Backend, SharedBackend};
use crate::config::{self, keys, DEFAULT_MAX_RETRIES};
use crate::error::{QueueError, Result};
use crate::job::{Job, JobState, NewJob, StateCounts};
use crate::registry::WorkerRecord;

/// Snapshot of the queue for operators.
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub counts: StateCounts,
    pub workers: Vec<WorkerRecord>,
}

/// Operator-facing access to the queue.
#[derive(Clone)]
pub struct Client<B: Backend + Clone = SharedBackend> {
    backend: B,
}

impl Client<SharedBackend> {
    /// Create a new client with a shared backend.
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: SharedBackend::new(backend),
        }
    }
}

impl<B: Backend + Clone> Client<B> {
    /// Create a new client with a specific backend.
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Add a job to the queue, due immediately.
    ///
    /// Without an explicit `max_retries`, the store's current default is
    /// used.
    pub async fn enqueue(&self, new_job: NewJob) -> Result<Job> {
        new_job.validate()?;

        let max_retries = match new_job.max_retries {
            Some(max_retries) => max_retries,
            None => self.default_max_retries().await?,
        };
        let job = new_job.into_job(max_retries, Utc::now())?;

        self.backend.insert_job(&job).await?;

        tracing::debug!(job_id = %job.id, priority = job.priority, "Job enqueued");
        Ok(job)
    }

    async fn default_max_retries(&self) -> Result<u32> {
        let raw = self
            .backend
            .get_config(keys::MAX_RETRIES, &DEFAULT_MAX_RETRIES.to_string())
            .await?;
        raw.trim().parse::<u32>().map_err(|_| {
            QueueError::Config(format!("stored max_retries '{}' is not a valid count", raw))
        })
    }

    /// Get a job by id.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.backend.get_job(job_id).await
    }

    /// List jobs, optionally filtered by state.
    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.backend.list_jobs(state).await
    }

    /// Job counts per state and the registered workers.
    pub async fn status(&self) -> Result<QueueStatus> {
        Ok(QueueStatus {
            counts: self.backend.count_by_state().await?,
            workers: self.backend.list_workers().await?,
        })
    }

    /// Jobs in the dead letter queue.
    pub async fn dead_jobs(&self) -> Result<Vec<Job>> {
        self.backend.list_jobs(Some(JobState::Dead)).await
    }

    /// Re-queue a dead job. Its attempt history is kept.
    pub async fn retry_dead(&self, job_id: &str) -> Result<Job> {
        let job = self.backend.retry_dead(job_id, Utc::now()).await?;
        tracing::info!(job_id = %job_id, attempts = job.attempts, "Dead job re-queued");
        Ok(job)
    }

    /// Read a runtime setting, or its default. Unknown unset keys read as
    /// an empty string.
    pub async fn get_config(&self, key: &str) -> Result<String> {
        let key = config::normalize_key(key);
        let default = config::default_value(&key).unwrap_or_default();
        self.backend.get_config(&key, &default).await
    }

    /// Write a runtime setting. Known keys are validated.
    ///
    /// Returns the normalized key and value that were stored.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(String, String)> {
        let key = config::normalize_key(key);
        if key.is_empty() {
            return Err(QueueError::Config("config key must not be empty".to_string()));
        }
        let value = config::normalize_value(&key, value)?;
        self.backend.set_config(&key, &value).await?;
        tracing::debug!(key = %key, value = %value, "Config updated");
        Ok((key, value))
    }
}
