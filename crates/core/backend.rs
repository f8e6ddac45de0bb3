//! Backend abstraction for job queue storage.
//!
//! The backend is the only shared mutable resource between worker
//! processes. It exposes atomic operations rather than row access: every
//! job mutation re-reads the row, validates its precondition and writes the
//! new state inside a single write-serializing transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::job::{Job, JobState, StateCounts};
use crate::recovery::RecoveryPolicy;
use crate::registry::WorkerRecord;

/// Backend trait for job queue storage operations.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Backend: Send + Sync {
    // ========== Jobs ==========

    /// Insert a new job. Fails with `DuplicateId` if the id exists.
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Fetch a job by id.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// List jobs ordered by creation time, optionally filtered by state.
    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>>;

    /// Count jobs per state.
    async fn count_by_state(&self) -> Result<StateCounts>;

    // ========== Lifecycle ==========

    /// Atomically claim the next due job for `worker_id`.
    ///
    /// Picks one job with `state in (pending, failed)` and
    /// `next_run_at <= now`, ordered by priority (desc), `next_run_at` (asc)
    /// and `created_at` (asc), and moves it to `processing`. Returns `None`
    /// when nothing is due. A `Conflict` error means the whole claim may be
    /// retried; no job was claimed.
    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Move a job held by `worker_id` to `completed`.
    async fn complete_job(&self, job_id: &str, worker_id: &str, now: DateTime<Utc>)
        -> Result<Job>;

    /// Record a failed execution of a job held by `worker_id`.
    ///
    /// Reads `backoff_base` inside the same transaction and moves the job to
    /// `failed` (with backoff) or `dead`.
    async fn fail_job(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job>;

    /// Return orphaned `processing` jobs to `failed`, due at `now`, without
    /// consuming an attempt. Returns the recovered job ids.
    async fn recover_orphaned(
        &self,
        policy: RecoveryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Move a dead job back to `pending`, due at `now`. Keeps `attempts`
    /// and `last_error`.
    async fn retry_dead(&self, job_id: &str, now: DateTime<Utc>) -> Result<Job>;

    // ========== Config ==========

    /// Read a runtime config value.
    async fn config_value(&self, key: &str) -> Result<Option<String>>;

    /// Read a runtime config value, falling back to `default` when absent.
    async fn get_config(&self, key: &str, default: &str) -> Result<String> {
        Ok(self
            .config_value(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    /// Insert or replace a runtime config value.
    async fn set_config(&self, key: &str, value: &str) -> Result<()>;

    // ========== Workers ==========

    /// Register (or re-register) a worker process.
    async fn register_worker(&self, record: &WorkerRecord) -> Result<()>;

    /// Remove a worker registration. Removing an unknown id is not an error.
    async fn deregister_worker(&self, worker_id: &str) -> Result<()>;

    /// List registered workers.
    async fn list_workers(&self) -> Result<Vec<WorkerRecord>>;
}

/// A type-erased backend that can be shared across tasks.
pub type DynBackend = Arc<dyn Backend>;

/// Wrapper around Arc<dyn Backend> for convenience.
#[derive(Clone)]
pub struct SharedBackend {
    inner: DynBackend,
}

impl SharedBackend {
    /// Create a new SharedBackend from any Backend implementation.
    pub fn new<B: Backend + 'static>(backend: B) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    /// Get a reference to the inner backend.
    pub fn inner(&self) -> &DynBackend {
        &self.inner
    }
}

#[async_trait]
impl Backend for SharedBackend {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.inner.insert_job(job).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        self.inner.list_jobs(state).await
    }

    async fn count_by_state(&self) -> Result<StateCounts> {
        self.inner.count_by_state().await
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.inner.claim_next(worker_id, now).await
    }

    async fn complete_job(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.inner.complete_job(job_id, worker_id, now).await
    }

    async fn fail_job(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.inner.fail_job(job_id, worker_id, error, now).await
    }

    async fn recover_orphaned(
        &self,
        policy: RecoveryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        self.inner.recover_orphaned(policy, now).await
    }

    async fn retry_dead(&self, job_id: &str, now: DateTime<Utc>) -> Result<Job> {
        self.inner.retry_dead(job_id, now).await
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>> {
        self.inner.config_value(key).await
    }

    async fn get_config(&self, key: &str, default: &str) -> Result<String> {
        self.inner.get_config(key, default).await
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_config(key, value).await
    }

    async fn register_worker(&self, record: &WorkerRecord) -> Result<()> {
        self.inner.register_worker(record).await
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        self.inner.deregister_worker(worker_id).await
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        self.inner.list_workers().await
    }
}
