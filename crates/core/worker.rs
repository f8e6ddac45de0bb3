//! The per-process worker loop.
//!
//! One worker executes one job at a time. Coordination with other worker
//! processes happens only through the backend's transactions; nothing in
//! here locks in memory.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::config::WorkerConfig;
use crate::error::Result;
use crate::executor::Executor;
use crate::job::{Job, JobState};
use crate::recovery::Recovery;
use crate::registry::{generate_worker_id, WorkerRecord};
use crate::shutdown::ShutdownCoordinator;

const CLAIM_RETRY_STEP: Duration = Duration::from_millis(50);

/// Backoff steps are capped at this multiple of `CLAIM_RETRY_STEP`.
const MAX_RETRY_STEPS: u32 = 20;

/// Run `op` until it succeeds or fails with a non-transient error.
///
/// Used for writes that must not be dropped, such as the result of a job
/// that has already executed.
pub(crate) async fn retry_transient<T, F, Fut>(
    worker_id: &str,
    action: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() => {
                attempt = attempt.saturating_add(1);
                tracing::warn!(worker_id, action, attempt, error = %e, "Store busy, retrying");
                tokio::time::sleep(CLAIM_RETRY_STEP * attempt.min(MAX_RETRY_STEPS)).await;
            }
            result => return result,
        }
    }
}

/// Lifecycle of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    /// Registering and recovering orphans.
    Starting,
    /// Claiming and executing jobs.
    Running,
    /// No longer claiming; leaving the loop.
    Draining,
    /// Deregistered.
    Stopped,
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed and scheduled for another attempt.
    Retrying { next_run_at: DateTime<Utc> },
    /// Failed for the last time.
    Dead,
    /// The result could not be recorded because the job was no longer
    /// held by this worker.
    ClaimLost,
}

/// A job handled by one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedJob {
    pub job_id: String,
    pub outcome: JobOutcome,
}

/// Counters for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead: usize,
    pub lost: usize,
}

impl WorkerSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        self.claimed += 1;
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying { .. } => self.retried += 1,
            JobOutcome::Dead => self.dead += 1,
            JobOutcome::ClaimLost => self.lost += 1,
        }
    }
}

/// A worker loop bound to one backend and executor.
pub struct Worker<B: Backend, E: Executor> {
    id: String,
    backend: B,
    executor: E,
    config: WorkerConfig,
    stop: CancellationToken,
    phase: watch::Sender<WorkerPhase>,
}

impl<B: Backend, E: Executor> Worker<B, E> {
    pub fn new(backend: B, executor: E, config: WorkerConfig) -> Self {
        let id = config.worker_id.clone().unwrap_or_else(generate_worker_id);
        let (phase, _) = watch::channel(WorkerPhase::Starting);

        Self {
            id,
            backend,
            executor,
            config,
            stop: CancellationToken::new(),
            phase,
        }
    }

    /// Stop claiming when `token` is cancelled, in addition to the store's
    /// shutdown flag.
    pub fn with_stop_token(mut self, token: CancellationToken) -> Self {
        self.stop = token;
        self
    }

    /// Get the worker ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Token that stops this worker from claiming further jobs.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Watch the worker's phase.
    pub fn phase(&self) -> watch::Receiver<WorkerPhase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.send_replace(phase);
    }

    /// Run the worker until shutdown is requested or the store fails.
    ///
    /// The worker registers itself, recovers orphaned jobs, then claims and
    /// executes jobs one at a time. Its registration is removed on every
    /// exit path.
    pub async fn run(&self) -> Result<WorkerSummary> {
        self.set_phase(WorkerPhase::Starting);

        let record = WorkerRecord::for_current_process(&self.id, Utc::now());
        let registered = retry_transient(&self.id, "register worker", || {
            self.backend.register_worker(&record)
        })
        .await;
        if let Err(e) = registered {
            self.set_phase(WorkerPhase::Stopped);
            return Err(e);
        }
        tracing::info!(worker_id = %self.id, pid = record.pid, "Worker started");

        let result = self.run_registered().await;

        let deregistered = retry_transient(&self.id, "deregister worker", || {
            self.backend.deregister_worker(&self.id)
        })
        .await;
        self.set_phase(WorkerPhase::Stopped);

        match (result, deregistered) {
            (Ok(summary), Ok(())) => {
                tracing::info!(
                    worker_id = %self.id,
                    claimed = summary.claimed,
                    completed = summary.completed,
                    retried = summary.retried,
                    dead = summary.dead,
                    "Worker stopped"
                );
                Ok(summary)
            }
            (Ok(_), Err(e)) => {
                tracing::error!(worker_id = %self.id, error = %e, "Failed to deregister worker");
                Err(e)
            }
            (Err(e), deregistered) => {
                if let Err(dereg) = deregistered {
                    tracing::error!(worker_id = %self.id, error = %dereg, "Failed to deregister worker");
                }
                tracing::error!(worker_id = %self.id, error = %e, "Worker stopped on store error");
                Err(e)
            }
        }
    }

    async fn run_registered(&self) -> Result<WorkerSummary> {
        let mut summary = WorkerSummary::default();

        let recovery = Recovery::new(&self.backend, self.config.recovery_policy);
        let recovered =
            retry_transient(&self.id, "recover orphaned jobs", || recovery.run(Utc::now())).await?;
        summary.recovered = recovered.len();

        self.set_phase(WorkerPhase::Running);
        let shutdown = ShutdownCoordinator::new(&self.backend);

        loop {
            if self.stop.is_cancelled() {
                tracing::info!(worker_id = %self.id, "Stop requested, draining");
                break;
            }
            if shutdown.is_shutdown_requested().await? {
                tracing::info!(worker_id = %self.id, "Shutdown flag set, draining");
                break;
            }

            match self.poll_once().await? {
                Some(processed) => summary.record(&processed.outcome),
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = self.stop.cancelled() => {}
                    }
                }
            }
        }

        self.set_phase(WorkerPhase::Draining);
        Ok(summary)
    }

    /// Run a single claim/execute/update cycle.
    ///
    /// Returns `None` when no job was due. Job failures are recorded on the
    /// job; only store errors are returned.
    pub async fn poll_once(&self) -> Result<Option<ProcessedJob>> {
        let job = match self.claim().await? {
            Some(job) => job,
            None => return Ok(None),
        };

        tracing::debug!(
            worker_id = %self.id,
            job_id = %job.id,
            attempts = job.attempts,
            "Processing job"
        );

        let execution = self.executor.execute(&job.command).await;

        let update = if execution.is_success() {
            retry_transient(&self.id, "complete job", || {
                self.backend.complete_job(&job.id, &self.id, Utc::now())
            })
            .await
        } else {
            retry_transient(&self.id, "fail job", || {
                self.backend
                    .fail_job(&job.id, &self.id, &execution.error_text, Utc::now())
            })
            .await
        };

        let outcome = match update {
            Ok(updated) => self.report(&updated),
            Err(e) if e.is_job_scoped() => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %e,
                    "Could not record job result"
                );
                JobOutcome::ClaimLost
            }
            Err(e) => return Err(e),
        };

        Ok(Some(ProcessedJob {
            job_id: job.id,
            outcome,
        }))
    }

    fn report(&self, job: &Job) -> JobOutcome {
        match job.state {
            JobState::Completed => {
                tracing::debug!(worker_id = %self.id, job_id = %job.id, "Job completed successfully");
                JobOutcome::Completed
            }
            JobState::Dead => {
                tracing::warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = job.last_error.as_deref().unwrap_or(""),
                    "Job moved to dead letter queue"
                );
                JobOutcome::Dead
            }
            _ => {
                tracing::debug!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    attempts = job.attempts,
                    retry_at = %job.next_run_at,
                    "Job scheduled for retry"
                );
                JobOutcome::Retrying {
                    next_run_at: job.next_run_at,
                }
            }
        }
    }

    async fn claim(&self) -> Result<Option<Job>> {
        let mut attempt = 0;
        loop {
            match self.backend.claim_next(&self.id, Utc::now()).await {
                Ok(job) => return Ok(job),
                Err(e) if e.is_transient() && attempt < self.config.claim_retry_limit => {
                    attempt += 1;
                    tracing::warn!(
                        worker_id = %self.id,
                        attempt,
                        error = %e,
                        "Claim conflicted, retrying"
                    );
                    tokio::time::sleep(CLAIM_RETRY_STEP * attempt).await;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        worker_id = %self.id,
                        error = %e,
                        "Claim still conflicting, skipping this cycle"
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
