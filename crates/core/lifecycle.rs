//! Job state transitions.
//!
//! Backends call into this module from inside the transaction that writes
//! the new state, so every rule here is evaluated against a freshly read row.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::DEFAULT_BACKOFF_BASE;
use crate::error::{QueueError, Result};
use crate::job::{Job, JobState};

/// Maximum stored length of `last_error`, in characters.
pub const MAX_ERROR_LEN: usize = 512;

/// Upper bound for a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Truncate error text to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Delay before a job that has failed `attempts` times becomes due again:
/// `base ^ attempts` seconds, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: f64, attempts: u32) -> Duration {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
    let secs = base.powi(exponent);
    Duration::try_from_secs_f64(secs)
        .map(|d| d.min(MAX_BACKOFF))
        .unwrap_or(MAX_BACKOFF)
}

/// Interpret a stored `backoff_base` value.
///
/// Anything that is not a finite number `>= 1` yields the default, so a bad
/// operator value can never block a failure from being recorded.
pub fn parse_backoff_base(raw: &str) -> f64 {
    match raw.trim().parse::<f64>() {
        Ok(base) if base.is_finite() && base >= 1.0 => base,
        _ => {
            tracing::warn!(value = raw, "Invalid backoff_base, using default");
            DEFAULT_BACKOFF_BASE
        }
    }
}

/// `updated_at` never moves backwards.
pub fn advance(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    previous.max(now)
}

fn add_delay(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Row values after a failed execution.
#[derive(Debug, Clone, PartialEq)]
pub struct FailurePlan {
    /// `Failed` or `Dead`.
    pub state: JobState,
    pub attempts: u32,
    /// Unchanged from the job when dead-lettered.
    pub next_run_at: DateTime<Utc>,
    pub last_error: String,
    pub updated_at: DateTime<Utc>,
}

impl FailurePlan {
    pub fn is_dead(&self) -> bool {
        self.state == JobState::Dead
    }
}

fn check_transition(job: &Job, to: JobState) -> Result<()> {
    if job.state.can_transition_to(to) {
        Ok(())
    } else {
        Err(QueueError::InvalidTransition {
            job_id: job.id.clone(),
            from: job.state,
            to,
        })
    }
}

/// Plan the `processing -> failed|dead` transition.
pub fn plan_failure(
    job: &Job,
    backoff_base: f64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<FailurePlan> {
    check_transition(job, JobState::Failed)?;

    let attempts = job.attempts.saturating_add(1);
    let (state, next_run_at) = if attempts >= job.max_retries {
        (JobState::Dead, job.next_run_at)
    } else {
        (
            JobState::Failed,
            add_delay(now, backoff_delay(backoff_base, attempts)),
        )
    };

    Ok(FailurePlan {
        state,
        attempts,
        next_run_at,
        last_error: truncate_error(error),
        updated_at: advance(job.updated_at, now),
    })
}

/// Plan the `processing -> completed` transition. Returns the new `updated_at`.
pub fn plan_completion(job: &Job, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    check_transition(job, JobState::Completed)?;
    Ok(advance(job.updated_at, now))
}

/// Plan the operator's `dead -> pending` retry. Returns the new `updated_at`;
/// `next_run_at` becomes `now`.
pub fn plan_dead_retry(job: &Job, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    check_transition(job, JobState::Pending)?;
    Ok(advance(job.updated_at, now))
}
