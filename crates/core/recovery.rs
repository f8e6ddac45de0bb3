//! Startup recovery of orphaned jobs.
//!
//! A worker process killed mid-execution leaves its job in `processing`.
//! Before a worker starts claiming, recovery returns such jobs to `failed`,
//! due immediately, without consuming an attempt.
//!
//! With [`RecoveryPolicy::AllProcessing`] every `processing` row is assumed
//! orphaned. That is only correct when no sibling worker is mid-execution
//! while a new worker starts; starting a worker next to live ones can hand
//! a running job to a second worker. [`RecoveryPolicy::UnregisteredOnly`]
//! narrows recovery to rows whose worker has no registration, at the cost
//! of never recovering jobs of a crashed worker whose record was left
//! behind. A [`Supervisor`](crate::Supervisor) runs one recovery pass before
//! spawning, so the workers it starts use `UnregisteredOnly`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::Result;

/// Which `processing` jobs recovery treats as orphaned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Every `processing` job.
    #[default]
    AllProcessing,
    /// Only jobs whose `worker_id` has no registered worker record.
    UnregisteredOnly,
}

/// Recovery pass run once per worker start.
pub struct Recovery<'a, B: Backend + ?Sized> {
    backend: &'a B,
    policy: RecoveryPolicy,
}

impl<'a, B: Backend + ?Sized> Recovery<'a, B> {
    pub fn new(backend: &'a B, policy: RecoveryPolicy) -> Self {
        Self { backend, policy }
    }

    /// Recover orphaned jobs. Returns the ids that were moved to `failed`.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let recovered = self.backend.recover_orphaned(self.policy, now).await?;

        if recovered.is_empty() {
            tracing::debug!(policy = ?self.policy, "No orphaned jobs to recover");
        } else {
            tracing::info!(
                count = recovered.len(),
                policy = ?self.policy,
                "Recovered orphaned jobs"
            );
            for job_id in &recovered {
                tracing::debug!(job_id = %job_id, "Orphaned job returned to failed");
            }
        }

        Ok(recovered)
    }
}
