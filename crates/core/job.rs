//! Job definition and related types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{QueueError, Result};

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker and executing.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed and waiting for its backoff to elapse.
    Failed,
    /// Exhausted its retries. Only an operator can bring it back.
    Dead,
}

impl JobState {
    /// All states, in display order.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    /// States a worker may claim from (subject to `next_run_at`).
    pub fn is_claimable(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    /// Whether `self -> to` is a valid lifecycle transition.
    ///
    /// `processing -> failed` also covers recovery of orphaned jobs, and
    /// `dead -> pending` is the operator's DLQ retry.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Failed, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Dead)
                | (Dead, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::InvalidJob(format!("unknown job state '{}'", other))),
        }
    }
}

/// A shell-command job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Caller-supplied unique identifier.
    pub id: String,
    /// Command handed to the executor.
    pub command: String,
    pub state: JobState,
    /// Number of failed executions so far. Never decreases.
    pub attempts: u32,
    /// The job is dead-lettered once `attempts` reaches this value.
    pub max_retries: u32,
    /// Higher values are claimed first.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The job cannot be claimed before this instant.
    pub next_run_at: DateTime<Utc>,
    /// Truncated diagnostic text from the most recent failure.
    pub last_error: Option<String>,
    /// Worker holding the job, or the last one that held it.
    pub worker_id: Option<String>,
}

impl Job {
    /// Whether a claim at `now` may pick this job.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state.is_claimable() && self.next_run_at <= now
    }

    /// Whether `worker_id` currently holds this job.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Processing && self.worker_id.as_deref() == Some(worker_id)
    }
}

/// A job submission, as accepted by `Client::enqueue`.
///
/// This is also the JSON payload format of `queuectl enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    /// Overrides the store's `max_retries` default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub priority: i64,
}

impl NewJob {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            max_retries: None,
            priority: 0,
        }
    }

    /// Set the retry ceiling for this job.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set the claim priority.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Parse a JSON payload.
    pub fn from_json(json: &str) -> Result<Self> {
        let job: NewJob = serde_json::from_str(json)?;
        job.validate()?;
        Ok(job)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(QueueError::InvalidJob("job id must not be empty".to_string()));
        }
        if self.command.trim().is_empty() {
            return Err(QueueError::InvalidJob(format!(
                "job {} has an empty command",
                self.id
            )));
        }
        Ok(())
    }

    /// Build the stored form of this submission.
    pub fn into_job(self, default_max_retries: u32, now: DateTime<Utc>) -> Result<Job> {
        self.validate()?;
        Ok(Job {
            id: self.id,
            command: self.command,
            state: JobState::Pending,
            attempts: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            priority: self.priority,
            created_at: now,
            updated_at: now,
            next_run_at: now,
            last_error: None,
            worker_id: None,
        })
    }
}

/// Number of jobs per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> usize {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn add(&mut self, state: JobState, count: usize) {
        match state {
            JobState::Pending => self.pending += count,
            JobState::Processing => self.processing += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> usize {
        JobState::ALL.iter().map(|s| self.get(*s)).sum()
    }

    /// Every state with its count, zeros included.
    pub fn iter(&self) -> impl Iterator<Item = (JobState, usize)> + '_ {
        JobState::ALL.iter().map(move |s| (*s, self.get(*s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(" DEAD ".parse::<JobState>().unwrap(), JobState::Dead);
        assert!("running".parse::<JobState>().is_err());
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&JobState::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let state: JobState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(state, JobState::Failed);
    }

    #[test]
    fn test_valid_transitions() {
        use JobState::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Dead));
        assert!(Dead.can_transition_to(Pending));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Dead.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Processing.can_transition_to(Processing));
    }

    #[test]
    fn test_claimable_and_terminal() {
        assert!(JobState::Pending.is_claimable());
        assert!(JobState::Failed.is_claimable());
        assert!(!JobState::Dead.is_claimable());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Failed.is_terminal());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = NewJob::new("job1", "echo hi").into_job(3, ts(100)).unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.priority, 0);
        assert_eq!(job.created_at, ts(100));
        assert_eq!(job.updated_at, ts(100));
        assert_eq!(job.next_run_at, ts(100));
        assert!(job.last_error.is_none());
        assert!(job.worker_id.is_none());
        assert!(job.is_due(ts(100)));
        assert!(!job.is_due(ts(99)));
    }

    #[test]
    fn test_new_job_overrides() {
        let job = NewJob::new("job1", "false")
            .max_retries(5)
            .priority(10)
            .into_job(3, ts(0))
            .unwrap();
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.priority, 10);
    }

    #[test]
    fn test_new_job_from_json() {
        let job = NewJob::from_json(r#"{"id":"job1","command":"sleep 2"}"#).unwrap();
        assert_eq!(job, NewJob::new("job1", "sleep 2"));

        let job =
            NewJob::from_json(r#"{"id":"a","command":"ls","max_retries":1,"priority":-4}"#).unwrap();
        assert_eq!(job.max_retries, Some(1));
        assert_eq!(job.priority, -4);
    }

    #[test]
    fn test_new_job_rejects_empty_fields() {
        assert!(matches!(
            NewJob::from_json(r#"{"id":"","command":"ls"}"#),
            Err(QueueError::InvalidJob(_))
        ));
        assert!(matches!(
            NewJob::new("a", "  ").into_job(3, ts(0)),
            Err(QueueError::InvalidJob(_))
        ));
        assert!(matches!(
            NewJob::from_json(r#"{"command":"ls"}"#),
            Err(QueueError::Serialization(_))
        ));
    }

    #[test]
    fn test_is_held_by() {
        let mut job = NewJob::new("a", "ls").into_job(3, ts(0)).unwrap();
        assert!(!job.is_held_by("w-1"));
        job.state = JobState::Processing;
        job.worker_id = Some("w-1".to_string());
        assert!(job.is_held_by("w-1"));
        assert!(!job.is_held_by("w-2"));
    }

    #[test]
    fn test_state_counts() {
        let mut counts = StateCounts::default();
        counts.add(JobState::Pending, 2);
        counts.add(JobState::Dead, 1);
        counts.add(JobState::Pending, 1);
        assert_eq!(counts.get(JobState::Pending), 3);
        assert_eq!(counts.total(), 4);
        let listed: Vec<_> = counts.iter().collect();
        assert_eq!(listed.len(), 5);
        assert_eq!(listed[0], (JobState::Pending, 3));
        assert_eq!(listed[4], (JobState::Dead, 1));
    }
}
