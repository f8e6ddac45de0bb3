//! Error types for the queuectl job queue.

use thiserror::Error;

use crate::job::JobState;

/// The main error type for queuectl.
#[derive(Error, Debug)]
pub enum QueueError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job with the same id is already stored.
    #[error("Duplicate job id: {0}")]
    DuplicateId(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job is not in a state that allows the requested transition.
    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobState,
        to: JobState,
    },

    /// The job is no longer held by this worker.
    #[error("Claim lost: job {job_id} is no longer processing under worker {worker_id}")]
    ClaimLost { job_id: String, worker_id: String },

    /// The job definition is malformed.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another writer held the store; the operation can be retried as a whole.
    #[error("Store conflict: {0}")]
    Conflict(String),

    /// Worker process management error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl QueueError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Conflict(_))
    }

    /// Whether the error only concerns one job's bookkeeping and must not
    /// stop a worker.
    pub fn is_job_scoped(&self) -> bool {
        matches!(
            self,
            QueueError::ClaimLost { .. }
                | QueueError::InvalidTransition { .. }
                | QueueError::JobNotFound(_)
        )
    }
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_serialization() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err = QueueError::Serialization(json_err);
        let display = format!("{}", err);
        assert!(display.starts_with("Serialization error:"));
    }

    #[test]
    fn test_error_display_duplicate_id() {
        let err = QueueError::DuplicateId("job1".to_string());
        assert_eq!(format!("{}", err), "Duplicate job id: job1");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = QueueError::InvalidTransition {
            job_id: "job1".to_string(),
            from: JobState::Completed,
            to: JobState::Pending,
        };
        assert_eq!(
            format!("{}", err),
            "Invalid transition for job job1: completed -> pending"
        );
    }

    #[test]
    fn test_error_display_claim_lost() {
        let err = QueueError::ClaimLost {
            job_id: "job1".to_string(),
            worker_id: "w-1".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Claim lost: job job1 is no longer processing under worker w-1"
        );
    }

    #[test]
    fn test_error_display_backend() {
        let err = QueueError::Backend("disk I/O error".to_string());
        assert_eq!(format!("{}", err), "Backend error: disk I/O error");
    }

    #[test]
    fn test_only_conflict_is_transient() {
        assert!(QueueError::Conflict("database is locked".to_string()).is_transient());
        assert!(!QueueError::Backend("database is locked".to_string()).is_transient());
        assert!(!QueueError::DuplicateId("a".to_string()).is_transient());
    }

    #[test]
    fn test_job_scoped_errors() {
        assert!(QueueError::JobNotFound("a".to_string()).is_job_scoped());
        assert!(QueueError::ClaimLost {
            job_id: "a".to_string(),
            worker_id: "w".to_string()
        }
        .is_job_scoped());
        assert!(!QueueError::Backend("io".to_string()).is_job_scoped());
        assert!(!QueueError::Conflict("busy".to_string()).is_job_scoped());
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: QueueError = json_err.into();
        assert!(matches!(err, QueueError::Serialization(_)));
    }
}
