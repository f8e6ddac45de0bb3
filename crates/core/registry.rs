//! Worker registration records.
//!
//! A record exists while a worker loop is running so operators can see who
//! is active. Recovery never depends on it unless
//! [`RecoveryPolicy::UnregisteredOnly`](crate::RecoveryPolicy) is chosen.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Unique per worker process, generated at start.
    pub id: String,
    /// OS process id, for operators only.
    pub pid: u32,
    /// Host the process runs on, for operators only.
    pub host: String,
    pub started_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Describe the current process as worker `id`.
    pub fn for_current_process(id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            pid: std::process::id(),
            host: current_host(),
            started_at,
        }
    }
}

fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Generate a unique worker id of the form `w-<8 hex chars>`.
pub fn generate_worker_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("w-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_generate_worker_id() {
        let id1 = generate_worker_id();
        let id2 = generate_worker_id();

        assert!(id1.starts_with("w-"));
        assert_eq!(id1.len(), 10);
        assert!(id1[2..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_record_for_current_process() {
        let started = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let record = WorkerRecord::for_current_process("w-abc", started);
        assert_eq!(record.id, "w-abc");
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.started_at, started);
        assert!(!record.host.is_empty());
    }
}
