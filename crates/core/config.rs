//! Configuration types for the job queue.
//!
//! Two kinds of configuration exist. [`WorkerConfig`] is fixed for the
//! lifetime of a process. Runtime settings ([`keys`]) live in the store and
//! are read fresh at every decision point, since any process may change
//! them.

use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::recovery::RecoveryPolicy;

/// Runtime configuration keys stored in the backend.
pub mod keys {
    /// Default retry ceiling for new jobs.
    pub const MAX_RETRIES: &str = "max_retries";
    /// Base of the exponential backoff, in seconds.
    pub const BACKOFF_BASE: &str = "backoff_base";
    /// `"true"` asks every worker to stop claiming.
    pub const SHUTDOWN: &str = "shutdown";
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

/// The default value of a known runtime key.
pub fn default_value(key: &str) -> Option<String> {
    match key {
        keys::MAX_RETRIES => Some(DEFAULT_MAX_RETRIES.to_string()),
        keys::BACKOFF_BASE => Some(DEFAULT_BACKOFF_BASE.to_string()),
        keys::SHUTDOWN => Some("false".to_string()),
        _ => None,
    }
}

/// Normalize an operator-supplied key (`max-retries` -> `max_retries`).
pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('-', "_")
}

/// Validate and canonicalize a value for a runtime key.
///
/// Unknown keys are passed through untouched.
pub fn normalize_value(key: &str, value: &str) -> Result<String> {
    let value = value.trim();
    match key {
        keys::MAX_RETRIES => value
            .parse::<u32>()
            .map(|v| v.to_string())
            .map_err(|_| {
                QueueError::Config(format!(
                    "max_retries must be a non-negative integer, got '{}'",
                    value
                ))
            }),
        keys::BACKOFF_BASE => match value.parse::<f64>() {
            Ok(base) if base.is_finite() && base >= 1.0 => Ok(base.to_string()),
            _ => Err(QueueError::Config(format!(
                "backoff_base must be a number >= 1, got '{}'",
                value
            ))),
        },
        keys::SHUTDOWN => parse_flag(value)
            .map(|flag| flag.to_string())
            .ok_or_else(|| {
                QueueError::Config(format!("shutdown must be true or false, got '{}'", value))
            }),
        _ => Ok(value.to_string()),
    }
}

/// Parse a boolean-as-string flag.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Configuration for worker processes and their supervisor.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Fixed worker id. Generated at start when unset.
    pub worker_id: Option<String>,
    /// Sleep between claims when no job is due.
    pub poll_interval: Duration,
    /// How many times a conflicting claim transaction is retried per cycle.
    pub claim_retry_limit: u32,
    /// Which `processing` rows are treated as orphaned at startup.
    pub recovery_policy: RecoveryPolicy,
    /// Number of worker processes the supervisor spawns.
    pub num_workers: usize,
    /// How long the supervisor waits for workers to drain before killing
    /// them. `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            poll_interval: Duration::from_secs(1),
            claim_retry_limit: 5,
            recovery_policy: RecoveryPolicy::default(),
            num_workers: 1,
            drain_timeout: None,
        }
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed worker id.
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = Some(id.into());
        self
    }

    /// Set the idle poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the claim conflict retry limit.
    pub fn claim_retry_limit(mut self, limit: u32) -> Self {
        self.config.claim_retry_limit = limit;
        self
    }

    /// Set the startup recovery policy.
    pub fn recovery_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.config.recovery_policy = policy;
        self
    }

    /// Set the number of worker processes.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the drain timeout.
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout = Some(timeout);
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> Result<WorkerConfig> {
        if self.config.num_workers == 0 {
            return Err(QueueError::Config(
                "at least one worker is required".to_string(),
            ));
        }
        if self.config.poll_interval.is_zero() {
            return Err(QueueError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(self.config)
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }
}
