//! # queuectl-core - Core types and traits for the queuectl job queue
//!
//! queuectl runs shell-command jobs in a pool of independent worker
//! processes that share one transactional store. This crate provides:
//! - `Backend` trait for storage implementations
//! - `Job`, `JobState`, `NewJob` types and the lifecycle rules
//! - `Worker`, the per-process claim/execute/update loop
//! - `Supervisor` and `ShutdownCoordinator` for graceful shutdown
//! - `Client` for enqueueing and inspecting jobs
//! - Error types

mod backend;
mod client;
mod config;
mod error;
mod executor;
mod job;
pub mod lifecycle;
mod recovery;
mod registry;
mod shutdown;
mod supervisor;
mod worker;

// Re-export main types
pub use backend::{Backend, DynBackend, SharedBackend};
pub use client::{Client, QueueStatus};
pub use config::{
    default_value, keys, normalize_key, normalize_value, parse_flag, WorkerConfig,
    WorkerConfigBuilder, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES,
};
pub use error::{QueueError, Result};
pub use executor::{ExecutionOutcome, Executor, ShellExecutor};
pub use job::{Job, JobState, NewJob, StateCounts};
pub use recovery::{Recovery, RecoveryPolicy};
pub use registry::{generate_worker_id, WorkerRecord};
pub use shutdown::ShutdownCoordinator;
pub use supervisor::Supervisor;
pub use worker::{JobOutcome, ProcessedJob, Worker, WorkerPhase, WorkerSummary};
