use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use queuectl_core::{JobState, RecoveryPolicy};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(version)]
#[command(about = "Background job queue with worker processes, retries and a dead letter queue")]
#[command(propagate_version = true)]
pub struct Args {
    /// Directory holding the queue database (default: ~/.queuectl)
    #[arg(long, global = true, env = "QUEUECTL_HOME")]
    pub home: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', global = true, value_enum, default_value = "table")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add a new job to the queue
    Enqueue(EnqueueArgs),

    /// Start or stop worker processes
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },

    /// Show job counts per state and registered workers
    Status,

    /// List jobs, optionally filtered by state
    List {
        /// Only show jobs in this state (pending, processing, completed, failed, dead)
        #[arg(long)]
        state: Option<JobState>,
    },

    /// Inspect and re-queue dead jobs
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },

    /// Read or write runtime configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Job JSON, e.g. '{"id":"job1","command":"echo hi"}'
    #[arg(conflicts_with_all = ["json_file", "id"])]
    pub payload: Option<String>,

    /// Job id (use with --command)
    #[arg(long, requires = "command")]
    pub id: Option<String>,

    /// Shell command to run (use with --id)
    #[arg(long, requires = "id")]
    pub command: Option<String>,

    /// Read the JSON payload from a file
    #[arg(long, conflicts_with = "id")]
    pub json_file: Option<PathBuf>,

    /// Override the configured max_retries for this job
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Claim priority; higher runs first
    #[arg(long, allow_negative_numbers = true)]
    pub priority: Option<i64>,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Start worker processes and wait for them (Ctrl+C drains)
    Start {
        /// Number of worker processes
        #[arg(long, short = 'c', default_value_t = 1)]
        count: usize,

        /// Keep an existing shutdown flag instead of clearing it
        #[arg(long)]
        no_reset_shutdown: bool,

        #[command(flatten)]
        loop_args: LoopArgs,

        /// Kill workers still running this long after Ctrl+C
        #[arg(long)]
        drain_timeout_secs: Option<u64>,
    },

    /// Ask all workers to exit after their current job
    Stop,

    /// Run one worker loop in this process
    #[command(hide = true)]
    Run {
        #[command(flatten)]
        loop_args: LoopArgs,
    },
}

/// Worker loop settings. On `worker start`, `--recovery` applies to the
/// supervisor's recovery pass; its children always use `unregistered`.
#[derive(clap::Args, Debug, Clone, Copy)]
pub struct LoopArgs {
    /// Idle wait between claim attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub poll_interval_ms: u64,

    /// Which processing jobs count as orphaned at start
    #[arg(long, value_enum, default_value = "all")]
    pub recovery: RecoveryMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecoveryMode {
    /// Every processing job
    All,
    /// Only jobs whose worker is no longer registered
    Unregistered,
}

impl RecoveryMode {
    pub fn policy(self) -> RecoveryPolicy {
        match self {
            RecoveryMode::All => RecoveryPolicy::AllProcessing,
            RecoveryMode::Unregistered => RecoveryPolicy::UnregisteredOnly,
        }
    }

    pub fn as_arg(self) -> &'static str {
        match self {
            RecoveryMode::All => "all",
            RecoveryMode::Unregistered => "unregistered",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum DlqCommands {
    /// List dead jobs
    List,
    /// Move a dead job back to pending
    Retry {
        /// The job id
        job_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print a value (or its default)
    Get { key: String },
    /// Store a value
    Set { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_enqueue_flags() {
        let args = Args::try_parse_from([
            "queuectl",
            "enqueue",
            "--id",
            "job1",
            "--command",
            "echo hi",
            "--priority",
            "-5",
        ])
        .unwrap();
        match args.command {
            Commands::Enqueue(enqueue) => {
                assert_eq!(enqueue.id.as_deref(), Some("job1"));
                assert_eq!(enqueue.command.as_deref(), Some("echo hi"));
                assert_eq!(enqueue.priority, Some(-5));
                assert!(enqueue.payload.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_enqueue_id_requires_command() {
        assert!(Args::try_parse_from(["queuectl", "enqueue", "--id", "job1"]).is_err());
    }

    #[test]
    fn test_parse_worker_start() {
        let args = Args::try_parse_from([
            "queuectl",
            "--home",
            "/tmp/q",
            "worker",
            "start",
            "--count",
            "3",
            "--recovery",
            "unregistered",
        ])
        .unwrap();
        assert_eq!(args.home, Some(PathBuf::from("/tmp/q")));
        match args.command {
            Commands::Worker {
                command:
                    WorkerCommands::Start {
                        count,
                        no_reset_shutdown,
                        loop_args,
                        drain_timeout_secs,
                    },
            } => {
                assert_eq!(count, 3);
                assert!(!no_reset_shutdown);
                assert_eq!(loop_args.poll_interval_ms, 1000);
                assert_eq!(loop_args.recovery, RecoveryMode::Unregistered);
                assert!(drain_timeout_secs.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_list_state() {
        let args = Args::try_parse_from(["queuectl", "list", "--state", "dead"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::List {
                state: Some(JobState::Dead)
            }
        ));
        assert!(Args::try_parse_from(["queuectl", "list", "--state", "lost"]).is_err());
    }

    #[test]
    fn test_recovery_mode_round_trip() {
        for mode in [RecoveryMode::All, RecoveryMode::Unregistered] {
            assert_eq!(RecoveryMode::from_str(mode.as_arg(), false), Ok(mode));
        }
    }
}
