//! Command handlers.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use queuectl_core::{
    Client, NewJob, ShellExecutor, ShutdownCoordinator, Supervisor, Worker, WorkerConfig,
};
use queuectl_sqlite::SqliteBackend;

use crate::args::{
    Commands, ConfigCommands, DlqCommands, EnqueueArgs, LoopArgs, OutputFormat, RecoveryMode,
    WorkerCommands,
};
use crate::home;
use crate::render;
use crate::shutdown;

pub async fn dispatch(command: Commands, home: &Path, output: OutputFormat) -> Result<()> {
    let db_path = home::database_path(home);
    let backend = SqliteBackend::open(&db_path)
        .await
        .with_context(|| format!("failed to open queue database {}", db_path.display()))?;
    let client = Client::with_backend(backend.clone());

    match command {
        Commands::Enqueue(args) => handle_enqueue(&client, args, output).await,
        Commands::Worker { command } => match command {
            WorkerCommands::Start {
                count,
                no_reset_shutdown,
                loop_args,
                drain_timeout_secs,
            } => {
                handle_worker_start(
                    backend,
                    home,
                    count,
                    !no_reset_shutdown,
                    loop_args,
                    drain_timeout_secs,
                )
                .await
            }
            WorkerCommands::Stop => handle_worker_stop(&backend).await,
            WorkerCommands::Run { loop_args } => handle_worker_run(backend, loop_args).await,
        },
        Commands::Status => {
            let status = client.status().await?;
            match output {
                OutputFormat::Json => {
                    let json = serde_json::json!({
                        "counts": status.counts,
                        "workers": status.workers,
                    });
                    println!("{}", serde_json::to_string_pretty(&json)?);
                }
                OutputFormat::Table => println!("{}", render::status_tables(&status)),
            }
            Ok(())
        }
        Commands::List { state } => {
            let jobs = client.list_jobs(state).await?;
            match output {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                OutputFormat::Table => println!("{}", render::jobs_table(&jobs)),
            }
            Ok(())
        }
        Commands::Dlq { command } => match command {
            DlqCommands::List => {
                let jobs = client.dead_jobs().await?;
                match output {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                    OutputFormat::Table => println!("{}", render::dead_jobs_table(&jobs)),
                }
                Ok(())
            }
            DlqCommands::Retry { job_id } => {
                let job = client
                    .retry_dead(&job_id)
                    .await
                    .with_context(|| format!("could not re-queue job {}", job_id))?;
                match output {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                    OutputFormat::Table => println!("Re-queued dead job {}", job.id),
                }
                Ok(())
            }
        },
        Commands::Config { command } => match command {
            ConfigCommands::Get { key } => {
                println!("{}", client.get_config(&key).await?);
                Ok(())
            }
            ConfigCommands::Set { key, value } => {
                let (key, value) = client.set_config(&key, &value).await?;
                println!("set {}={}", key, value);
                Ok(())
            }
        },
    }
}

async fn handle_enqueue(
    client: &Client<SqliteBackend>,
    args: EnqueueArgs,
    output: OutputFormat,
) -> Result<()> {
    let mut new_job = match (args.payload, args.json_file, args.id, args.command) {
        (Some(payload), _, _, _) => NewJob::from_json(&payload).context("invalid job payload")?,
        (None, Some(path), _, _) => {
            let payload = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            NewJob::from_json(payload.trim())
                .with_context(|| format!("invalid job payload in {}", path.display()))?
        }
        (None, None, Some(id), Some(command)) => NewJob::new(id, command),
        _ => bail!("provide a JSON payload, --json-file, or both --id and --command"),
    };
    if let Some(max_retries) = args.max_retries {
        new_job = new_job.max_retries(max_retries);
    }
    if let Some(priority) = args.priority {
        new_job = new_job.priority(priority);
    }

    let job = client.enqueue(new_job).await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
        OutputFormat::Table => println!("Enqueued job {}", job.id),
    }
    Ok(())
}

async fn handle_worker_start(
    backend: SqliteBackend,
    home: &Path,
    count: usize,
    reset_shutdown: bool,
    loop_args: LoopArgs,
    drain_timeout_secs: Option<u64>,
) -> Result<()> {
    let mut builder = WorkerConfig::builder()
        .num_workers(count)
        .poll_interval(Duration::from_millis(loop_args.poll_interval_ms))
        .recovery_policy(loop_args.recovery.policy());
    if let Some(secs) = drain_timeout_secs {
        builder = builder.drain_timeout(Duration::from_secs(secs));
    }
    let config = builder.build()?;

    if reset_shutdown {
        ShutdownCoordinator::new(&backend).signal_resume().await?;
    }

    let exe = std::env::current_exe().context("failed to locate the queuectl executable")?;
    println!("Starting {} worker(s). Ctrl+C to stop.", count);

    let supervisor = Supervisor::new(backend, config);
    let statuses = supervisor
        .run(|_| worker_command(&exe, home, loop_args.poll_interval_ms))
        .await?;

    let failed = statuses.iter().filter(|status| !status.success()).count();
    if failed > 0 {
        tracing::warn!(failed, total = statuses.len(), "Some worker processes exited with an error");
    }
    Ok(())
}

/// Command line for one supervised worker. The supervisor has already
/// recovered orphans, so children leave registered workers' jobs alone.
fn worker_command(exe: &Path, home: &Path, poll_interval_ms: u64) -> Command {
    let mut command = Command::new(exe);
    command
        .arg("--home")
        .arg(home)
        .arg("worker")
        .arg("run")
        .arg("--poll-interval-ms")
        .arg(poll_interval_ms.to_string())
        .arg("--recovery")
        .arg(RecoveryMode::Unregistered.as_arg());
    command
}

async fn handle_worker_stop(backend: &SqliteBackend) -> Result<()> {
    ShutdownCoordinator::new(backend).signal_shutdown().await?;
    println!("Set shutdown=true. Workers will exit after finishing their current job.");
    Ok(())
}

async fn handle_worker_run(backend: SqliteBackend, loop_args: LoopArgs) -> Result<()> {
    let config = WorkerConfig::builder()
        .poll_interval(Duration::from_millis(loop_args.poll_interval_ms))
        .recovery_policy(loop_args.recovery.policy())
        .build()?;

    let worker = Worker::new(backend, ShellExecutor::new(), config)
        .with_stop_token(shutdown::install_stop_handler());
    worker.run().await?;
    Ok(())
}
