//! Spawning and draining worker processes.

use chrono::Utc;
use std::future::Future;
use std::process::ExitStatus;
use tokio::process::{Child, Command};

use crate::backend::Backend;
use crate::config::WorkerConfig;
use crate::error::{QueueError, Result};
use crate::recovery::Recovery;
use crate::shutdown::ShutdownCoordinator;
use crate::worker::retry_transient;

/// Parent of a set of worker processes.
///
/// Each worker runs in its own process and process group, so an interrupt
/// from the terminal reaches only the supervisor. The supervisor then sets
/// the store's shutdown flag and waits for every worker to finish its
/// current job and exit.
///
/// Orphaned jobs are recovered once with the configured policy before any
/// worker is spawned. Workers started by a supervisor should recover with
/// [`RecoveryPolicy::UnregisteredOnly`](crate::RecoveryPolicy) so that a
/// late starter never reclaims a sibling's running job.
pub struct Supervisor<B: Backend> {
    backend: B,
    config: WorkerConfig,
}

impl<B: Backend> Supervisor<B> {
    pub fn new(backend: B, config: WorkerConfig) -> Self {
        Self { backend, config }
    }

    /// Spawn `num_workers` processes built by `make_command` and wait for
    /// them, draining on Ctrl+C.
    pub async fn run<F>(&self, make_command: F) -> Result<Vec<ExitStatus>>
    where
        F: Fn(usize) -> Command,
    {
        self.run_until(make_command, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Spawn the workers and wait for them, draining once `shutdown`
    /// resolves.
    ///
    /// Returns when every worker has exited, either on its own (for example
    /// after a shutdown signalled from another process) or after the drain.
    pub async fn run_until<F, S>(&self, make_command: F, shutdown: S) -> Result<Vec<ExitStatus>>
    where
        F: Fn(usize) -> Command,
        S: Future<Output = ()>,
    {
        let recovery = Recovery::new(&self.backend, self.config.recovery_policy);
        let recovered =
            retry_transient("supervisor", "recover orphaned jobs", || recovery.run(Utc::now()))
                .await?;
        if !recovered.is_empty() {
            tracing::info!(count = recovered.len(), "Recovered orphaned jobs before spawning workers");
        }

        let mut children = Vec::with_capacity(self.config.num_workers);
        for index in 0..self.config.num_workers {
            match spawn_worker(make_command(index)) {
                Ok(child) => {
                    tracing::info!(index, pid = ?child.id(), "Spawned worker process");
                    children.push(child);
                }
                Err(e) => {
                    tracing::error!(index, error = %e, "Failed to spawn worker process");
                    if !children.is_empty() {
                        ShutdownCoordinator::new(&self.backend).signal_shutdown().await?;
                        wait_all(&mut children).await?;
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(workers = children.len(), "Worker processes started");

        let finished = {
            let waiting = wait_all(&mut children);
            tokio::pin!(waiting);
            tokio::select! {
                result = &mut waiting => Some(result),
                _ = shutdown => None,
            }
        };
        if let Some(result) = finished {
            tracing::info!("All worker processes exited");
            return result;
        }

        tracing::info!("Shutdown requested, draining workers...");
        ShutdownCoordinator::new(&self.backend).signal_shutdown().await?;

        let statuses = match self.config.drain_timeout {
            None => wait_all(&mut children).await?,
            Some(timeout) => match tokio::time::timeout(timeout, wait_all(&mut children)).await {
                Ok(result) => result?,
                Err(_) => {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs(),
                        "Drain timeout reached, killing remaining workers"
                    );
                    for child in children.iter_mut() {
                        if let Ok(None) = child.try_wait() {
                            if let Err(e) = child.start_kill() {
                                tracing::error!(pid = ?child.id(), error = %e, "Failed to kill worker");
                            }
                        }
                    }
                    wait_all(&mut children).await?
                }
            },
        };

        tracing::info!("Shutdown complete");
        Ok(statuses)
    }
}

fn spawn_worker(mut command: Command) -> Result<Child> {
    #[cfg(unix)]
    command.process_group(0);
    command
        .spawn()
        .map_err(|e| QueueError::Worker(format!("failed to spawn worker process: {}", e)))
}

async fn wait_all(children: &mut [Child]) -> Result<Vec<ExitStatus>> {
    let mut statuses = Vec::with_capacity(children.len());
    for child in children.iter_mut() {
        let pid = child.id();
        let status = child
            .wait()
            .await
            .map_err(|e| QueueError::Worker(format!("failed to wait for worker: {}", e)))?;
        tracing::debug!(pid = ?pid, status = %status, "Worker process exited");
        statuses.push(status);
    }
    Ok(statuses)
}
