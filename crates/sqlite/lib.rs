//! SQLite backend for the queuectl job queue.
//!
//! One database file is shared by every worker process on the host. Each
//! job mutation runs in a `BEGIN IMMEDIATE` transaction, which takes the
//! database write lock up front, so the select-then-update of a claim can
//! never interleave with another writer.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use queuectl_core::{Client, NewJob};
//! use queuectl_sqlite::SqliteBackend;
//!
//! #[tokio::main]
//! async fn main() -> queuectl_core::Result<()> {
//!     let backend = SqliteBackend::open("/tmp/queue.db").await?;
//!     let client = Client::new(backend);
//!     client.enqueue(NewJob::new("job1", "echo hello")).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions,
};
use sqlx::Transaction;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use queuectl_core::lifecycle;
use queuectl_core::{
    keys, Backend, Job, JobState, QueueError, RecoveryPolicy, Result, StateCounts, WorkerRecord,
};

/// How long a connection waits for another process's write lock before
/// reporting a conflict.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_JOB: &str = "SELECT id, command, state, attempts, max_retries, priority, \
     created_at, updated_at, next_run_at, last_error, worker_id FROM jobs";

/// SQLite backend for job queue storage.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| QueueError::Config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(BUSY_TIMEOUT);
        Self::connect(options).await
    }

    /// Open (or create) the database file at `path`, creating its parent
    /// directory if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_busy_timeout(path, BUSY_TIMEOUT).await
    }

    /// Like [`open`](Self::open), but waits at most `busy_timeout` for
    /// another connection's write lock before reporting a conflict.
    pub async fn open_with_busy_timeout(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                QueueError::Backend(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        Self::connect(options).await
    }

    /// Create an in-memory SQLite backend (useful for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // one writer per process; other processes contend on the file lock
            .idle_timeout(Option::<Duration>::None)
            .max_lifetime(Option::<Duration>::None)
            .connect_with(options)
            .await
            .map_err(|e| QueueError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        let backend = Self { pool };
        backend.init_tables().await?;
        Ok(backend)
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                next_run_at INTEGER NOT NULL,
                last_error TEXT,
                worker_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("create jobs table", e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_next_run ON jobs (state, next_run_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("create jobs index", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("create config table", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workers (
                id TEXT PRIMARY KEY,
                pid INTEGER NOT NULL,
                host TEXT NOT NULL,
                started_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("create workers table", e))?;

        Ok(())
    }

    /// Start a transaction that holds the database write lock from its
    /// first statement. Dropping it without `commit` rolls back.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| store_error("begin transaction", e))
    }

    // ========== Transaction bodies ==========

    async fn insert_in_tx(conn: &mut SqliteConnection, job: &Job) -> Result<()> {
        let existing: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM jobs WHERE id = ?")
            .bind(&job.id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| store_error("check job id", e))?;
        if existing.is_some() {
            return Err(QueueError::DuplicateId(job.id.clone()));
        }

        sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, priority, \
             created_at, updated_at, next_run_at, last_error, worker_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(job.priority)
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .bind(to_millis(job.next_run_at))
        .bind(job.last_error.as_deref())
        .bind(job.worker_id.as_deref())
        .execute(&mut *conn)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                QueueError::DuplicateId(job.id.clone())
            }
            _ => store_error("insert job", e),
        })?;

        Ok(())
    }

    async fn claim_in_tx(
        conn: &mut SqliteConnection,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let now_ms = to_millis(now);

        let candidate: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM jobs \
             WHERE state IN ('pending', 'failed') AND next_run_at <= ? \
             ORDER BY priority DESC, next_run_at ASC, created_at ASC \
             LIMIT 1",
        )
        .bind(now_ms)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| store_error("select next job", e))?;

        let Some((job_id,)) = candidate else {
            return Ok(None);
        };

        let updated = sqlx::query(
            "UPDATE jobs SET state = 'processing', worker_id = ?, updated_at = MAX(updated_at, ?) \
             WHERE id = ? AND state IN ('pending', 'failed')",
        )
        .bind(worker_id)
        .bind(now_ms)
        .bind(&job_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| store_error("claim job", e))?;

        if updated.rows_affected() != 1 {
            return Ok(None);
        }

        fetch_job(conn, &job_id).await
    }

    async fn held_job(conn: &mut SqliteConnection, job_id: &str, worker_id: &str) -> Result<Job> {
        let job = fetch_job(conn, job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if !job.is_held_by(worker_id) {
            return Err(QueueError::ClaimLost {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            });
        }
        Ok(job)
    }

    async fn complete_in_tx(
        conn: &mut SqliteConnection,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = Self::held_job(conn, job_id, worker_id).await?;
        let updated_at = lifecycle::plan_completion(&job, now)?;

        sqlx::query("UPDATE jobs SET state = ?, updated_at = ? WHERE id = ?")
            .bind(JobState::Completed.as_str())
            .bind(to_millis(updated_at))
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| store_error("complete job", e))?;

        Ok(Job {
            state: JobState::Completed,
            updated_at,
            ..job
        })
    }

    async fn fail_in_tx(
        conn: &mut SqliteConnection,
        job_id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = Self::held_job(conn, job_id, worker_id).await?;

        let backoff_base = match config_in_tx(conn, keys::BACKOFF_BASE).await? {
            Some(raw) => lifecycle::parse_backoff_base(&raw),
            None => queuectl_core::DEFAULT_BACKOFF_BASE,
        };
        let plan = lifecycle::plan_failure(&job, backoff_base, error, now)?;

        sqlx::query(
            "UPDATE jobs SET state = ?, attempts = ?, next_run_at = ?, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(plan.state.as_str())
        .bind(i64::from(plan.attempts))
        .bind(to_millis(plan.next_run_at))
        .bind(&plan.last_error)
        .bind(to_millis(plan.updated_at))
        .bind(job_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| store_error("record job failure", e))?;

        Ok(Job {
            state: plan.state,
            attempts: plan.attempts,
            next_run_at: plan.next_run_at,
            last_error: Some(plan.last_error),
            updated_at: plan.updated_at,
            ..job
        })
    }

    async fn recover_in_tx(
        conn: &mut SqliteConnection,
        policy: RecoveryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let select = match policy {
            RecoveryPolicy::AllProcessing => {
                "SELECT id FROM jobs WHERE state = 'processing' ORDER BY created_at"
            }
            RecoveryPolicy::UnregisteredOnly => {
                "SELECT id FROM jobs WHERE state = 'processing' \
                 AND (worker_id IS NULL OR worker_id NOT IN (SELECT id FROM workers)) \
                 ORDER BY created_at"
            }
        };

        let rows: Vec<(String,)> = sqlx::query_as(select)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| store_error("find orphaned jobs", e))?;

        let now_ms = to_millis(now);
        for (job_id,) in &rows {
            sqlx::query(
                "UPDATE jobs SET state = 'failed', next_run_at = ?, updated_at = MAX(updated_at, ?) \
                 WHERE id = ? AND state = 'processing'",
            )
            .bind(now_ms)
            .bind(now_ms)
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| store_error("recover job", e))?;
        }

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn retry_dead_in_tx(
        conn: &mut SqliteConnection,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = fetch_job(conn, job_id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        let updated_at = lifecycle::plan_dead_retry(&job, now)?;

        sqlx::query("UPDATE jobs SET state = ?, next_run_at = ?, updated_at = ? WHERE id = ?")
            .bind(JobState::Pending.as_str())
            .bind(to_millis(now))
            .bind(to_millis(updated_at))
            .bind(job_id)
            .execute(&mut *conn)
            .await
            .map_err(|e| store_error("retry dead job", e))?;

        Ok(Job {
            state: JobState::Pending,
            next_run_at: now,
            updated_at,
            ..job
        })
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        Self::insert_in_tx(&mut tx, job).await?;
        commit(tx).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_JOB))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("get job", e))?;
        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = match state {
            Some(state) => sqlx::query_as(&format!(
                "{} WHERE state = ? ORDER BY created_at, id",
                SELECT_JOB
            ))
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await,
            None => sqlx::query_as(&format!("{} ORDER BY created_at, id", SELECT_JOB))
                .fetch_all(&self.pool)
                .await,
        }
        .map_err(|e| store_error("list jobs", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn count_by_state(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| store_error("count jobs", e))?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            counts.add(state.parse()?, count.max(0) as usize);
        }
        Ok(counts)
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut tx = self.begin_immediate().await?;
        let value = Self::claim_in_tx(&mut tx, worker_id, now).await?;
        commit(tx).await?;
        Ok(value)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut tx = self.begin_immediate().await?;
        let value = Self::complete_in_tx(&mut tx, job_id, worker_id, now).await?;
        commit(tx).await?;
        Ok(value)
    }

    async fn fail_job(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut tx = self.begin_immediate().await?;
        let value = Self::fail_in_tx(&mut tx, job_id, worker_id, error, now).await?;
        commit(tx).await?;
        Ok(value)
    }

    async fn recover_orphaned(
        &self,
        policy: RecoveryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let mut tx = self.begin_immediate().await?;
        let value = Self::recover_in_tx(&mut tx, policy, now).await?;
        commit(tx).await?;
        Ok(value)
    }

    async fn retry_dead(&self, job_id: &str, now: DateTime<Utc>) -> Result<Job> {
        let mut tx = self.begin_immediate().await?;
        let value = Self::retry_dead_in_tx(&mut tx, job_id, now).await?;
        commit(tx).await?;
        Ok(value)
    }

    async fn config_value(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| store_error("read config", e))?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("write config", e))?;
        Ok(())
    }

    async fn register_worker(&self, record: &WorkerRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, pid, host, started_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET pid = excluded.pid, host = excluded.host, \
             started_at = excluded.started_at",
        )
        .bind(&record.id)
        .bind(i64::from(record.pid))
        .bind(&record.host)
        .bind(to_millis(record.started_at))
        .execute(&self.pool)
        .await
        .map_err(|e| store_error("register worker", e))?;
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(worker_id)
            .execute(&self.pool)
            .await
            .map_err(|e| store_error("deregister worker", e))?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>> {
        let rows: Vec<(String, i64, String, i64)> =
            sqlx::query_as("SELECT id, pid, host, started_at FROM workers ORDER BY started_at, id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| store_error("list workers", e))?;

        rows.into_iter()
            .map(|(id, pid, host, started_at)| {
                Ok(WorkerRecord {
                    id,
                    pid: u32::try_from(pid).map_err(|_| corrupt("pid", pid))?,
                    host,
                    started_at: from_millis(started_at)?,
                })
            })
            .collect()
    }
}

async fn commit(tx: Transaction<'static, Sqlite>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|e| store_error("commit transaction", e))
}

async fn fetch_job(conn: &mut SqliteConnection, job_id: &str) -> Result<Option<Job>> {
    let row: Option<JobRow> = sqlx::query_as(&format!("{} WHERE id = ?", SELECT_JOB))
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| store_error("read job", e))?;
    row.map(Job::try_from).transpose()
}

async fn config_in_tx(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM config WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| store_error("read config", e))?;
    Ok(row.map(|(value,)| value))
}

/// Map a driver error, separating lock contention from real failures.
fn store_error(context: &str, err: sqlx::Error) -> QueueError {
    let contended = match &err {
        sqlx::Error::Database(db) => is_busy_code(db.code().as_deref()),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    };
    if contended {
        QueueError::Conflict(format!("{}: {}", context, err))
    } else {
        QueueError::Backend(format!("Failed to {}: {}", context, err))
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| corrupt("timestamp", ms))
}

fn corrupt(field: &str, value: i64) -> QueueError {
    QueueError::Backend(format!("Stored {} out of range: {}", field, value))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    priority: i64,
    created_at: i64,
    updated_at: i64,
    next_run_at: i64,
    last_error: Option<String>,
    worker_id: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            state: row.state.parse()?,
            attempts: u32::try_from(row.attempts).map_err(|_| corrupt("attempts", row.attempts))?,
            max_retries: u32::try_from(row.max_retries)
                .map_err(|_| corrupt("max_retries", row.max_retries))?,
            priority: row.priority,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
            next_run_at: from_millis(row.next_run_at)?,
            id: row.id,
            command: row.command,
            last_error: row.last_error,
            worker_id: row.worker_id,
        })
    }
}


// ========== Integration Tests ==========
