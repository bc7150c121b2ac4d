use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;

/// Async-safe handle to the job store.
///
/// Wraps `JobDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<JobDb>>,
}

impl DbHandle {
    pub fn new(db: JobDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&JobDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

const JOB_COLUMNS: &str = "id, owner_id, name, command, config, status, output_log, error_log, started_at, completed_at, created_at, updated_at";

pub struct JobDb {
    conn: Connection,
}

impl JobDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to configure SQLite busy timeout")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    command TEXT NOT NULL,
                    config TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    output_log TEXT NOT NULL DEFAULT '',
                    error_log TEXT NOT NULL DEFAULT '',
                    started_at TEXT,
                    completed_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Job CRUD ──────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        owner_id: &str,
        name: &str,
        command: JobCommand,
        config: &serde_json::Value,
    ) -> Result<Job> {
        let now = now_timestamp();
        let config_json =
            serde_json::to_string(config).context("Failed to serialize job config")?;
        self.conn
            .execute(
                "INSERT INTO jobs (owner_id, name, command, config, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)",
                params![owner_id, name, command.as_str(), config_json, now],
            )
            .context("Failed to insert job")?;
        let id = self.conn.last_insert_rowid();
        self.get_job(id)?.context("Job not found after insert")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], JobRow::from_row)
            .optional()
            .context("Failed to query job")?;
        row.map(JobRow::into_job).transpose()
    }

    /// List jobs newest first. `owner_id = None` lists every owner.
    pub fn list_jobs(
        &self,
        owner_id: Option<&str>,
        status: Option<JobStatus>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {} FROM jobs
             WHERE (?1 IS NULL OR owner_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4",
            JOB_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare list_jobs")?;
        let rows = stmt
            .query_map(
                params![owner_id, status.map(|s| s.as_str()), limit, offset],
                JobRow::from_row,
            )
            .context("Failed to query jobs")?;
        let mut jobs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read job row")?;
            jobs.push(r.into_job()?);
        }
        Ok(jobs)
    }

    /// `PENDING -> RUNNING`. Clears both logs and stamps `started_at`.
    /// Returns `None` if the job is missing or no longer pending.
    pub fn mark_running(&self, id: i64) -> Result<Option<Job>> {
        let now = now_timestamp();
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'running', output_log = '', error_log = '',
                     started_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )
            .context("Failed to mark job running")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_job(id)
    }

    /// `PENDING -> CANCELLED`. Both `started_at` and `completed_at` are set
    /// so that only `PENDING` rows carry a null `started_at`.
    pub fn cancel_pending(&self, id: i64) -> Result<Option<Job>> {
        let now = now_timestamp();
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET status = 'cancelled', started_at = ?1, completed_at = ?1, updated_at = ?1
                 WHERE id = ?2 AND status = 'pending'",
                params![now, id],
            )
            .context("Failed to cancel pending job")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_job(id)
    }

    /// `RUNNING -> terminal`. Returns `None` if the row was not running, in
    /// which case nothing is written.
    pub fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        output_log: &str,
        error_log: &str,
    ) -> Result<Option<Job>> {
        anyhow::ensure!(
            status.is_terminal(),
            "finish_job requires a terminal status, got {}",
            status
        );
        let now = now_timestamp();
        let count = self
            .conn
            .execute(
                "UPDATE jobs SET status = ?1, output_log = ?2, error_log = ?3,
                     completed_at = ?4, updated_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![status.as_str(), output_log, error_log, now, id],
            )
            .context("Failed to finish job")?;
        if count == 0 {
            return Ok(None);
        }
        self.get_job(id)
    }

    /// Fail every job still marked `RUNNING`. Used at start-up, when no
    /// attempt can be in flight.
    pub fn fail_interrupted_jobs(&self, message: &str) -> Result<Vec<Job>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM jobs WHERE status = 'running' ORDER BY id")
            .context("Failed to prepare interrupted job query")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))
            .context("Failed to query interrupted jobs")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read interrupted job ids")?;

        let mut failed = Vec::new();
        for id in ids {
            if let Some(job) = self.finish_job(id, JobStatus::Failed, "", message)? {
                failed.push(job);
            }
        }
        Ok(failed)
    }

    pub fn delete_job(&self, id: i64) -> Result<bool> {
        let count = self
            .conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .context("Failed to delete job")?;
        Ok(count > 0)
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

/// Intermediate row struct for jobs.
struct JobRow {
    id: i64,
    owner_id: String,
    name: String,
    command: String,
    config: String,
    status: String,
    output_log: String,
    error_log: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            command: row.get(3)?,
            config: row.get(4)?,
            status: row.get(5)?,
            output_log: row.get(6)?,
            error_log: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<Job> {
        let command = JobCommand::from_str(&self.command)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job command")?;
        let status = JobStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse job status")?;
        let config: serde_json::Value =
            serde_json::from_str(&self.config).context("Failed to parse job config JSON")?;

        Ok(Job {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            command,
            config,
            status,
            output_log: self.output_log,
            error_log: self.error_log,
            started_at: self.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}
