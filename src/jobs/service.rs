//! Job service: lifecycle operations over the store and the execution engine.
//!
//! Every status change of a job happens under that job's lock. `execute`
//! holds the lock only to flip `PENDING -> RUNNING` and register the attempt;
//! the attempt's finalizer takes it again to write the terminal status.
//! `cancel` raises the attempt's token while holding the lock, so whichever
//! side takes the lock first decides the terminal status and the other side
//! sees a terminal record.

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::db::{DbHandle, JobDb};
use super::engine::{ExecutionEngine, ExecutionOutcome};
use super::events::{EVENT_CHANNEL_CAPACITY, JobEvent, broadcast_event};
use super::models::*;
use crate::config::{AppConfig, ExecutionMode};
use crate::errors::JobError;

pub const INTERRUPTED_MESSAGE: &str = "Job interrupted: service restarted while job was running";

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub max_workers: usize,
    pub mode: ExecutionMode,
    /// Bound on how long `cancel`, `delete` and `shutdown` wait for a running
    /// attempt to reach a terminal status.
    pub settle_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            mode: ExecutionMode::Background,
            settle_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to an in-flight attempt.
struct ActiveAttempt {
    cancel: CancellationToken,
    settled: watch::Receiver<bool>,
}

type LockMap = DashMap<i64, Arc<tokio::sync::Mutex<()>>>;

/// A job's lock. The map entry is dropped with the last user, so the map
/// only holds jobs that someone is currently working on.
struct JobLock<'a> {
    locks: &'a LockMap,
    id: i64,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Deref for JobLock<'_> {
    type Target = tokio::sync::Mutex<()>;

    fn deref(&self) -> &Self::Target {
        &self.lock
    }
}

impl Drop for JobLock<'_> {
    fn drop(&mut self) {
        // Two references: the map's and ours.
        self.locks.remove_if(&self.id, |_, entry| {
            Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) <= 2
        });
    }
}

pub struct JobService {
    db: DbHandle,
    engine: Arc<ExecutionEngine>,
    workers: Semaphore,
    locks: LockMap,
    active: DashMap<i64, ActiveAttempt>,
    options: ServiceOptions,
    events: broadcast::Sender<String>,
}

impl JobService {
    pub fn new(db: DbHandle, engine: ExecutionEngine, options: ServiceOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            engine: Arc::new(engine),
            workers: Semaphore::new(options.max_workers.max(1)),
            locks: DashMap::new(),
            active: DashMap::new(),
            options,
            events,
        }
    }

    /// Open the store at `config.database.path` and wire the engine from `config`.
    pub fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let db_path = &config.database.path;
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let db = JobDb::new(db_path)
            .with_context(|| format!("Failed to open job database {}", db_path.display()))?;
        let engine = ExecutionEngine::new(config.engine_config(), config.workspace_manager());
        Ok(Self::new(DbHandle::new(db), engine, config.service_options()))
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Subscribe to serialized [`JobEvent`]s.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.events.subscribe()
    }

    /// Number of attempts currently registered (queued or running).
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn job_lock(&self, id: i64) -> JobLock<'_> {
        JobLock {
            locks: &self.locks,
            id,
            lock: self.locks.entry(id).or_default().clone(),
        }
    }

    /// Number of per-job locks currently held or awaited.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Fetch a job visible to `principal`. A job owned by someone else is
    /// reported as missing.
    pub async fn get(&self, principal: &Principal, id: i64) -> Result<Job, JobError> {
        let job = self
            .db
            .call(move |db| db.get_job(id))
            .await
            .map_err(JobError::Database)?;
        match job {
            Some(job) if principal.elevated || job.owner_id == principal.owner_id => Ok(job),
            _ => Err(JobError::NotFound { id }),
        }
    }

    pub async fn list(
        &self,
        principal: &Principal,
        query: &ListQuery,
    ) -> Result<Vec<Job>, JobError> {
        let owner = principal.scope().map(str::to_string);
        let status = query.status;
        let (offset, limit) = (query.offset(), query.limit());
        self.db
            .call(move |db| db.list_jobs(owner.as_deref(), status, offset, limit))
            .await
            .map_err(JobError::Database)
    }

    pub async fn logs(&self, principal: &Principal, id: i64) -> Result<JobLogs, JobError> {
        let job = self.get(principal, id).await?;
        Ok(JobLogs::from(&job))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    /// Validate and store a new `PENDING` job owned by `principal`.
    pub async fn create(
        &self,
        principal: &Principal,
        request: CreateJobRequest,
    ) -> Result<Job, JobError> {
        let name = request.name.trim().to_string();
        let name_len = name.chars().count();
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(JobError::Validation(format!(
                "Job name must be between 1 and {} characters",
                MAX_NAME_LEN
            )));
        }
        let command: JobCommand = request.command.parse().map_err(JobError::Validation)?;
        if config_code(&request.config).is_none() {
            return Err(JobError::Validation(
                "Configuration must include non-empty 'code'".to_string(),
            ));
        }

        let owner = principal.owner_id.clone();
        let config = request.config;
        let job = self
            .db
            .call(move |db| db.create_job(&owner, &name, command, &config))
            .await
            .map_err(JobError::Database)?;

        info!(job_id = job.id, owner = %job.owner_id, command = %job.command, "job created");
        broadcast_event(&self.events, &JobEvent::JobCreated { job: job.clone() });
        Ok(job)
    }

    /// Start an attempt for a `PENDING` job.
    ///
    /// In background mode this returns the `RUNNING` record as soon as the
    /// attempt is queued; in blocking mode it returns the terminal record.
    /// Execution faults never surface here: they end up in the job as `FAILED`.
    pub async fn execute(
        self: &Arc<Self>,
        principal: &Principal,
        id: i64,
    ) -> Result<Job, JobError> {
        let lock = self.job_lock(id);
        let guard = lock.lock().await;

        let job = self.get(principal, id).await?;
        if job.status != JobStatus::Pending {
            return Err(JobError::InvalidState {
                id,
                action: "executed",
                status: job.status,
            });
        }

        let running = self
            .db
            .call(move |db| db.mark_running(id))
            .await
            .map_err(JobError::Database)?
            .ok_or_else(|| JobError::Conflict {
                id,
                message: "job left PENDING while being started".to_string(),
            })?;

        let cancel = CancellationToken::new();
        let (settled_tx, settled_rx) = watch::channel(false);
        self.active.insert(
            id,
            ActiveAttempt {
                cancel: cancel.clone(),
                settled: settled_rx,
            },
        );
        drop(guard);

        info!(job_id = id, mode = %self.options.mode, "job started");
        broadcast_event(&self.events, &JobEvent::JobStarted { job: running.clone() });

        // The attempt always runs on its own task so that a caller going away
        // cannot strand the job in RUNNING.
        let this = Arc::clone(self);
        let attempt = running.clone();
        let handle = tokio::spawn(async move {
            let result = this.run_attempt(attempt, cancel).await;
            this.active.remove(&id);
            let _ = settled_tx.send(true);
            result
        });

        match self.options.mode {
            ExecutionMode::Background => Ok(running),
            ExecutionMode::Blocking => match handle.await {
                Ok(result) => result,
                Err(e) => Err(JobError::Other(anyhow::anyhow!(
                    "Job {} attempt task failed: {}",
                    id,
                    e
                ))),
            },
        }
    }

    /// Create a job and immediately execute it.
    pub async fn create_and_execute(
        self: &Arc<Self>,
        principal: &Principal,
        request: CreateJobRequest,
    ) -> Result<Job, JobError> {
        let job = self.create(principal, request).await?;
        self.execute(principal, job.id).await
    }

    async fn run_attempt(&self, job: Job, cancel: CancellationToken) -> Result<Job, JobError> {
        let id = job.id;

        let permit = tokio::select! {
            permit = self.workers.acquire() => permit.ok(),
            _ = cancel.cancelled() => None,
        };
        let outcome = match permit {
            Some(_permit) => {
                debug!(job_id = id, "worker slot acquired");
                self.engine.run(id, job.command, job.code(), &cancel).await
            }
            None => {
                info!(job_id = id, "cancelled while waiting for a worker");
                ExecutionOutcome::Cancelled {
                    output_log: String::new(),
                }
            }
        };

        self.finalize(id, outcome, &cancel).await
    }

    /// Write the attempt's terminal status. A cancellation raised before the
    /// lock was taken wins over whatever the engine reported.
    async fn finalize(
        &self,
        id: i64,
        outcome: ExecutionOutcome,
        cancel: &CancellationToken,
    ) -> Result<Job, JobError> {
        let lock = self.job_lock(id);
        let _guard = lock.lock().await;

        let (status, error_log) = if cancel.is_cancelled() {
            (JobStatus::Cancelled, String::new())
        } else {
            (outcome.status(), outcome.error_log().to_string())
        };
        let output_log = outcome.output_log().to_string();

        let finished = self
            .db
            .call(move |db| db.finish_job(id, status, &output_log, &error_log))
            .await
            .map_err(|e| {
                error!(job_id = id, error = %e, "failed to record job outcome");
                JobError::Database(e)
            })?;

        let job = match finished {
            Some(job) => job,
            None => {
                warn!(job_id = id, "job was no longer running when its attempt finished");
                self.db
                    .call(move |db| db.get_job(id))
                    .await
                    .map_err(JobError::Database)?
                    .ok_or(JobError::NotFound { id })?
            }
        };

        info!(job_id = id, status = %job.status, "job finished");
        if let Some(event) = JobEvent::terminal(job.clone()) {
            broadcast_event(&self.events, &event);
        }
        Ok(job)
    }

    /// Cancel a `PENDING` or `RUNNING` job.
    ///
    /// A running job is signalled and this waits, bounded by the settle
    /// timeout, until the attempt has torn down its workspace.
    pub async fn cancel(&self, principal: &Principal, id: i64) -> Result<Job, JobError> {
        let lock = self.job_lock(id);
        let guard = lock.lock().await;

        let job = self.get(principal, id).await?;
        if !job.status.is_cancellable() {
            return Err(JobError::InvalidState {
                id,
                action: "cancelled",
                status: job.status,
            });
        }
        match job.status {
            JobStatus::Pending => {
                let cancelled = self
                    .db
                    .call(move |db| db.cancel_pending(id))
                    .await
                    .map_err(JobError::Database)?
                    .ok_or_else(|| JobError::Conflict {
                        id,
                        message: "job left PENDING while being cancelled".to_string(),
                    })?;
                info!(job_id = id, "pending job cancelled");
                broadcast_event(&self.events, &JobEvent::JobCancelled { job: cancelled.clone() });
                Ok(cancelled)
            }
            _ => {
                let attempt = self
                    .active
                    .get(&id)
                    .map(|a| (a.cancel.clone(), a.settled.clone()));
                match attempt {
                    Some((token, settled)) => {
                        info!(job_id = id, "cancellation requested");
                        token.cancel();
                        drop(guard);
                        self.wait_settled(id, settled).await?;
                        self.get(principal, id).await
                    }
                    None => {
                        // No attempt in this process owns the job.
                        let cancelled = self.close_orphan(id, &job).await?;
                        broadcast_event(
                            &self.events,
                            &JobEvent::JobCancelled { job: cancelled.clone() },
                        );
                        Ok(cancelled)
                    }
                }
            }
        }
    }

    /// Delete a job. A running job is cancelled first and must settle within
    /// the settle timeout, otherwise `Conflict` is returned and the record kept.
    pub async fn delete(&self, principal: &Principal, id: i64) -> Result<(), JobError> {
        let lock = self.job_lock(id);
        let mut guard = lock.lock().await;

        let job = self.get(principal, id).await?;
        if job.status == JobStatus::Running {
            let attempt = self
                .active
                .get(&id)
                .map(|a| (a.cancel.clone(), a.settled.clone()));
            match attempt {
                Some((token, settled)) => {
                    info!(job_id = id, "cancelling running job before delete");
                    token.cancel();
                    drop(guard);
                    self.wait_settled(id, settled).await?;
                    guard = lock.lock().await;
                }
                None => {
                    self.close_orphan(id, &job).await?;
                }
            }
        }

        let deleted = self
            .db
            .call(move |db| db.delete_job(id))
            .await
            .map_err(JobError::Database)?;
        drop(guard);
        if !deleted {
            return Err(JobError::NotFound { id });
        }

        info!(job_id = id, "job deleted");
        broadcast_event(&self.events, &JobEvent::JobDeleted { job_id: id });
        Ok(())
    }

    /// Close a `RUNNING` record with no attempt behind it as `CANCELLED` and
    /// remove any workspace it left behind.
    async fn close_orphan(&self, id: i64, job: &Job) -> Result<Job, JobError> {
        if let Err(e) = self.engine.workspaces().remove_stale(id) {
            warn!(job_id = id, error = %e, "failed to remove orphaned workspace");
        }
        let output_log = job.output_log.clone();
        let finished = self
            .db
            .call(move |db| db.finish_job(id, JobStatus::Cancelled, &output_log, ""))
            .await
            .map_err(JobError::Database)?;
        warn!(job_id = id, "closed running job with no active attempt");
        finished.ok_or(JobError::NotFound { id })
    }

    async fn wait_settled(
        &self,
        id: i64,
        mut settled: watch::Receiver<bool>,
    ) -> Result<(), JobError> {
        let timeout = self.options.settle_timeout;
        match tokio::time::timeout(timeout, settled.wait_for(|done| *done)).await {
            // A dropped sender means the attempt task is gone either way.
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(job_id = id, timeout_secs = timeout.as_secs(), "job did not settle");
                Err(JobError::Conflict {
                    id,
                    message: format!(
                        "job did not stop within {} seconds after cancellation",
                        timeout.as_secs()
                    ),
                })
            }
        }
    }

    // ── Start-up and shutdown ─────────────────────────────────────────

    /// Fail jobs left `RUNNING` by a previous process and remove their
    /// workspaces. Must run before any attempt starts.
    pub async fn recover_interrupted(&self) -> Result<Vec<Job>, JobError> {
        let failed = self
            .db
            .call(|db| db.fail_interrupted_jobs(INTERRUPTED_MESSAGE))
            .await
            .map_err(JobError::Database)?;

        for job in &failed {
            match self.engine.workspaces().remove_stale(job.id) {
                Ok(true) => debug!(job_id = job.id, "removed stale workspace"),
                Ok(false) => {}
                Err(e) => warn!(job_id = job.id, error = %e, "failed to remove stale workspace"),
            }
            broadcast_event(&self.events, &JobEvent::JobFailed { job: job.clone() });
        }
        if !failed.is_empty() {
            warn!(count = failed.len(), "marked interrupted jobs as failed");
        }
        Ok(failed)
    }

    /// Cancel every in-flight attempt and wait, bounded by the settle
    /// timeout, for them to finish.
    pub async fn shutdown(&self) {
        let attempts: Vec<(i64, watch::Receiver<bool>)> = self
            .active
            .iter()
            .map(|entry| {
                entry.cancel.cancel();
                (*entry.key(), entry.settled.clone())
            })
            .collect();
        if attempts.is_empty() {
            return;
        }

        info!(count = attempts.len(), "cancelling in-flight jobs");
        let waits = attempts.into_iter().map(|(id, mut settled)| async move {
            if settled.wait_for(|done| *done).await.is_err() {
                debug!(job_id = id, "attempt ended without signalling");
            }
        });
        if tokio::time::timeout(
            self.options.settle_timeout,
            futures_util::future::join_all(waits),
        )
        .await
        .is_err()
        {
            warn!("some jobs did not settle before shutdown");
        }
    }
}
