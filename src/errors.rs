//! Typed error hierarchy for the job runner.
//!
//! Two enums cover the two sides of the execution boundary:
//! - `JobError`: synchronous failures returned by the job service
//! - `ExecutionError`: faults inside an execution attempt, which are always
//!   folded into a `FAILED` job and never returned to the caller of `execute`

use thiserror::Error;

use crate::jobs::models::JobStatus;

/// Errors returned synchronously by the job service.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job {id} not found")]
    NotFound { id: i64 },

    #[error("Job {id} cannot be {action}. Current status: {status}")]
    InvalidState {
        id: i64,
        action: &'static str,
        status: JobStatus,
    },

    #[error("Job {id} conflict: {message}")]
    Conflict { id: i64, message: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Faults raised while an attempt is in flight.
///
/// `Display` is the text stored in the job's `error_log`; a non-zero exit
/// renders as exactly the stage's captured stderr.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("No configuration code found in job configuration")]
    MissingCode,

    #[error("Workspace error at {path}: {source}")]
    Workspace {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {stage} stage: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {stage} stage: {source}")]
    StageIo {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{stderr}")]
    NonZeroExit {
        stage: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("Stage {stage} timed out after {secs} seconds")]
    Timeout { stage: &'static str, secs: u64 },
}
