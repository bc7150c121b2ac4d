//! One-shot job execution: `iac-runner run`.

use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use iac_runner::config::{AppConfig, ExecutionMode};
use iac_runner::jobs::models::{CreateJobRequest, JobStatus, Principal};
use iac_runner::jobs::service::JobService;

pub async fn cmd_run(
    mut config: AppConfig,
    name: String,
    command: String,
    file: PathBuf,
    owner: String,
    db_path: Option<PathBuf>,
) -> Result<()> {
    if let Some(db_path) = db_path {
        config.database.path = db_path;
    }
    config.executor.mode = ExecutionMode::Blocking;

    let code = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read configuration file {}", file.display()))?;

    let service = Arc::new(JobService::from_config(&config)?);
    let principal = Principal::user(owner);
    let job = service
        .create(
            &principal,
            CreateJobRequest {
                name,
                command,
                config: serde_json::json!({
                    "code": code,
                    "source_file": file.display().to_string(),
                }),
            },
        )
        .await?;
    eprintln!("Created job {} ({} {})", job.id, job.name, job.command);

    let execution = service.execute(&principal, job.id);
    tokio::pin!(execution);
    let finished = tokio::select! {
        result = &mut execution => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = job.id, "interrupted, cancelling job");
            service.shutdown().await;
            service.get(&principal, job.id).await?
        }
    };

    print!("{}", finished.output_log);
    if !finished.error_log.is_empty() {
        eprintln!("{}", finished.error_log.trim_end());
    }
    eprintln!("Job {} finished: {}", finished.id, finished.status);

    if finished.status != JobStatus::Completed {
        bail!("Job {} finished with status {}", finished.id, finished.status);
    }
    Ok(())
}
