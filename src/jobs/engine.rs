//! Execution engine: runs the external CLI against a job's workspace.
//!
//! An attempt is a fixed two-stage pipeline, `init` followed by the job's
//! command, each a subprocess with its own timeout. The engine never returns
//! an error: every fault becomes part of the [`ExecutionOutcome`].
//!
//! Each stage runs in its own process group so that cancellation and timeouts
//! reach every process the CLI spawned (provider plugins included), not just
//! the direct child.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::models::{JobCommand, JobStatus};
use super::workspace::{Workspace, WorkspaceManager};
use crate::errors::ExecutionError;

/// Cap on captured bytes per stream; the tail is kept.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How long to wait for output pipes to close after a stage ends.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cli_path: PathBuf,
    pub stage_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("terraform"),
            stage_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_secs(2),
        }
    }
}

/// One subprocess invocation of the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Init,
    Plan,
    Apply,
    Destroy,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }

    /// Section marker written into `output_log` ahead of the stage's stdout.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Plan => "Plan",
            Self::Apply => "Apply",
            Self::Destroy => "Destroy",
        }
    }

    /// CLI arguments. Mutating stages auto-approve: jobs have no interactive
    /// approval step, so the API boundary decides who may submit them.
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Self::Init => &["init", "-input=false", "-no-color"],
            Self::Plan => &["plan", "-input=false", "-no-color"],
            Self::Apply => &["apply", "-auto-approve", "-input=false", "-no-color"],
            Self::Destroy => &["destroy", "-auto-approve", "-input=false", "-no-color"],
        }
    }

    /// The pipeline for a job command: always `init` first.
    pub fn pipeline(command: JobCommand) -> [Stage; 2] {
        let main = match command {
            JobCommand::Plan => Self::Plan,
            JobCommand::Apply => Self::Apply,
            JobCommand::Destroy => Self::Destroy,
        };
        [Self::Init, main]
    }
}

/// Terminal result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed { output_log: String },
    Failed { output_log: String, error_log: String },
    Cancelled { output_log: String },
}

impl ExecutionOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Completed { .. } => JobStatus::Completed,
            Self::Failed { .. } => JobStatus::Failed,
            Self::Cancelled { .. } => JobStatus::Cancelled,
        }
    }

    pub fn output_log(&self) -> &str {
        match self {
            Self::Completed { output_log }
            | Self::Failed { output_log, .. }
            | Self::Cancelled { output_log } => output_log,
        }
    }

    pub fn error_log(&self) -> &str {
        match self {
            Self::Failed { error_log, .. } => error_log,
            _ => "",
        }
    }

    fn failed(output_log: String, error: ExecutionError) -> Self {
        Self::Failed {
            output_log,
            error_log: error.to_string(),
        }
    }
}

struct StageOutput {
    stdout: String,
}

enum StageFailure {
    Cancelled { stdout: String },
    Error { stdout: String, error: ExecutionError },
}

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

pub struct ExecutionEngine {
    config: EngineConfig,
    workspaces: WorkspaceManager,
}

impl ExecutionEngine {
    pub fn new(config: EngineConfig, workspaces: WorkspaceManager) -> Self {
        Self { config, workspaces }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Run one attempt for a job.
    ///
    /// `cancel` is checked before the workspace is created, before each stage,
    /// and while a stage runs. The workspace is gone by the time this returns.
    pub async fn run(
        &self,
        job_id: i64,
        command: JobCommand,
        code: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let Some(code) = code.filter(|c| !c.trim().is_empty()) else {
            warn!(job_id, "job has no configuration code");
            return ExecutionOutcome::failed(String::new(), ExecutionError::MissingCode);
        };

        if cancel.is_cancelled() {
            info!(job_id, "cancelled before workspace creation");
            return ExecutionOutcome::Cancelled {
                output_log: String::new(),
            };
        }

        let workspace = match self.workspaces.acquire(job_id) {
            Ok(ws) => ws,
            Err(e) => {
                warn!(job_id, error = %e, "failed to create workspace");
                return ExecutionOutcome::failed(String::new(), e);
            }
        };

        let outcome = self
            .run_in_workspace(job_id, command, code, &workspace, cancel)
            .await;

        workspace.teardown();

        info!(job_id, status = %outcome.status(), "attempt finished");
        outcome
    }

    async fn run_in_workspace(
        &self,
        job_id: i64,
        command: JobCommand,
        code: &str,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let mut output_log = String::new();

        if let Err(e) = workspace.write_config(code) {
            return ExecutionOutcome::failed(output_log, e);
        }

        for stage in Stage::pipeline(command) {
            if cancel.is_cancelled() {
                info!(job_id, stage = stage.as_str(), "cancelled before stage");
                return ExecutionOutcome::Cancelled { output_log };
            }

            info!(job_id, stage = stage.as_str(), "running stage");
            match self.run_stage(stage, workspace.path(), cancel).await {
                Ok(output) => push_section(&mut output_log, stage, &output.stdout),
                Err(StageFailure::Cancelled { stdout }) => {
                    push_section(&mut output_log, stage, &stdout);
                    info!(job_id, stage = stage.as_str(), "stage cancelled");
                    return ExecutionOutcome::Cancelled { output_log };
                }
                Err(StageFailure::Error { stdout, error }) => {
                    push_section(&mut output_log, stage, &stdout);
                    warn!(job_id, stage = stage.as_str(), error = %error, "stage failed");
                    return ExecutionOutcome::failed(output_log, error);
                }
            }
        }

        ExecutionOutcome::Completed { output_log }
    }

    async fn run_stage(
        &self,
        stage: Stage,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<StageOutput, StageFailure> {
        let mut cmd = Command::new(&self.config.cli_path);
        cmd.args(stage.args())
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_INPUT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| StageFailure::Error {
            stdout: String::new(),
            error: ExecutionError::Spawn {
                stage: stage.as_str(),
                source,
            },
        })?;
        debug!(stage = stage.as_str(), pid = ?child.id(), "stage spawned");

        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(self.config.stage_timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        if !matches!(waited, Waited::Exited(_)) {
            terminate_process_group(&mut child, self.config.kill_grace).await;
        }

        let stdout = drain(stdout_reader).await;
        let stderr = drain(stderr_reader).await;

        match waited {
            Waited::Exited(Ok(status)) if status.success() => Ok(StageOutput { stdout }),
            Waited::Exited(Ok(status)) => Err(StageFailure::Error {
                stdout,
                error: ExecutionError::NonZeroExit {
                    stage: stage.as_str(),
                    exit_code: status.code(),
                    stderr,
                },
            }),
            Waited::Exited(Err(source)) => Err(StageFailure::Error {
                stdout,
                error: ExecutionError::StageIo {
                    stage: stage.as_str(),
                    source,
                },
            }),
            Waited::TimedOut => Err(StageFailure::Error {
                stdout,
                error: ExecutionError::Timeout {
                    stage: stage.as_str(),
                    secs: self.config.stage_timeout.as_secs(),
                },
            }),
            Waited::Cancelled => Err(StageFailure::Cancelled { stdout }),
        }
    }
}

fn push_section(output_log: &mut String, stage: Stage, stdout: &str) {
    output_log.push_str("=== ");
    output_log.push_str(stage.title());
    output_log.push_str(" ===\n");
    output_log.push_str(stdout);
    if !stdout.is_empty() && !stdout.ends_with('\n') {
        output_log.push('\n');
    }
    output_log.push('\n');
}

/// SIGTERM the stage's process group, then SIGKILL whatever is left after
/// `grace`. The child is reaped before returning.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        return;
    };
    let pgid = pid as libc::pid_t;

    // SAFETY: killpg only sends a signal. `pgid` is the group this child
    // leads, created by `process_group(0)` at spawn.
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }

    let exited = tokio::time::timeout(grace, child.wait()).await.is_ok();

    // Leftover group members (e.g. provider plugins) get SIGKILL either way.
    // SAFETY: as above; ESRCH when the group is already empty is ignored.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }

    if !exited && let Err(e) = child.wait().await {
        warn!(pid, error = %e, "failed to reap stage process");
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _grace: Duration) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "failed to kill stage process");
    }
}

fn spawn_reader<R>(stream: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = Vec::new();
        let Some(mut stream) = stream else {
            return buffer;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => append_with_truncation(&mut buffer, &chunk[..n], MAX_OUTPUT_BYTES),
                Err(e) => {
                    warn!(error = %e, "failed to read stage output");
                    break;
                }
            }
        }
        buffer
    })
}

async fn drain(reader: JoinHandle<Vec<u8>>) -> String {
    let abort = reader.abort_handle();
    match tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!(error = %e, "output reader task failed");
            String::new()
        }
        Err(_) => {
            abort.abort();
            warn!("output pipe still open after stage ended; dropping remaining output");
            String::new()
        }
    }
}

/// Append `data`, letting the buffer grow to twice `max_bytes` before cutting
/// it back to the last `max_bytes`.
fn append_with_truncation(buffer: &mut Vec<u8>, data: &[u8], max_bytes: usize) {
    buffer.extend_from_slice(data);
    if buffer.len() > max_bytes * 2 {
        let mut keep_from = buffer.len() - max_bytes;
        // Don't start on a UTF-8 continuation byte.
        while keep_from < buffer.len() && (buffer[keep_from] & 0xC0) == 0x80 {
            keep_from += 1;
        }
        buffer.drain(..keep_from);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::{TempDir, tempdir};

    const CODE: &str = "resource \"null_resource\" \"x\" {}";

    fn create_test_script(dir: &Path, name: &str, content: &str) -> PathBuf {
        let script_path = dir.join(name);
        std::fs::write(&script_path, content).unwrap();
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    struct Harness {
        _dir: TempDir,
        engine: ExecutionEngine,
    }

    impl Harness {
        fn new(script: &str, stage_timeout: Duration) -> Self {
            let dir = tempdir().unwrap();
            let bin_dir = dir.path().join("bin");
            std::fs::create_dir_all(&bin_dir).unwrap();
            let cli = create_test_script(&bin_dir, "terraform", script);
            let engine = ExecutionEngine::new(
                EngineConfig {
                    cli_path: cli,
                    stage_timeout,
                    kill_grace: Duration::from_millis(200),
                },
                WorkspaceManager::new(dir.path().join("work"), "main.tf"),
            );
            Self { _dir: dir, engine }
        }
    }

    #[tokio::test]
    async fn test_plan_completes_with_ordered_sections() {
        let h = Harness::new(
            "#!/bin/sh\ncase \"$1\" in\n  init) echo 'Terraform has been successfully initialized!' ;;\n  plan) echo 'Plan: 1 to add'; cat main.tf ;;\nesac\n",
            Duration::from_secs(10),
        );
        let outcome = h
            .engine
            .run(1, JobCommand::Plan, Some(CODE), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status(), JobStatus::Completed);
        let log = outcome.output_log();
        let init = log.find("=== Init ===").expect("init section");
        let plan = log.find("=== Plan ===").expect("plan section");
        assert!(init < plan);
        assert!(log.contains("successfully initialized"));
        assert!(log.contains(CODE), "plan stage should see main.tf: {}", log);
        assert!(outcome.error_log().is_empty());
        assert!(!h.engine.workspaces().path_for(1).exists());
    }

    #[tokio::test]
    async fn test_apply_runs_non_interactively() {
        let h = Harness::new("#!/bin/sh\necho \"args: $*\"\n", Duration::from_secs(10));
        let outcome = h
            .engine
            .run(2, JobCommand::Apply, Some(CODE), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status(), JobStatus::Completed);
        assert!(outcome.output_log().contains("=== Apply ==="));
        assert!(
            outcome
                .output_log()
                .contains("args: apply -auto-approve -input=false -no-color")
        );
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let h = Harness::new(
            "#!/bin/sh\ncase \"$1\" in\n  init) echo initialized ;;\n  plan) echo 'partial plan'; echo 'Error: Invalid resource type' >&2; exit 1 ;;\nesac\n",
            Duration::from_secs(10),
        );
        let outcome = h
            .engine
            .run(3, JobCommand::Plan, Some(CODE), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status(), JobStatus::Failed);
        assert_eq!(outcome.error_log(), "Error: Invalid resource type\n");
        assert!(outcome.output_log().contains("=== Init ==="));
        assert!(outcome.output_log().contains("partial plan"));
        assert!(!h.engine.workspaces().path_for(3).exists());
    }

    #[tokio::test]
    async fn test_init_failure_skips_main_stage() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("plan-ran");
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  init) echo 'init broke' >&2; exit 1 ;;\n  plan) touch {} ;;\nesac\n",
            marker.display()
        );
        let h = Harness::new(&script, Duration::from_secs(10));
        let outcome = h
            .engine
            .run(4, JobCommand::Plan, Some(CODE), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status(), JobStatus::Failed);
        assert_eq!(outcome.error_log(), "init broke\n");
        assert!(!outcome.output_log().contains("=== Plan ==="));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_stage_timeout_fails_and_removes_workspace() {
        let h = Harness::new("#!/bin/sh\nsleep 30\n", Duration::from_millis(300));
        let started = Instant::now();
        let outcome = h
            .engine
            .run(5, JobCommand::Plan, Some(CODE), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status(), JobStatus::Failed);
        assert!(
            outcome.error_log().contains("timed out"),
            "got: {}",
            outcome.error_log()
        );
        assert!(outcome.error_log().contains("init"));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!h.engine.workspaces().path_for(5).exists());
    }

    #[tokio::test]
    async fn test_cancel_during_stage_kills_process_group() {
        // The backgrounded sleep keeps stdout open; the stage only drains
        // quickly if the whole group is killed.
        let h = Harness::new("#!/bin/sh\nsleep 30 &\nwait\n", Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = h.engine.run(6, JobCommand::Plan, Some(CODE), &cancel).await;

        assert_eq!(outcome.status(), JobStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!h.engine.workspaces().path_for(6).exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start_spawns_nothing() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let h = Harness::new(
            &format!("#!/bin/sh\ntouch {}\n", marker.display()),
            Duration::from_secs(10),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = h.engine.run(7, JobCommand::Plan, Some(CODE), &cancel).await;
        assert_eq!(outcome.status(), JobStatus::Cancelled);
        assert!(!marker.exists());
        assert!(!h.engine.workspaces().path_for(7).exists());
    }

    #[tokio::test]
    async fn test_cancel_between_stages_skips_main_stage() {
        // init exits at once but a background child holds its stdout open,
        // so the engine is still draining init when the token is raised.
        let dir = tempdir().unwrap();
        let init_done = dir.path().join("init-done");
        let plan_ran = dir.path().join("plan-ran");
        let script = format!(
            "#!/bin/sh\ncase \"$1\" in\n  init) echo initialized; (sleep 0.3; touch {}; sleep 1) & exit 0 ;;\n  plan) touch {} ;;\nesac\n",
            init_done.display(),
            plan_ran.display()
        );
        let h = Harness::new(&script, Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let watched = init_done.clone();
        tokio::spawn(async move {
            while !watched.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.cancel();
        });

        let outcome = h.engine.run(11, JobCommand::Plan, Some(CODE), &cancel).await;

        assert_eq!(outcome.status(), JobStatus::Cancelled);
        assert!(outcome.output_log().contains("=== Init ==="));
        assert!(outcome.output_log().contains("initialized"));
        assert!(!outcome.output_log().contains("=== Plan ==="));
        assert!(init_done.exists());
        assert!(!plan_ran.exists());
        assert!(!h.engine.workspaces().path_for(11).exists());
    }

    #[tokio::test]
    async fn test_teardown_failure_keeps_outcome() {
        // The plan stage swaps its workspace directory for a plain file,
        // which directory removal refuses even when running as root.
        let h = Harness::new(
            "#!/bin/sh\ncase \"$1\" in\n  init) echo initialized ;;\n  plan) d=$(pwd); cd /; rm -rf \"$d\"; echo leftover > \"$d\"; echo 'Plan: 1 to add' ;;\nesac\n",
            Duration::from_secs(10),
        );
        let outcome = h
            .engine
            .run(12, JobCommand::Plan, Some(CODE), &CancellationToken::new())
            .await;

        assert_eq!(outcome.status(), JobStatus::Completed);
        assert!(outcome.output_log().contains("Plan: 1 to add"));
        assert!(outcome.error_log().is_empty());
        assert!(h.engine.workspaces().path_for(12).is_file());
    }

    #[tokio::test]
    async fn test_missing_code_fails_without_spawning() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let h = Harness::new(
            &format!("#!/bin/sh\ntouch {}\n", marker.display()),
            Duration::from_secs(10),
        );

        for code in [None, Some(""), Some("  \n")] {
            let outcome = h
                .engine
                .run(8, JobCommand::Plan, code, &CancellationToken::new())
                .await;
            assert_eq!(outcome.status(), JobStatus::Failed);
            assert!(outcome.error_log().contains("No configuration code"));
        }
        assert!(!marker.exists());
        assert!(!h.engine.workspaces().path_for(8).exists());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_with_spawn_error() {
        let dir = tempdir().unwrap();
        let engine = ExecutionEngine::new(
            EngineConfig {
                cli_path: dir.path().join("does-not-exist"),
                ..EngineConfig::default()
            },
            WorkspaceManager::new(dir.path().join("work"), "main.tf"),
        );
        let outcome = engine
            .run(9, JobCommand::Plan, Some(CODE), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status(), JobStatus::Failed);
        assert!(outcome.error_log().contains("Failed to spawn init stage"));
        assert!(!engine.workspaces().path_for(9).exists());
    }

    #[tokio::test]
    async fn test_unwritable_root_fails_with_filesystem_error() {
        let dir = tempdir().unwrap();
        let file_root = dir.path().join("root-is-a-file");
        std::fs::write(&file_root, "x").unwrap();
        let engine = ExecutionEngine::new(
            EngineConfig::default(),
            WorkspaceManager::new(&file_root, "main.tf"),
        );
        let outcome = engine
            .run(10, JobCommand::Plan, Some(CODE), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status(), JobStatus::Failed);
        assert!(outcome.error_log().contains("Workspace error"));
    }

    #[test]
    fn test_stage_pipeline() {
        assert_eq!(Stage::pipeline(JobCommand::Plan), [Stage::Init, Stage::Plan]);
        assert_eq!(
            Stage::pipeline(JobCommand::Destroy),
            [Stage::Init, Stage::Destroy]
        );
        assert!(!Stage::Plan.args().contains(&"-auto-approve"));
        assert!(Stage::Destroy.args().contains(&"-auto-approve"));
    }

    #[test]
    fn test_push_section_terminates_lines() {
        let mut log = String::new();
        push_section(&mut log, Stage::Init, "no newline");
        push_section(&mut log, Stage::Plan, "");
        assert_eq!(log, "=== Init ===\nno newline\n\n=== Plan ===\n\n");
    }

    #[test]
    fn test_append_with_truncation_keeps_tail() {
        let mut buffer = Vec::new();
        append_with_truncation(&mut buffer, &[b'a'; 10], 4);
        assert_eq!(buffer.len(), 4);
        append_with_truncation(&mut buffer, b"bc", 4);
        assert_eq!(buffer, b"aaaabc");
        append_with_truncation(&mut buffer, b"def", 4);
        assert_eq!(buffer, b"cdef");
    }
}
