//! Configuration for the job runner.
//!
//! Settings are layered: the TOML file (default `.iac-runner/config.toml`),
//! then environment variables, then CLI flags applied by the caller.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [database]
//! path = ".iac-runner/jobs.db"
//!
//! [executor]
//! cli_path = "terraform"
//! workspace_root = "/tmp/terraform_jobs"
//! config_file_name = "main.tf"
//! stage_timeout_secs = 300
//! max_workers = 4
//! mode = "background"
//! kill_grace_secs = 2
//! settle_timeout_secs = 30
//!
//! [code_source]
//! ai_enabled = false
//! ai_base_url = "http://localhost:11434"
//! ai_model = "terraform-codellama"
//! ai_timeout_secs = 300
//!
//! [logging]
//! level = "info"
//! format = "text"
//! directory = ""
//! ```
//!
//! Environment overrides: `TERRAFORM_CMD`, `TERRAFORM_WORK_DIR`,
//! `IAC_RUNNER_DB_PATH`, `IAC_RUNNER_LOG_LEVEL`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::jobs::engine::EngineConfig;
use crate::jobs::service::ServiceOptions;
use crate::jobs::workspace::WorkspaceManager;

pub const DEFAULT_CONFIG_PATH: &str = ".iac-runner/config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub code_source: CodeSourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".iac-runner/jobs.db"),
        }
    }
}

/// How `execute` hands a job to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Return the `RUNNING` record at once; callers poll for the outcome.
    #[default]
    Background,
    /// The caller waits until the job is terminal.
    Blocking,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Background => write!(f, "background"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub cli_path: PathBuf,
    pub workspace_root: PathBuf,
    pub config_file_name: String,
    pub stage_timeout_secs: u64,
    pub max_workers: usize,
    pub mode: ExecutionMode,
    pub kill_grace_secs: u64,
    pub settle_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            cli_path: PathBuf::from("terraform"),
            workspace_root: PathBuf::from("/tmp/terraform_jobs"),
            config_file_name: "main.tf".to_string(),
            stage_timeout_secs: 300,
            max_workers: 4,
            mode: ExecutionMode::Background,
            kill_grace_secs: 2,
            settle_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeSourceConfig {
    pub ai_enabled: bool,
    pub ai_base_url: String,
    pub ai_model: String,
    pub ai_timeout_secs: u64,
}

impl Default for CodeSourceConfig {
    fn default() -> Self {
        Self {
            ai_enabled: false,
            ai_base_url: "http://localhost:11434".to_string(),
            ai_model: "terraform-codellama".to_string(),
            ai_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Directory for daily-rotated log files; empty disables file logging.
    pub directory: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            directory: String::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Load configuration from `path`, or defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(cmd) = non_empty("TERRAFORM_CMD") {
            self.executor.cli_path = PathBuf::from(cmd);
        }
        if let Some(dir) = non_empty("TERRAFORM_WORK_DIR") {
            self.executor.workspace_root = PathBuf::from(dir);
        }
        if let Some(path) = non_empty("IAC_RUNNER_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(level) = non_empty("IAC_RUNNER_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.executor.max_workers == 0 {
            warnings.push("executor.max_workers is 0; it will be treated as 1".to_string());
        }
        if self.executor.stage_timeout_secs == 0 {
            warnings.push(
                "executor.stage_timeout_secs is 0; every stage will time out".to_string(),
            );
        }
        if self.executor.settle_timeout_secs == 0 {
            warnings.push(
                "executor.settle_timeout_secs is 0; cancelling or deleting a running job will report a conflict"
                    .to_string(),
            );
        }
        if self.executor.workspace_root.is_relative() {
            warnings.push(format!(
                "executor.workspace_root '{}' is relative; it resolves against the working directory",
                self.executor.workspace_root.display()
            ));
        }
        if self.executor.config_file_name.is_empty()
            || self.executor.config_file_name.contains(['/', '\\'])
        {
            warnings.push(format!(
                "executor.config_file_name '{}' must be a plain file name",
                self.executor.config_file_name
            ));
        }
        if self.code_source.ai_enabled && self.code_source.ai_base_url.trim().is_empty() {
            warnings.push("code_source.ai_enabled is set but ai_base_url is empty".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "logging.level '{}' is not a valid filter directive",
                self.logging.level
            ));
        }
        warnings
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cli_path: self.executor.cli_path.clone(),
            stage_timeout: Duration::from_secs(self.executor.stage_timeout_secs),
            kill_grace: Duration::from_secs(self.executor.kill_grace_secs),
        }
    }

    pub fn workspace_manager(&self) -> WorkspaceManager {
        WorkspaceManager::new(
            self.executor.workspace_root.clone(),
            self.executor.config_file_name.clone(),
        )
    }

    pub fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            max_workers: self.executor.max_workers.max(1),
            mode: self.executor.mode,
            settle_timeout: Duration::from_secs(self.executor.settle_timeout_secs),
        }
    }
}
