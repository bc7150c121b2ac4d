use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a job name, in characters.
pub const MAX_NAME_LEN: usize = 200;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// The command a job runs after `init`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobCommand {
    Plan,
    Apply,
    Destroy,
}

impl JobCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for JobCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "apply" => Ok(Self::Apply),
            "destroy" => Ok(Self::Destroy),
            _ => Err(format!(
                "Invalid command '{}'. Valid values: plan, apply, destroy",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub command: JobCommand,
    pub config: serde_json::Value,
    pub status: JobStatus,
    pub output_log: String,
    pub error_log: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// The configuration source text, if present and non-blank.
    pub fn code(&self) -> Option<&str> {
        config_code(&self.config)
    }
}

/// Extract a non-blank `code` string from a job config payload.
pub fn config_code(config: &serde_json::Value) -> Option<&str> {
    config
        .get("code")
        .and_then(|v| v.as_str())
        .filter(|code| !code.trim().is_empty())
}

/// Logs accessor view of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogs {
    pub job_id: i64,
    pub job_name: String,
    pub status: JobStatus,
    pub output_log: String,
    pub error_log: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobLogs {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_name: job.name.clone(),
            status: job.status,
            output_log: job.output_log.clone(),
            error_log: job.error_log.clone(),
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// The caller as reported by the authorization collaborator.
///
/// Elevated (admin) principals bypass ownership scoping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub owner_id: String,
    pub elevated: bool,
}

impl Principal {
    pub fn user(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            elevated: false,
        }
    }

    pub fn admin(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            elevated: true,
        }
    }

    /// The owner filter to apply to lookups, `None` for elevated callers.
    pub fn scope(&self) -> Option<&str> {
        if self.elevated {
            None
        } else {
            Some(&self.owner_id)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub command: String,
    pub config: serde_json::Value,
}

/// Pagination and filtering for job listings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<JobStatus>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl ListQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn limit(&self) -> i64 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(JobStatus::from_str("RUNNING").unwrap(), JobStatus::Running);
        assert!(JobStatus::from_str("paused").is_err());
    }

    #[test]
    fn test_is_cancellable() {
        assert!(JobStatus::Pending.is_cancellable());
        assert!(JobStatus::Running.is_cancellable());
        assert!(!JobStatus::Completed.is_cancellable());
        assert!(!JobStatus::Failed.is_cancellable());
        assert!(!JobStatus::Cancelled.is_cancellable());
    }

    #[test]
    fn test_terminal_and_cancellable_are_disjoint() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_ne!(status.is_terminal(), status.is_cancellable(), "{}", status);
        }
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(JobCommand::from_str("plan").unwrap(), JobCommand::Plan);
        assert_eq!(JobCommand::from_str("apply").unwrap(), JobCommand::Apply);
        assert_eq!(JobCommand::from_str("destroy").unwrap(), JobCommand::Destroy);
        let err = JobCommand::from_str("import").unwrap_err();
        assert!(err.contains("import"));
        assert!(JobCommand::from_str("APPLY").is_err());
    }

    #[test]
    fn test_config_code() {
        let config =
            serde_json::json!({"code": "resource \"null_resource\" \"x\" {}", "provider": "aws"});
        assert_eq!(config_code(&config), Some("resource \"null_resource\" \"x\" {}"));
        assert_eq!(config_code(&serde_json::json!({"code": "   "})), None);
        assert_eq!(config_code(&serde_json::json!({"code": 12})), None);
        assert_eq!(config_code(&serde_json::json!({"provider": "aws"})), None);
    }

    #[test]
    fn test_principal_scope() {
        assert_eq!(Principal::user("alice").scope(), Some("alice"));
        assert_eq!(Principal::admin("root").scope(), None);
    }

    #[test]
    fn test_list_query_clamps() {
        let q = ListQuery {
            status: None,
            offset: Some(-5),
            limit: Some(5000),
        };
        assert_eq!(q.offset(), 0);
        assert_eq!(q.limit(), ListQuery::MAX_LIMIT);
        assert_eq!(ListQuery::default().limit(), ListQuery::DEFAULT_LIMIT);
        let q = ListQuery {
            limit: Some(0),
            ..Default::default()
        };
        assert_eq!(q.limit(), 1);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }
}
