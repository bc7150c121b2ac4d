use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, Query, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::error;

use super::code_source::{FallbackCodeSource, GenerateRequest};
use super::models::*;
use super::service::JobService;
use crate::errors::JobError;

/// Header carrying the authenticated caller's id, set by the upstream auth layer.
pub const OWNER_HEADER: &str = "x-owner-id";
/// Header carrying the caller's role; `admin` bypasses ownership scoping.
pub const ROLE_HEADER: &str = "x-role";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: Arc<JobService>,
    pub code_source: Arc<FallbackCodeSource>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payload types ──────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl ListParams {
    fn into_query(self) -> Result<ListQuery, ApiError> {
        let status = self
            .status
            .filter(|s| !s.is_empty())
            .map(|s| JobStatus::from_str(&s))
            .transpose()
            .map_err(ApiError::BadRequest)?;
        Ok(ListQuery {
            status,
            offset: self.offset,
            limit: self.limit,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub code: String,
    pub provider: String,
    pub project_name: String,
    pub source: &'static str,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(msg) => ApiError::BadRequest(msg),
            e @ JobError::NotFound { .. } => ApiError::NotFound(e.to_string()),
            e @ (JobError::InvalidState { .. } | JobError::Conflict { .. }) => {
                ApiError::Conflict(e.to_string())
            }
            e @ (JobError::Database(_) | JobError::Other(_)) => {
                error!(error = ?e, "internal error while handling request");
                ApiError::Internal(e.to_string())
            }
        }
    }
}

// ── Principal extraction ──────────────────────────────────────────────

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner_id = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized(format!("Missing {} header", OWNER_HEADER)))?;
        let elevated = parts
            .headers
            .get(ROLE_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|role| role.trim().eq_ignore_ascii_case("admin"));
        Ok(Principal {
            owner_id: owner_id.to_string(),
            elevated,
        })
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/execute", post(execute_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/logs", get(get_job_logs))
        .route("/api/apply", post(apply_job))
        .route("/api/generate", post(generate_code))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_jobs(
    State(state): State<SharedState>,
    principal: Principal,
    Query(params): Query<ListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let query = params.into_query()?;
    let jobs = state.service.list(&principal, &query).await?;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<SharedState>,
    principal: Principal,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.create(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<SharedState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.get(&principal, id).await?;
    Ok(Json(job))
}

async fn execute_job(
    State(state): State<SharedState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.execute(&principal, id).await?;
    Ok(Json(job))
}

async fn cancel_job(
    State(state): State<SharedState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.cancel(&principal, id).await?;
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<SharedState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete(&principal, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_job_logs(
    State(state): State<SharedState>,
    principal: Principal,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state.service.logs(&principal, id).await?;
    Ok(Json(logs))
}

async fn apply_job(
    State(state): State<SharedState>,
    principal: Principal,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.service.create_and_execute(&principal, req).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn generate_code(
    State(state): State<SharedState>,
    _principal: Principal,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    req.validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let (code, source) = state
        .code_source
        .generate_with_source(&req)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(GenerateResponse {
        code,
        provider: req.provider,
        project_name: req.project_name,
        source,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use crate::jobs::code_source::TemplateCodeSource;
    use crate::jobs::db::{DbHandle, JobDb};
    use crate::jobs::engine::{EngineConfig, ExecutionEngine};
    use crate::jobs::service::ServiceOptions;
    use crate::jobs::workspace::WorkspaceManager;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const CODE: &str = "resource \"null_resource\" \"x\" {}";

    fn test_app() -> (Router, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cli = dir.path().join("terraform");
        std::fs::write(&cli, "#!/bin/sh\necho \"$1 ok\"\n").unwrap();
        let mut perms = std::fs::metadata(&cli).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&cli, perms).unwrap();

        let engine = ExecutionEngine::new(
            EngineConfig {
                cli_path: cli,
                stage_timeout: Duration::from_secs(10),
                kill_grace: Duration::from_millis(200),
            },
            WorkspaceManager::new(dir.path().join("work"), "main.tf"),
        );
        let service = JobService::new(
            DbHandle::new(JobDb::new_in_memory().unwrap()),
            engine,
            ServiceOptions {
                mode: ExecutionMode::Blocking,
                ..Default::default()
            },
        );
        let state = Arc::new(AppState {
            service: Arc::new(service),
            code_source: Arc::new(FallbackCodeSource::new(vec![Arc::new(TemplateCodeSource)])),
        });
        (api_router().with_state(state), dir)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(
        method: &str,
        uri: &str,
        owner: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header(OWNER_HEADER, owner);
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    fn job_body(name: &str, command: &str) -> serde_json::Value {
        serde_json::json!({"name": name, "command": command, "config": {"code": CODE}})
    }

    async fn create(app: &Router, owner: &str, name: &str) -> i64 {
        let response = app
            .clone()
            .oneshot(request("POST", "/api/jobs", Some(owner), Some(job_body(name, "plan"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job: serde_json::Value = body_json(response.into_body()).await;
        job["id"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _dir) = test_app();
        let response = app.oneshot(request("GET", "/health", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_owner_is_unauthorized() {
        let (app, _dir) = test_app();
        let response = app.oneshot(request("GET", "/api/jobs", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains(OWNER_HEADER));
    }

    #[tokio::test]
    async fn test_create_job() {
        let (app, _dir) = test_app();
        let response = app
            .oneshot(request("POST", "/api/jobs", Some("alice"), Some(job_body("demo", "plan"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(job["name"], "demo");
        assert_eq!(job["owner_id"], "alice");
        assert_eq!(job["status"], "pending");
        assert!(job["completed_at"].is_null());
    }

    #[tokio::test]
    async fn test_create_job_validation_error() {
        let (app, _dir) = test_app();
        let response = app
            .oneshot(request("POST", "/api/jobs", Some("alice"), Some(job_body("demo", "import"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("Invalid command"));
    }

    #[tokio::test]
    async fn test_get_job_ownership() {
        let (app, _dir) = test_app();
        let id = create(&app, "alice", "demo").await;

        let response = app
            .clone()
            .oneshot(request("GET", &format!("/api/jobs/{}", id), Some("bob"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let admin = Request::builder()
            .uri(format!("/api/jobs/{}", id))
            .header(OWNER_HEADER, "root")
            .header(ROLE_HEADER, "admin")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(admin).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("GET", "/api/jobs/999", Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_jobs_with_filter() {
        let (app, _dir) = test_app();
        let first = create(&app, "alice", "one").await;
        create(&app, "alice", "two").await;
        create(&app, "bob", "three").await;
        app.clone()
            .oneshot(request("POST", &format!("/api/jobs/{}/cancel", first), Some("alice"), None))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(request("GET", "/api/jobs", Some("alice"), None))
            .await
            .unwrap();
        let jobs: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["name"], "two");

        let response = app
            .clone()
            .oneshot(request("GET", "/api/jobs?status=CANCELLED&limit=10", Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let jobs: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0]["id"], first);

        let response = app
            .oneshot(request("GET", "/api/jobs?status=paused", Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_execute_and_logs() {
        let (app, _dir) = test_app();
        let id = create(&app, "alice", "demo").await;

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/api/jobs/{}/execute", id), Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(job["status"], "completed");

        let response = app
            .clone()
            .oneshot(request("POST", &format!("/api/jobs/{}/execute", id), Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .oneshot(request("GET", &format!("/api/jobs/{}/logs", id), Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let logs: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(logs["job_id"], id);
        assert_eq!(logs["job_name"], "demo");
        let output = logs["output_log"].as_str().unwrap();
        assert!(output.contains("=== Init ===\ninit ok"));
        assert!(output.contains("=== Plan ===\nplan ok"));
    }

    #[tokio::test]
    async fn test_cancel_twice_conflicts() {
        let (app, _dir) = test_app();
        let id = create(&app, "alice", "demo").await;
        let uri = format!("/api/jobs/{}/cancel", id);

        let response = app
            .clone()
            .oneshot(request("POST", &uri, Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let job: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(job["status"], "cancelled");
        assert!(!job["completed_at"].is_null());

        let response = app.oneshot(request("POST", &uri, Some("alice"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_delete_job() {
        let (app, _dir) = test_app();
        let id = create(&app, "alice", "demo").await;
        let uri = format!("/api/jobs/{}", id);

        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, Some("bob"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(request("DELETE", &uri, Some("alice"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(request("GET", &uri, Some("alice"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_apply_shortcut() {
        let (app, _dir) = test_app();
        let response = app
            .oneshot(request("POST", "/api/apply", Some("alice"), Some(job_body("stack", "apply"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let job: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(job["command"], "apply");
        assert_eq!(job["status"], "completed");
        assert!(job["output_log"].as_str().unwrap().contains("=== Apply ==="));
    }

    #[tokio::test]
    async fn test_generate_code() {
        let (app, _dir) = test_app();
        let body = serde_json::json!({
            "provider": "aws",
            "project_name": "shop",
            "resources": [{"id": "web", "type": "ec2", "label": "Web"}]
        });
        let response = app
            .clone()
            .oneshot(request("POST", "/api/generate", Some("alice"), Some(body)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let generated: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(generated["provider"], "aws");
        assert_eq!(generated["project_name"], "shop");
        assert_eq!(generated["source"], "template");
        assert!(generated["code"].as_str().unwrap().contains("aws_instance"));

        let bad = serde_json::json!({"provider": "aws", "project_name": "", "resources": []});
        let response = app
            .oneshot(request("POST", "/api/generate", Some("alice"), Some(bad)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
