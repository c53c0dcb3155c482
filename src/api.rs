//! REST surface. Handlers are thin: validate, call into the engine / store
//! / hub, serialize. Every response body uses the envelope
//! `{success, data, error, timestamp}`; errors carry a machine-readable
//! code plus a human message.

use std::collections::HashMap;
use std::path::{Component, Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::engine::{CancelReason, ExecutionEngine};
use crate::errors::{EngineError, ErrorCode, StoreError};
use crate::files::FileStore;
use crate::hub::EventHub;
use crate::models::{Execution, ExecutionDetail, ExecutionStatus};
use crate::store::{ListFilter, StoreHandle};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state for both listeners.
pub struct AppState {
    pub config: Config,
    pub store: StoreHandle,
    pub hub: Arc<EventHub>,
    pub engine: ExecutionEngine,
    pub files: Arc<FileStore>,
    pub delete_tx: mpsc::Sender<String>,
    pub started_at: std::time::Instant,
}

pub type SharedState = Arc<AppState>;

// ── Envelope ──────────────────────────────────────────────────────────

fn envelope<T: Serialize>(data: T) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "data": data,
        "error": null,
        "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
    })
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(envelope(data)).into_response()
}

fn created<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(envelope(data))).into_response()
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Conflict,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Unauthorized,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self.code {
            ErrorCode::Validation => StatusCode::BAD_REQUEST,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::StoreUnavailable | ErrorCode::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Timeout => StatusCode::REQUEST_TIMEOUT,
            ErrorCode::Io | ErrorCode::ChildProcess | ErrorCode::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "success": false,
            "data": null,
            "error": {"code": self.code.as_str(), "message": self.message},
            "timestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::NotFound { .. } => ErrorCode::NotFound,
            StoreError::Conflict(_) => ErrorCode::Conflict,
            StoreError::Unavailable => ErrorCode::StoreUnavailable,
            StoreError::Io(_) => ErrorCode::Io,
            StoreError::Sqlite(_) | StoreError::Corrupt(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let code = match &err {
            EngineError::EmptyCommand => ErrorCode::Validation,
            EngineError::Overloaded { .. } => ErrorCode::Overloaded,
            EngineError::NotFound { .. } => ErrorCode::NotFound,
            EngineError::AlreadyTerminal { .. } => ErrorCode::Conflict,
            EngineError::SpawnFailed(_) => ErrorCode::ChildProcess,
            EngineError::Store(inner) => return Self::from_store_ref(inner),
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl ApiError {
    fn from_store_ref(err: &StoreError) -> Self {
        let code = match err {
            StoreError::NotFound { .. } => ErrorCode::NotFound,
            StoreError::Conflict(_) => ErrorCode::Conflict,
            StoreError::Unavailable => ErrorCode::StoreUnavailable,
            StoreError::Io(_) => ErrorCode::Io,
            StoreError::Sqlite(_) | StoreError::Corrupt(_) => ErrorCode::Internal,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateExecutionRequest {
    pub name: Option<String>,
    pub command: String,
    pub working_directory: Option<String>,
    pub environment: Option<HashMap<String, String>>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Wall-clock timeout in seconds; must be >= 1 when present.
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<String>,
    pub user: Option<String>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/health/status", get(health_status))
        .route("/api/health/metrics", get(health_metrics))
        .route("/api/health/optimize", post(health_optimize))
        .route(
            "/api/executions",
            get(list_executions).post(create_execution),
        )
        .route("/api/executions/active", get(active_executions))
        .route("/api/executions/statistics", get(execution_statistics))
        .route(
            "/api/executions/:id",
            get(get_execution).delete(delete_execution),
        )
        .route("/api/executions/:id/cancel", post(cancel_execution))
        .route("/api/artifacts/:id", get(get_artifact))
        .route("/api/artifacts/:id/download", get(download_artifact))
        .route("/api/artifacts/execution/:id", get(execution_artifacts))
}

// ── Health ────────────────────────────────────────────────────────────

async fn health(State(state): State<SharedState>) -> Response {
    ok(serde_json::json!({
        "status": "healthy",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": VERSION,
    }))
}

async fn health_status(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let db_healthy = state.store.call(|store| store.ping()).await.is_ok();
    let statistics = match state.store.call(|store| store.get_statistics()).await {
        Ok(stats) => Some(stats),
        Err(_) => None,
    };
    let healthy = db_healthy;

    Ok(ok(serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": VERSION,
        "components": {
            "database": if db_healthy { "healthy" } else { "unhealthy" },
            "hub": "healthy",
        },
        "hub": {
            "global_subscribers": state.hub.global_subscriber_count(),
            "execution_topics": state.hub.topic_count(),
            "events_dropped": state.hub.events_dropped(),
        },
        "active_executions": state.engine.active_count().await,
        "accepting": state.engine.is_accepting(),
        "storage_path": state.config.storage_path.display().to_string(),
        "statistics": statistics,
    })))
}

async fn health_metrics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let statistics = state.store.call(|store| store.get_statistics()).await?;
    Ok(ok(serde_json::json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "active_executions": state.engine.active_count().await,
        "global_subscribers": state.hub.global_subscriber_count(),
        "execution_topics": state.hub.topic_count(),
        "events_dropped": state.hub.events_dropped(),
        "executions": statistics,
    })))
}

async fn health_optimize(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let report = state.store.call(|store| store.optimize()).await?;
    Ok(ok(report))
}

// ── Executions ────────────────────────────────────────────────────────

async fn create_execution(
    State(state): State<SharedState>,
    body: Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let request: CreateExecutionRequest = serde_json::from_value(body.0)
        .map_err(|e| ApiError::validation(format!("invalid request body: {}", e)))?;

    if request.command.trim().is_empty() {
        return Err(ApiError::validation("command must not be empty"));
    }
    if let Some(timeout) = request.timeout {
        if timeout < 1 {
            return Err(ApiError::validation("timeout must be at least 1 second"));
        }
    }
    let workdir = resolve_working_directory(&state.config, request.working_directory.as_deref())?;

    let mut execution = Execution::new(request.name.unwrap_or_default(), request.command);
    execution.working_directory = workdir.to_string_lossy().to_string();
    execution.environment = request.environment.unwrap_or_default();
    execution.tags = request.tags.unwrap_or_default();
    execution.metadata = request.metadata.unwrap_or_default();

    let timeout = request
        .timeout
        .or(state.config.default_timeout_seconds)
        .map(Duration::from_secs);

    let execution = state.engine.start(execution, timeout).await?;
    Ok(created(execution))
}

async fn list_executions(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|s| {
            s.parse::<ExecutionStatus>()
                .map_err(|_| ApiError::validation(format!("unknown status filter: {}", s)))
        })
        .transpose()?;

    let filter = ListFilter {
        status,
        user: query.user,
        limit: query.limit.unwrap_or(50).clamp(1, 200),
        offset: query.offset.unwrap_or(0).max(0),
    };
    let executions = state
        .store
        .call(move |store| store.list_executions(&filter))
        .await?;
    Ok(ok(executions))
}

async fn active_executions(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let executions = state.store.call(|store| store.list_active()).await?;
    Ok(ok(executions))
}

async fn execution_statistics(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let statistics = state.store.call(|store| store.get_statistics()).await?;
    Ok(ok(statistics))
}

async fn get_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let detail = load_execution_detail(&state, &id).await?;
    Ok(ok(detail))
}

/// Live snapshot when active, otherwise store + log files.
pub async fn load_execution_detail(
    state: &SharedState,
    id: &str,
) -> Result<ExecutionDetail, ApiError> {
    if let Some(detail) = state.engine.snapshot(id).await {
        return Ok(detail);
    }

    let owned = id.to_string();
    let execution = state
        .store
        .call(move |store| store.get_execution(&owned))
        .await?;
    let owned = id.to_string();
    let mut steps = state
        .store
        .call(move |store| store.get_steps(&owned))
        .await?;
    let owned = id.to_string();
    let artifacts = state
        .store
        .call(move |store| store.get_artifacts(&owned))
        .await?;

    // Hydrate step logs from disk off the async path.
    let files = state.files.clone();
    let execution_id = id.to_string();
    steps = tokio::task::spawn_blocking(move || {
        for step in &mut steps {
            let path = files.step_log_path(&execution_id, step.index, &step.id);
            step.logs = files.read_log_tail(&path, Some(&step.id), 0);
        }
        steps
    })
    .await
    .map_err(|_| ApiError::internal("log hydration task failed"))?;

    Ok(ExecutionDetail {
        execution,
        steps,
        artifacts,
    })
}

async fn cancel_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    state.engine.cancel(&id, CancelReason::Requested).await?;
    Ok(ok(serde_json::json!({
        "id": id,
        "cancel_initiated": true,
    })))
}

async fn delete_execution(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.engine.is_active(&id).await {
        return Err(ApiError::conflict(
            "execution is running; cancel it before deleting",
        ));
    }
    let owned = id.clone();
    state
        .store
        .call(move |store| store.delete_execution(&owned))
        .await?;
    // Files go on the background sweep once the cascade has committed.
    if state.delete_tx.send(id).await.is_err() {
        tracing::warn!("delete worker unavailable; on-disk files left behind");
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Artifacts ─────────────────────────────────────────────────────────

async fn get_artifact(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owned = id.clone();
    let artifact = state
        .store
        .call(move |store| store.get_artifact(&owned))
        .await?;
    let download_url = artifact.download_url();
    let mut value = serde_json::to_value(&artifact)
        .map_err(|e| ApiError::internal(format!("serialization failed: {}", e)))?;
    value["download_url"] = serde_json::json!(download_url);
    Ok(ok(value))
}

async fn download_artifact(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owned = id.clone();
    let artifact = state
        .store
        .call(move |store| store.get_artifact(&owned))
        .await?;

    let bytes = tokio::fs::read(&artifact.file_path)
        .await
        .map_err(|_| ApiError::not_found(format!("artifact file missing: {}", artifact.id)))?;

    let disposition = format!("attachment; filename=\"{}\"", artifact.file_name);
    Response::builder()
        .header(header::CONTENT_TYPE, artifact.mime_type)
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from(bytes))
        .map_err(|e| ApiError::internal(format!("response build failed: {}", e)))
}

async fn execution_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let owned = id.clone();
    // 404 for an unknown execution rather than an empty list.
    state
        .store
        .call(move |store| store.get_execution(&owned))
        .await?;
    let owned = id.clone();
    let artifacts = state
        .store
        .call(move |store| store.get_artifacts(&owned))
        .await?;
    Ok(ok(artifacts))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Resolve a requested working directory inside the workspace sandbox.
fn resolve_working_directory(
    config: &Config,
    requested: Option<&str>,
) -> Result<PathBuf, ApiError> {
    let root = normalize(&config.workspace_dir());
    let requested = requested.unwrap_or(".");
    let joined = if StdPath::new(requested).is_absolute() {
        normalize(StdPath::new(requested))
    } else {
        normalize(&root.join(requested))
    };
    if !joined.starts_with(&root) {
        return Err(ApiError::validation(format!(
            "working_directory must resolve inside the workspace: {}",
            requested
        )));
    }
    Ok(joined)
}

/// Lexical normalization; no filesystem access so nonexistent paths work.
fn normalize(path: &StdPath) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
