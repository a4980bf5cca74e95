//! HTTP 接口
//!
//! - POST /tasks、GET /tasks、GET/PATCH /tasks/:id
//! - POST /tasks/:id/cancel、POST /tasks/:id/reopen
//! - GET /monitor/issues、GET /effectiveness、GET /health
//!
//! 错误统一为 `{"error": "..."}`：404 未知任务，409 非法转换，422 请求格式错误，500 存储故障。
//! /health 在应有 worker 却一个都不存活时返回 503，看门狗据此判定进程不健康。

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{RetryPolicy, StoreError};
use crate::dispatcher::WorkerGauge;
use crate::monitor::{EffectivenessReport, Monitor, OpenIssue};
use crate::store::TaskStore;
use crate::task::{NewTask, Resolution, Task, TaskFilter, TaskStatus, TaskType};

/// API 共享状态
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub policy: Arc<RetryPolicy>,
    pub monitor: Monitor,
    pub version: String,
    /// 配置的 worker 数
    pub workers: usize,
    pub live_workers: WorkerGauge,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("store error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::NotFound(format!("task not found: {}", id)),
            StoreError::Transition(t) => ApiError::Conflict(t.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Unprocessable(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Unprocessable(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(msg) => {
                tracing::error!("api store failure: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id", get(get_task).patch(patch_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/reopen", post(reopen_task))
        .route("/monitor/issues", get(open_issues))
        .route("/effectiveness", get(effectiveness))
        .route("/health", get(health))
        .with_state(state)
}

async fn create_task(
    State(state): State<Arc<AppState>>,
    body: Result<Json<NewTask>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let Json(new) = body?;
    if new.direction.trim().is_empty() {
        return Err(ApiError::Unprocessable("direction must not be empty".into()));
    }
    if new.max_attempts == Some(0) {
        return Err(ApiError::Unprocessable("max_attempts must be at least 1".into()));
    }
    let max_attempts = state.policy.max_attempts_for(new.task_type, new.max_attempts);
    let task = state.store.create(new, max_attempts).await?;
    tracing::info!(task_id = %task.id, task_type = %task.task_type, "task created");
    Ok((StatusCode::CREATED, Json(task)))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    task_type: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

#[derive(Debug, Serialize)]
struct TaskPage {
    tasks: Vec<Task>,
    limit: usize,
    offset: usize,
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> ApiResult<Json<TaskPage>> {
    let Query(query) = query?;
    let filter = TaskFilter {
        status: query
            .status
            .as_deref()
            .map(str::parse::<TaskStatus>)
            .transpose()
            .map_err(ApiError::Unprocessable)?,
        task_type: query
            .task_type
            .as_deref()
            .map(str::parse::<TaskType>)
            .transpose()
            .map_err(ApiError::Unprocessable)?,
        limit: query.limit,
        offset: query.offset,
    };
    let tasks = state.store.list(&filter).await?;
    Ok(Json(TaskPage {
        tasks,
        limit: filter.page_size(),
        offset: filter.offset,
    }))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    Ok(Json(state.store.get(&id).await?))
}

#[derive(Debug, Deserialize)]
struct PatchTask {
    status: Option<TaskStatus>,
    output: Option<String>,
}

/// 外部决策：needs_decision -> pending | failed
async fn patch_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Result<Json<PatchTask>, JsonRejection>,
) -> ApiResult<Json<Task>> {
    let Json(patch) = body?;
    let status = patch
        .status
        .ok_or_else(|| ApiError::Unprocessable("status is required".into()))?;
    let resolution = Resolution::try_from(status).map_err(|e| ApiError::Conflict(e.to_string()))?;
    let task = state.store.resolve(&id, resolution, patch.output).await?;
    tracing::info!(task_id = %task.id, status = %task.status, "external decision applied");
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = state.store.cancel(&id).await?;
    tracing::info!(task_id = %task.id, "task cancelled");
    Ok(Json(task))
}

async fn reopen_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Task>> {
    let task = state.store.reopen(&id).await?;
    tracing::info!(task_id = %task.id, max_attempts = task.max_attempts, "task reopened");
    Ok(Json(task))
}

async fn open_issues(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<OpenIssue>>> {
    Ok(Json(state.monitor.open_issues().await?))
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    window_hours: Option<u32>,
}

async fn effectiveness(
    State(state): State<Arc<AppState>>,
    query: Result<Query<WindowQuery>, QueryRejection>,
) -> ApiResult<Json<EffectivenessReport>> {
    let Query(query) = query?;
    let window = query.window_hours.unwrap_or(24).max(1);
    Ok(Json(state.monitor.effectiveness(window).await?))
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let live = state.live_workers.live();
    let (code, status) = if state.workers > 0 && live == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "no_workers")
    } else if live < state.workers {
        (StatusCode::OK, "degraded")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        code,
        Json(serde_json::json!({
            "status": status,
            "version": state.version,
            "workers": state.workers,
            "live_workers": live,
        })),
    )
}
