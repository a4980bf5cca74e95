//! HTTP 接口集成测试（tower oneshot，不监听端口）

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use hive::api::{router, AppState};
use hive::core::RetryPolicy;
use hive::dispatcher::{Dispatcher, DispatcherConfig, WorkerGauge};
use hive::executor::{ExecutorGateway, ExecutorRegistry};
use hive::monitor::Monitor;
use hive::notify::ChannelNotifier;
use hive::store::{MemoryTaskStore, TaskStore};
use hive::task::{Decision, FailureCategory, NewTask, RetryReflection, TaskType};

fn app() -> (Router, Arc<dyn TaskStore>) {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    (app_with(Arc::clone(&store), 0, WorkerGauge::new()), store)
}

fn app_with(store: Arc<dyn TaskStore>, workers: usize, live_workers: WorkerGauge) -> Router {
    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        policy: Arc::new(RetryPolicy::default()),
        monitor: Monitor::new(store, Duration::from_secs(600)),
        version: "test".into(),
        workers,
        live_workers,
    });
    router(state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

/// 让任务停在 needs_decision
async fn escalated(store: &Arc<dyn TaskStore>) -> String {
    let task = store.create(NewTask::new(TaskType::Review, "x"), 1).await.unwrap();
    store.claim(&task.id, "w1").await.unwrap();
    store.start(&task.id, "w1").await.unwrap();
    let decision = Decision::Escalate {
        reflection: RetryReflection {
            attempt_number: 1,
            failure_category: FailureCategory::Generic,
            blind_spot: "unknown".into(),
            next_action: "look".into(),
            failure_excerpt: "?".into(),
            timestamp: 0,
        },
    };
    store.record_outcome(&task.id, 1, &decision).await.unwrap();
    task.id
}

#[tokio::test]
async fn test_create_and_fetch_task() {
    let (app, _store) = app();
    let (status, created) = send(
        &app,
        Method::POST,
        "/tasks",
        Some(json!({"direction": "add caching", "task_type": "impl", "context": {"issue": 7}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["status"], "pending");
    assert_eq!(created["attempt_count"], 0);
    assert_eq!(created["max_attempts"], 3);
    assert_eq!(created["context"]["issue"], 7);

    let id = created["id"].as_str().unwrap();
    assert!(id.starts_with("task_"));
    let (status, fetched) = send(&app, Method::GET, &format!("/tasks/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["direction"], "add caching");
}

#[tokio::test]
async fn test_malformed_creation_is_422() {
    let (app, _store) = app();
    let (status, body) = send(&app, Method::POST, "/tasks", Some(json!({"task_type": "impl"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());

    let (status, _) = send(
        &app,
        Method::POST,
        "/tasks",
        Some(json!({"direction": "x", "task_type": "deploy"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        Method::POST,
        "/tasks",
        Some(json!({"direction": "  ", "task_type": "impl"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_unknown_task_is_404() {
    let (app, _store) = app();
    let (status, body) = send(&app, Method::GET, "/tasks/task_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("task_missing"));
}

#[tokio::test]
async fn test_list_filters_and_clamps_limit() {
    let (app, store) = app();
    for n in 0..3 {
        store.create(NewTask::new(TaskType::Impl, format!("i{n}")), 3).await.unwrap();
    }
    store.create(NewTask::new(TaskType::Test, "t"), 3).await.unwrap();

    let (status, page) = send(&app, Method::GET, "/tasks?task_type=impl&limit=500", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["limit"], 100);
    assert_eq!(page["tasks"].as_array().unwrap().len(), 3);

    let (_, page) = send(&app, Method::GET, "/tasks?status=pending&limit=2&offset=1", None).await;
    assert_eq!(page["tasks"].as_array().unwrap().len(), 2);

    let (status, _) = send(&app, Method::GET, "/tasks?status=bogus", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_patch_only_from_needs_decision() {
    let (app, store) = app();
    let pending = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();
    let (status, body) = send(
        &app,
        Method::PATCH,
        &format!("/tasks/{}", pending.id),
        Some(json!({"status": "failed"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let id = escalated(&store).await;
    let (status, _) = send(
        &app,
        Method::PATCH,
        &format!("/tasks/{id}"),
        Some(json!({"status": "completed"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, task) = send(
        &app,
        Method::PATCH,
        &format!("/tasks/{id}"),
        Some(json!({"status": "pending", "output": "approved by reviewer"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "pending");
    assert_eq!(task["max_attempts"], 2);
    assert_eq!(task["output"], "approved by reviewer");
}

#[tokio::test]
async fn test_cancel_and_reopen() {
    let (app, store) = app();
    let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();

    let (status, body) = send(&app, Method::POST, &format!("/tasks/{}/cancel", task.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], true);

    let (status, _) = send(&app, Method::POST, &format!("/tasks/{}/reopen", task.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let id = escalated(&store).await;
    let (status, failed) = send(
        &app,
        Method::PATCH,
        &format!("/tasks/{id}"),
        Some(json!({"status": "failed"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed["status"], "failed");

    let (status, reopened) = send(&app, Method::POST, &format!("/tasks/{id}/reopen"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reopened["status"], "pending");
}

#[tokio::test]
async fn test_monitor_endpoints() {
    let (app, store) = app();
    escalated(&store).await;

    let (status, issues) = send(&app, Method::GET, "/monitor/issues", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issues[0]["kind"], "needs_decision");
    assert_eq!(issues[0]["count"], 1);

    let (status, report) = send(&app, Method::GET, "/effectiveness?window_hours=12", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["window_hours"], 12);
    assert_eq!(report["by_status"]["needs_decision"], 1);
    assert!(report["success_rate"].is_null());
}

#[tokio::test]
async fn test_health_reports_live_workers() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let (notifier, _rx) = ChannelNotifier::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(ExecutorGateway::new(ExecutorRegistry::new(), Duration::from_secs(1))),
        Arc::new(RetryPolicy::default()),
        Arc::new(notifier),
        DispatcherConfig {
            workers: 2,
            ..DispatcherConfig::default()
        },
    ));
    let app = app_with(Arc::clone(&store), 2, dispatcher.gauge());

    let shutdown = CancellationToken::new();
    let handles = dispatcher.spawn(shutdown.clone());
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], "test");
    assert_eq!(body["workers"], 2);
    assert_eq!(body["live_workers"], 2);

    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "no_workers");
    assert_eq!(body["live_workers"], 0);
}

#[tokio::test]
async fn test_health_without_dispatcher_is_ok() {
    let (app, _store) = app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["workers"], 0);
}

#[tokio::test]
async fn test_malformed_query_is_json_422() {
    let (app, _store) = app();
    let (status, body) = send(&app, Method::GET, "/tasks?limit=abc", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());

    let (status, body) = send(&app, Method::GET, "/effectiveness?window_hours=-3", None).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].is_string());
}
