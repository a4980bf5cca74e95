//! 任务生命周期集成测试：调度器 + 重试策略 + 存储 + reaper

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use hive::core::{RetryConfig, RetryPolicy};
use hive::dispatcher::{Dispatcher, DispatcherConfig, Reaper};
use hive::executor::{Executor, ExecutorGateway, ExecutorRegistry, ExecutorReport, ScriptedExecutor};
use hive::notify::{ChannelNotifier, NotifyEvent};
use hive::store::{ClaimResult, MemoryTaskStore, SqliteTaskStore, TaskStore};
use hive::task::{Applied, Decision, FailureCategory, NewTask, Task, TaskStatus, TaskType};
use hive::config::ReaperSection;

fn no_delay_policy() -> Arc<RetryPolicy> {
    Arc::new(RetryPolicy::new(RetryConfig {
        base_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        generic_delay: Duration::ZERO,
        ..RetryConfig::default()
    }))
}

fn dispatcher_with(
    store: Arc<dyn TaskStore>,
    executor: ScriptedExecutor,
) -> (Arc<Dispatcher>, tokio::sync::mpsc::UnboundedReceiver<NotifyEvent>) {
    let mut registry = ExecutorRegistry::new();
    registry.register(TaskType::Impl, executor);
    let (notifier, rx) = ChannelNotifier::new();
    let dispatcher = Dispatcher::new(
        store,
        Arc::new(ExecutorGateway::new(registry, Duration::from_secs(5))),
        no_delay_policy(),
        Arc::new(notifier),
        DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            ..DispatcherConfig::default()
        },
    );
    (Arc::new(dispatcher), rx)
}

#[tokio::test]
async fn test_flaky_failures_exhaust_budget_then_fail() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let executor = ScriptedExecutor::new("impl")
        .with_fallback(ExecutorReport::failure("connection reset by peer"));
    let (dispatcher, mut rx) = dispatcher_with(Arc::clone(&store), executor);
    let task = store.create(NewTask::new(TaskType::Impl, "flaky"), 2).await.unwrap();

    assert_eq!(dispatcher.drain("w1").await, 2);

    let task = store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 2);
    assert_eq!(task.retry_reflections.len(), 2);
    assert_eq!(task.last_failure_category, Some(FailureCategory::FlakyOrNetwork));
    assert!(matches!(rx.try_recv().unwrap(), NotifyEvent::TaskFailed { .. }));
}

#[tokio::test]
async fn test_first_attempt_success() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let (dispatcher, _rx) = dispatcher_with(
        Arc::clone(&store),
        ScriptedExecutor::new("impl").then(ExecutorReport::success("built")),
    );
    let task = store.create(NewTask::new(TaskType::Impl, "ok"), 3).await.unwrap();

    dispatcher.drain("w1").await;

    let task = store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt_count, 1);
    assert!(task.retry_reflections.is_empty());
    assert_eq!(task.output.as_deref(), Some("built"));
}

#[tokio::test]
async fn test_env_failure_is_terminal_immediately() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let (dispatcher, _rx) = dispatcher_with(
        Arc::clone(&store),
        ScriptedExecutor::new("impl")
            .with_fallback(ExecutorReport::failure("OPENAI_API_KEY: api key missing")),
    );
    let task = store.create(NewTask::new(TaskType::Impl, "env"), 5).await.unwrap();

    assert_eq!(dispatcher.drain("w1").await, 1);

    let task = store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempt_count, 1);
    assert_eq!(task.last_failure_category, Some(FailureCategory::EnvOrSecrets));
}

#[tokio::test]
async fn test_racing_workers_run_task_once() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let executor = Arc::new(
        ScriptedExecutor::new("impl").with_delay(Duration::from_millis(20)),
    );
    let mut registry = ExecutorRegistry::new();
    registry.register_arc(TaskType::Impl, executor.clone());
    let (notifier, _rx) = ChannelNotifier::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(ExecutorGateway::new(registry, Duration::from_secs(5))),
        no_delay_policy(),
        Arc::new(notifier),
        DispatcherConfig::default(),
    ));
    let task = store.create(NewTask::new(TaskType::Impl, "race"), 3).await.unwrap();

    let (a, b) = tokio::join!(dispatcher.poll_once("w1"), dispatcher.poll_once("w2"));
    assert!(a ^ b, "exactly one worker should have run the task");
    assert_eq!(executor.launches(), 1);
    assert!(!dispatcher.poll_once("w2").await);

    let task = store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempt_count, 1);
}

#[tokio::test]
async fn test_concurrent_claims_on_sqlite_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TaskStore> =
        Arc::new(SqliteTaskStore::open(dir.path().join("hive.db")).unwrap());
    let task = store.create(NewTask::new(TaskType::Test, "race"), 3).await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let store = Arc::clone(&store);
            let id = task.id.clone();
            tokio::spawn(async move { store.claim(&id, &format!("w{n}")).await.unwrap() })
        })
        .collect();
    let mut claimed = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), ClaimResult::Claimed(_)) {
            claimed += 1;
        }
    }
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn test_replayed_outcome_is_ignored() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();
    store.claim(&task.id, "w1").await.unwrap();
    store.start(&task.id, "w1").await.unwrap();

    let complete = Decision::Complete {
        output: "done".into(),
    };
    let (first, after_first) = store.record_outcome(&task.id, 1, &complete).await.unwrap();
    assert_eq!(first, Applied::Transitioned(TaskStatus::Completed));

    let (second, after_second) = store.record_outcome(&task.id, 1, &complete).await.unwrap();
    assert_eq!(second, Applied::Duplicate);
    assert_eq!(after_first, after_second);
}

/// 看门狗重启后，旧进程留下的 claimed / running 任务由 reaper 放回 pending
#[tokio::test]
async fn test_restart_leaves_tasks_for_reaper() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hive.db");
    let mut ids = Vec::new();
    {
        // 旧进程：三个任务执行到一半时被杀
        let store = SqliteTaskStore::open(&path).unwrap();
        for n in 0..3 {
            let task = store.create(NewTask::new(TaskType::Impl, format!("t{n}")), 3).await.unwrap();
            store.claim(&task.id, "old-worker").await.unwrap();
            if n > 0 {
                store.start(&task.id, "old-worker").await.unwrap();
            }
            ids.push(task.id);
        }
    }

    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open(&path).unwrap());
    let (notifier, _rx) = ChannelNotifier::new();

    // 未超过回收超时：保持原状
    let patient = Reaper::new(
        Arc::clone(&store),
        Arc::new(notifier.clone()),
        &ReaperSection {
            interval_secs: 60,
            stale_after_secs: 600,
            needs_decision_ttl_secs: 0,
        },
    );
    assert!(patient.sweep().await.unwrap().requeued.is_empty());

    tokio::time::sleep(Duration::from_millis(5)).await;
    let eager = Reaper::new(
        Arc::clone(&store),
        Arc::new(notifier),
        &ReaperSection {
            interval_secs: 60,
            stale_after_secs: 0,
            needs_decision_ttl_secs: 0,
        },
    );
    let report = eager.sweep().await.unwrap();
    assert_eq!(report.requeued.len(), 3);
    for id in &ids {
        let task = store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.claimed_by, None);
    }
}

#[tokio::test]
async fn test_attempts_and_reflections_stay_consistent() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let executor = ScriptedExecutor::new("impl")
        .then(ExecutorReport::failure("error: 2 tests failed"))
        .then(ExecutorReport::failure("connection refused"))
        .then(ExecutorReport::failure("something odd happened"))
        .with_fallback(ExecutorReport::failure("something odd happened"));
    let (dispatcher, _rx) = dispatcher_with(Arc::clone(&store), executor);
    let task = store.create(NewTask::new(TaskType::Impl, "mixed"), 3).await.unwrap();

    dispatcher.drain("w1").await;

    let task = store.get(&task.id).await.unwrap();
    assert!(task.status.is_terminal());
    assert!(task.attempt_count <= task.max_attempts + 1);
    assert!(!task.retry_reflections.is_empty());
    assert_eq!(
        task.last_reflection().map(|r| r.failure_category),
        task.last_failure_category
    );
    let numbers: Vec<u32> = task.retry_reflections.iter().map(|r| r.attempt_number).collect();
    assert_eq!(numbers, (1..=task.attempt_count).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_needs_decision_resolved_to_pending_runs_again() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let executor = ScriptedExecutor::new("impl")
        .then(ExecutorReport {
            success: true,
            output: "maybe".into(),
            error: Some("warning: partial result".into()),
        })
        .then(ExecutorReport::success("done"));
    let (dispatcher, mut rx) = dispatcher_with(Arc::clone(&store), executor);
    let task = store.create(NewTask::new(TaskType::Impl, "x"), 1).await.unwrap();

    dispatcher.drain("w1").await;
    let held = store.get(&task.id).await.unwrap();
    assert_eq!(held.status, TaskStatus::NeedsDecision);
    assert_eq!(held.last_failure_category, Some(FailureCategory::Generic));
    assert!(matches!(rx.try_recv().unwrap(), NotifyEvent::TaskNeedsDecision { .. }));

    let resumed = store
        .resolve(&task.id, hive::task::Resolution::Pending, None)
        .await
        .unwrap();
    assert_eq!(resumed.max_attempts, 2);

    dispatcher.drain("w1").await;
    let done = store.get(&task.id).await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.attempt_count, 2);
}

#[tokio::test]
async fn test_cancelled_task_is_never_claimed() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let (dispatcher, _rx) = dispatcher_with(Arc::clone(&store), ScriptedExecutor::new("impl"));
    let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();
    store.cancel(&task.id).await.unwrap();

    assert_eq!(dispatcher.drain("w1").await, 0);
    let task = store.get(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.cancelled);
}

/// 遇到 "poison" 就 panic 的执行器
struct PanickyExecutor;

#[async_trait]
impl Executor for PanickyExecutor {
    fn name(&self) -> &str {
        "panicky"
    }

    async fn launch(&self, task: &Task) -> anyhow::Result<ExecutorReport> {
        if task.direction == "poison" {
            panic!("executor choked on {}", task.direction);
        }
        Ok(ExecutorReport::success(format!("ran {}", task.direction)))
    }
}

#[tokio::test]
async fn test_executor_panic_fails_attempt_and_worker_keeps_going() {
    let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
    let mut registry = ExecutorRegistry::new();
    registry.register(TaskType::Impl, PanickyExecutor);
    let (notifier, _rx) = ChannelNotifier::new();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(ExecutorGateway::new(registry, Duration::from_secs(5))),
        no_delay_policy(),
        Arc::new(notifier),
        DispatcherConfig {
            workers: 1,
            poll_interval: Duration::from_millis(10),
            ..DispatcherConfig::default()
        },
    ));
    let poison = store.create(NewTask::new(TaskType::Impl, "poison"), 1).await.unwrap();

    let shutdown = CancellationToken::new();
    let handles = dispatcher.spawn(shutdown.clone());

    let mut settled = store.get(&poison.id).await.unwrap();
    for _ in 0..200 {
        if settled.attempt_count > 0 && settled.status != TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        settled = store.get(&poison.id).await.unwrap();
    }
    assert_ne!(settled.status, TaskStatus::Running);
    assert_eq!(settled.retry_reflections.len(), settled.attempt_count as usize);
    assert!(settled
        .last_reflection()
        .is_some_and(|r| r.failure_excerpt.contains("executor panicked")));

    // 唯一的 worker 仍然存活，后续任务照常执行
    assert_eq!(dispatcher.gauge().live(), 1);
    let good = store.create(NewTask::new(TaskType::Impl, "good"), 3).await.unwrap();
    let mut done = store.get(&good.id).await.unwrap();
    for _ in 0..200 {
        if done.status == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        done = store.get(&good.id).await.unwrap();
    }
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.output.as_deref(), Some("ran good"));

    shutdown.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
    assert_eq!(dispatcher.gauge().live(), 0);
}
