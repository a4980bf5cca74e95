//! 调度器 / worker 池
//!
//! W 个相互独立的 worker 循环：轮询存储中最旧的可认领任务 → 原子认领 → start →
//! 经执行器网关执行一次尝试（期间定时心跳）→ 重试策略给出决定 → record_outcome。
//! worker 之间不共享任务状态，认领失败（被别人抢先）不是错误，继续看下一个候选即可。
//! 存储出错属于基础设施故障：记录日志后等下一轮，由 reaper 与看门狗兜底。
//! 单次轮询中的 panic 被捕获并记录，worker 继续下一轮；存活 worker 数由 WorkerGauge 暴露给 /health。

pub mod gate;
pub mod reaper;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherSection;
use crate::core::{RetryPolicy, StoreError};
use crate::executor::{panic_message, ExecutorGateway};
use crate::notify::{Notifier, NotifyEvent};
use crate::store::{ClaimResult, TaskStore};
use crate::task::{now_ms, Applied, Decision, Task, TaskType};

pub use gate::{create_gate, AlwaysHealthy, CommandGate, UpstreamGate};
pub use reaper::{write_pipeline_marker, Reaper, SweepReport};

/// 调度器参数
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub workers: usize,
    /// 能力过滤；为空表示全部类型
    pub task_types: Vec<TaskType>,
    pub poll_interval: Duration,
    pub claim_batch: usize,
    pub heartbeat_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        (&DispatcherSection::default()).into()
    }
}

impl From<&DispatcherSection> for DispatcherConfig {
    fn from(section: &DispatcherSection) -> Self {
        Self {
            workers: section.workers.max(1),
            task_types: section.capability_filter(),
            poll_interval: section.poll_interval(),
            claim_batch: section.claim_batch.max(1),
            heartbeat_interval: section.heartbeat_interval(),
        }
    }
}

/// 存活 worker 计数
#[derive(Debug, Clone, Default)]
pub struct WorkerGauge(Arc<AtomicUsize>);

impl WorkerGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> LiveWorker {
        self.0.fetch_add(1, Ordering::SeqCst);
        LiveWorker(self.clone())
    }
}

/// worker 任务结束（含 panic 展开）时计数减一
struct LiveWorker(WorkerGauge);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0 .0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 调度器
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    gateway: Arc<ExecutorGateway>,
    policy: Arc<RetryPolicy>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<dyn UpstreamGate>,
    config: DispatcherConfig,
    gauge: WorkerGauge,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        gateway: Arc<ExecutorGateway>,
        policy: Arc<RetryPolicy>,
        notifier: Arc<dyn Notifier>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            policy,
            notifier,
            gate: Arc::new(AlwaysHealthy),
            config,
            gauge: WorkerGauge::new(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn UpstreamGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn gauge(&self) -> WorkerGauge {
        self.gauge.clone()
    }

    /// 启动全部 worker，返回各自的句柄
    pub fn spawn(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let pid = std::process::id();
        (0..self.config.workers)
            .map(|n| {
                let dispatcher = Arc::clone(self);
                let shutdown = shutdown.clone();
                let worker_id = format!("worker-{pid}-{n}");
                // spawn 返回前即计入，/health 不会在启动瞬间看到 0
                let live = self.gauge.enter();
                tokio::spawn(async move {
                    let _live = live;
                    dispatcher.worker_loop(worker_id, shutdown).await
                })
            })
            .collect()
    }

    /// 立即启动 worker；返回的 future 在 shutdown 被取消且所有 worker 完成当前尝试后结束
    pub fn run(self: Arc<Self>, shutdown: CancellationToken) -> impl Future<Output = ()> {
        tracing::info!(
            workers = self.config.workers,
            task_types = ?self.config.task_types,
            "dispatcher started"
        );
        let handles = self.spawn(shutdown);
        async move {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    tracing::error!("worker panicked: {}", e);
                }
            }
            tracing::info!("dispatcher stopped");
        }
    }

    async fn worker_loop(&self, worker_id: String, shutdown: CancellationToken) {
        tracing::debug!(worker = %worker_id, "worker started");
        while !shutdown.is_cancelled() {
            let ran = match AssertUnwindSafe(self.poll_once(&worker_id)).catch_unwind().await {
                Ok(ran) => ran,
                Err(payload) => {
                    tracing::error!(
                        worker = %worker_id,
                        panic = %panic_message(payload.as_ref()),
                        "poll panicked, worker continues"
                    );
                    false
                }
            };
            if ran {
                continue;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::debug!(worker = %worker_id, "worker stopped");
    }

    /// 单次轮询：认领并执行至多一个任务，返回是否执行了任务
    pub async fn poll_once(&self, worker_id: &str) -> bool {
        if !self.gate.is_healthy().await {
            return false;
        }

        let candidates = match self
            .store
            .claimable(&self.config.task_types, self.config.claim_batch)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(worker = %worker_id, error = %e, "failed to query claimable tasks");
                return false;
            }
        };

        for candidate in candidates {
            match self.store.claim(&candidate.id, worker_id).await {
                Ok(ClaimResult::Claimed(task)) => {
                    if let Err(e) = self.run_claimed(worker_id, task).await {
                        tracing::error!(worker = %worker_id, task_id = %candidate.id, error = %e, "attempt bookkeeping failed");
                    }
                    return true;
                }
                Ok(ClaimResult::AlreadyClaimed) => {
                    tracing::debug!(worker = %worker_id, task_id = %candidate.id, "lost claim race");
                }
                Err(e) => {
                    tracing::warn!(worker = %worker_id, task_id = %candidate.id, error = %e, "claim failed");
                }
            }
        }
        false
    }

    /// 连续轮询直到没有可执行的任务，返回执行的尝试数
    pub async fn drain(&self, worker_id: &str) -> usize {
        let mut attempts = 0;
        while self.poll_once(worker_id).await {
            attempts += 1;
        }
        attempts
    }

    /// 对已认领的任务执行一次完整尝试
    async fn run_claimed(&self, worker_id: &str, claimed: Task) -> Result<Task, StoreError> {
        let running = self.store.start(&claimed.id, worker_id).await?;
        tracing::info!(
            worker = %worker_id,
            task_id = %running.id,
            task_type = %running.task_type,
            attempt = running.attempt_count,
            max_attempts = running.max_attempts,
            "attempt started"
        );

        let outcome = {
            let attempt = self.gateway.run(&running);
            tokio::pin!(attempt);
            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
            heartbeat.tick().await;
            loop {
                tokio::select! {
                    outcome = &mut attempt => break outcome,
                    _ = heartbeat.tick() => {
                        if let Err(e) = self.store.touch(&running.id, worker_id).await {
                            tracing::warn!(worker = %worker_id, task_id = %running.id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        };

        let decision = self.policy.decide(&running, &outcome, now_ms());
        match &decision {
            Decision::Complete { .. } => {}
            Decision::Retry { reflection, delay_ms } => tracing::warn!(
                task_id = %running.id,
                category = %reflection.failure_category,
                delay_ms = *delay_ms,
                "attempt failed, will retry"
            ),
            Decision::Fail { reflection } | Decision::Escalate { reflection } => tracing::warn!(
                task_id = %running.id,
                category = %reflection.failure_category,
                next_action = %reflection.next_action,
                "attempt failed, not retrying"
            ),
        }

        let (applied, task) = self
            .store
            .record_outcome(&running.id, running.attempt_count, &decision)
            .await?;
        match applied {
            Applied::Transitioned(status) => {
                tracing::info!(task_id = %task.id, status = %status, "attempt recorded");
                if let Some(event) = NotifyEvent::for_task(&task) {
                    self.notifier.notify(event).await;
                }
            }
            Applied::Duplicate => {
                tracing::warn!(
                    task_id = %task.id,
                    status = %task.status,
                    "attempt result discarded, task was reclaimed while running"
                );
            }
        }
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RetryConfig;
    use crate::executor::{ExecutorRegistry, ExecutorReport, ScriptedExecutor};
    use crate::notify::ChannelNotifier;
    use crate::store::MemoryTaskStore;
    use crate::task::{FailureCategory, NewTask, TaskStatus};
    use async_trait::async_trait;

    fn setup(
        registry: ExecutorRegistry,
    ) -> (
        Arc<dyn TaskStore>,
        Dispatcher,
        tokio::sync::mpsc::UnboundedReceiver<NotifyEvent>,
    ) {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let (notifier, rx) = ChannelNotifier::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(ExecutorGateway::new(registry, Duration::from_secs(5))),
            Arc::new(RetryPolicy::new(RetryConfig::default())),
            Arc::new(notifier),
            DispatcherConfig::default(),
        );
        (store, dispatcher, rx)
    }

    #[tokio::test]
    async fn test_success_completes_and_notifies() {
        let mut registry = ExecutorRegistry::new();
        registry.register(TaskType::Impl, ScriptedExecutor::new("impl"));
        let (store, dispatcher, mut rx) = setup(registry);
        let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();

        assert_eq!(dispatcher.drain("w1").await, 1);
        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 1);
        assert!(matches!(rx.try_recv().unwrap(), NotifyEvent::TaskCompleted { .. }));
    }

    #[tokio::test]
    async fn test_missing_executor_fails_as_env() {
        let (store, dispatcher, _rx) = setup(ExecutorRegistry::new());
        let task = store.create(NewTask::new(TaskType::Review, "x"), 3).await.unwrap();

        dispatcher.drain("w1").await;
        let task = store.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.last_failure_category, Some(FailureCategory::EnvOrSecrets));
    }

    #[tokio::test]
    async fn test_capability_filter_skips_other_types() {
        let mut registry = ExecutorRegistry::new();
        registry.register(TaskType::Test, ScriptedExecutor::new("test"));
        let (store, mut dispatcher, _rx) = setup(registry);
        dispatcher.config.task_types = vec![TaskType::Test];
        let spec = store.create(NewTask::new(TaskType::Spec, "x"), 3).await.unwrap();

        assert_eq!(dispatcher.drain("w1").await, 0);
        assert_eq!(store.get(&spec.id).await.unwrap().status, TaskStatus::Pending);
    }

    struct ClosedGate;

    #[async_trait]
    impl UpstreamGate for ClosedGate {
        async fn is_healthy(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_unhealthy_upstream_holds_claims() {
        let mut registry = ExecutorRegistry::new();
        registry.register(TaskType::Impl, ScriptedExecutor::new("impl"));
        let (store, dispatcher, _rx) = setup(registry);
        let dispatcher = dispatcher.with_gate(Arc::new(ClosedGate));
        let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();

        assert!(!dispatcher.poll_once("w1").await);
        assert_eq!(store.get(&task.id).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_running_task() {
        let mut registry = ExecutorRegistry::new();
        registry.register(
            TaskType::Impl,
            ScriptedExecutor::new("slow").with_delay(Duration::from_millis(120)),
        );
        let (store, mut dispatcher, _rx) = setup(registry);
        dispatcher.config.heartbeat_interval = Duration::from_millis(20);
        let dispatcher = Arc::new(dispatcher);
        let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();

        let worker = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.poll_once("w1").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let first = store.get(&task.id).await.unwrap();
        assert_eq!(first.status, TaskStatus::Running);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let later = store.get(&task.id).await.unwrap();
        assert!(later.updated_at >= first.updated_at);

        assert!(worker.await.unwrap());
        assert_eq!(store.get(&task.id).await.unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let mut registry = ExecutorRegistry::new();
        registry.register(
            TaskType::Impl,
            ScriptedExecutor::new("impl").then(ExecutorReport::success("done")),
        );
        let (store, dispatcher, _rx) = setup(registry);
        let dispatcher = Arc::new(dispatcher);
        let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();

        let shutdown = CancellationToken::new();
        let run = tokio::spawn(Arc::clone(&dispatcher).run(shutdown.clone()));
        for _ in 0..50 {
            if store.get(&task.id).await.unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get(&task.id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(dispatcher.gauge().live(), 0);
    }

    #[tokio::test]
    async fn test_gauge_counts_spawned_workers() {
        let (_store, mut dispatcher, _rx) = setup(ExecutorRegistry::new());
        dispatcher.config.workers = 3;
        let dispatcher = Arc::new(dispatcher);
        let shutdown = CancellationToken::new();

        let handles = dispatcher.spawn(shutdown.clone());
        assert_eq!(dispatcher.gauge().live(), 3);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(dispatcher.gauge().live(), 0);
    }

    /// 前几次健康检查直接 panic 的上游闸门
    struct FlakyGate {
        panics_left: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamGate for FlakyGate {
        async fn is_healthy(&self) -> bool {
            if self
                .panics_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                panic!("gate check blew up");
            }
            true
        }
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_poll() {
        let mut registry = ExecutorRegistry::new();
        registry.register(TaskType::Impl, ScriptedExecutor::new("impl"));
        let (store, mut dispatcher, _rx) = setup(registry);
        dispatcher.config.workers = 1;
        dispatcher.config.poll_interval = Duration::from_millis(5);
        let dispatcher = Arc::new(dispatcher.with_gate(Arc::new(FlakyGate {
            panics_left: AtomicUsize::new(2),
        })));
        let task = store.create(NewTask::new(TaskType::Impl, "x"), 3).await.unwrap();

        let shutdown = CancellationToken::new();
        let handles = dispatcher.spawn(shutdown.clone());
        for _ in 0..100 {
            if store.get(&task.id).await.unwrap().status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.get(&task.id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(dispatcher.gauge().live(), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
