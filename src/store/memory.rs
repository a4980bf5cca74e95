//! 内存任务存储
//!
//! 单个 RwLock 写锁即原子区间，适合测试与 `store.backend = "memory"` 的演练运行。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ClaimResult, FatalIssue, PipelineMarker, ReclaimedTask, TaskStore};
use crate::core::StoreError;
use crate::task::{
    now_ms, Applied, Decision, NewTask, Resolution, Task, TaskFilter, TaskId, TaskStatus, TaskType,
};

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// 插入顺序
    order: Vec<TaskId>,
    marker: Option<PipelineMarker>,
    fatal: Option<FatalIssue>,
}

impl Inner {
    fn task_mut(&mut self, id: &str) -> Result<&mut Task, StoreError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn ordered(&self) -> impl DoubleEndedIterator<Item = &Task> + '_ {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }
}

/// 内存任务存储
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在写锁内对单个任务执行一次变更
    async fn mutate<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Task) -> Result<R, StoreError>,
    ) -> Result<(R, Task), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        // 在副本上转换，失败时不留下半成品
        let mut draft = task.clone();
        let result = f(&mut draft)?;
        *task = draft.clone();
        Ok((result, draft))
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, new: NewTask, max_attempts: u32) -> Result<Task, StoreError> {
        let task = Task::new(new, max_attempts, now_ms());
        let mut inner = self.inner.write().await;
        inner.order.push(task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get(&self, id: &str) -> Result<Task, StoreError> {
        self.inner
            .read()
            .await
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .ordered()
            .rev()
            .filter(|t| filter.matches(t))
            .skip(filter.offset)
            .take(filter.page_size())
            .cloned()
            .collect())
    }

    async fn snapshot(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.inner.read().await.ordered().cloned().collect())
    }

    async fn claimable(&self, types: &[TaskType], limit: usize) -> Result<Vec<Task>, StoreError> {
        let now = now_ms();
        let inner = self.inner.read().await;
        let mut candidates: Vec<&Task> = inner
            .ordered()
            .filter(|t| t.is_claimable(now))
            .filter(|t| types.is_empty() || types.contains(&t.task_type))
            .collect();
        // created_at 相同时保持插入顺序
        candidates.sort_by_key(|t| t.created_at);
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    async fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimResult, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.write().await;
        let task = inner.task_mut(id)?;
        if !task.is_claimable(now) {
            return Ok(ClaimResult::AlreadyClaimed);
        }
        task.claim(worker_id, now)?;
        Ok(ClaimResult::Claimed(task.clone()))
    }

    async fn start(&self, id: &str, worker_id: &str) -> Result<Task, StoreError> {
        let (_, task) = self
            .mutate(id, |t| Ok(t.start(worker_id, now_ms())?))
            .await?;
        Ok(task)
    }

    async fn touch(&self, id: &str, worker_id: &str) -> Result<(), StoreError> {
        self.mutate(id, |t| Ok(t.touch(worker_id, now_ms())?)).await?;
        Ok(())
    }

    async fn record_outcome(
        &self,
        id: &str,
        attempt: u32,
        decision: &Decision,
    ) -> Result<(Applied, Task), StoreError> {
        self.mutate(id, |t| Ok(t.apply_decision(attempt, decision, now_ms())))
            .await
    }

    async fn resolve(
        &self,
        id: &str,
        resolution: Resolution,
        output: Option<String>,
    ) -> Result<Task, StoreError> {
        let (_, task) = self
            .mutate(id, |t| Ok(t.resolve(resolution, output, now_ms())?))
            .await?;
        Ok(task)
    }

    async fn reopen(&self, id: &str) -> Result<Task, StoreError> {
        let (_, task) = self.mutate(id, |t| Ok(t.reopen(now_ms())?)).await?;
        Ok(task)
    }

    async fn cancel(&self, id: &str) -> Result<Task, StoreError> {
        let (_, task) = self.mutate(id, |t| Ok(t.cancel(now_ms())?)).await?;
        Ok(task)
    }

    async fn reclaim_stale(&self, cutoff: i64) -> Result<Vec<ReclaimedTask>, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.write().await;
        let mut reclaimed = Vec::new();
        for task in inner.tasks.values_mut() {
            if task.status.is_held() && task.updated_at < cutoff {
                let outcome = task.reclaim(now)?;
                reclaimed.push(ReclaimedTask {
                    id: task.id.clone(),
                    outcome,
                });
            }
        }
        Ok(reclaimed)
    }

    async fn expire_decisions(&self, cutoff: i64) -> Result<Vec<String>, StoreError> {
        let now = now_ms();
        let mut inner = self.inner.write().await;
        let mut expired = Vec::new();
        for task in inner.tasks.values_mut() {
            if task.status == TaskStatus::NeedsDecision && task.updated_at < cutoff {
                task.expire_decision(now)?;
                expired.push(task.id.clone());
            }
        }
        Ok(expired)
    }

    async fn write_marker(&self, marker: &PipelineMarker) -> Result<(), StoreError> {
        self.inner.write().await.marker = Some(marker.clone());
        Ok(())
    }

    async fn read_marker(&self) -> Result<Option<PipelineMarker>, StoreError> {
        Ok(self.inner.read().await.marker.clone())
    }

    async fn heartbeat_marker(&self, now: i64) -> Result<(), StoreError> {
        if let Some(marker) = self.inner.write().await.marker.as_mut() {
            marker.heartbeat_at = now;
        }
        Ok(())
    }

    async fn record_fatal(&self, issue: &FatalIssue) -> Result<(), StoreError> {
        self.inner.write().await.fatal = Some(issue.clone());
        Ok(())
    }

    async fn fatal_issue(&self) -> Result<Option<FatalIssue>, StoreError> {
        Ok(self.inner.read().await.fatal.clone())
    }
}
