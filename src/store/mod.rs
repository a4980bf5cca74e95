//! 任务存储抽象层
//!
//! 定义统一的任务存储接口，支持内存和 SQLite 两种实现。
//! 存储是唯一的同步点：worker 之间不共享任何内存中的任务状态，
//! 认领是一次原子条件更新，其余变更都在各自的原子区间内调用 `task::state` 的纯转换。

mod memory;
mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::StoreSection;
use crate::core::StoreError;
use crate::task::{Applied, Decision, NewTask, Reclaimed, Resolution, Task, TaskFilter, TaskType};

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

/// 认领结果
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    Claimed(Task),
    /// 已被其他 worker 认领（或已不可认领）
    AlreadyClaimed,
}

/// reaper 回收的单个任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedTask {
    pub id: String,
    pub outcome: Reclaimed,
}

/// 运行中流水线的版本标记，供看门狗判断是否过期
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineMarker {
    /// 当前运行代码的版本标识
    pub version: String,
    pub pid: u32,
    pub started_at: i64,
    /// reaper 每个周期刷新一次
    pub heartbeat_at: i64,
}

/// 重启预算耗尽后写入的唯一致命问题记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FatalIssue {
    pub reason: String,
    pub restart_count: u32,
    pub last_version: Option<String>,
    pub recorded_at: i64,
}

/// 任务存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 创建 pending 任务
    async fn create(&self, new: NewTask, max_attempts: u32) -> Result<Task, StoreError>;

    /// 按 ID 获取任务
    async fn get(&self, id: &str) -> Result<Task, StoreError>;

    /// 按过滤条件分页列出（新任务在前，单页不超过 100 条）
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// 全量快照（监控报表用，只读）
    async fn snapshot(&self) -> Result<Vec<Task>, StoreError>;

    /// 当前可认领的任务，最旧的在前；types 为空表示不限类型
    async fn claimable(&self, types: &[TaskType], limit: usize) -> Result<Vec<Task>, StoreError>;

    /// 原子认领：当且仅当存储中的状态仍为 pending 时成功
    async fn claim(&self, id: &str, worker_id: &str) -> Result<ClaimResult, StoreError>;

    /// claimed -> running，计入一次尝试
    async fn start(&self, id: &str, worker_id: &str) -> Result<Task, StoreError>;

    /// 执行期间刷新 updated_at
    async fn touch(&self, id: &str, worker_id: &str) -> Result<(), StoreError>;

    /// 应用某次尝试的决定；同一尝试重复提交时返回 Duplicate 且不做修改
    async fn record_outcome(
        &self,
        id: &str,
        attempt: u32,
        decision: &Decision,
    ) -> Result<(Applied, Task), StoreError>;

    /// 外部决策：needs_decision -> pending | failed
    async fn resolve(
        &self,
        id: &str,
        resolution: Resolution,
        output: Option<String>,
    ) -> Result<Task, StoreError>;

    /// 外部决策：failed -> pending
    async fn reopen(&self, id: &str) -> Result<Task, StoreError>;

    /// 取消 pending 任务
    async fn cancel(&self, id: &str) -> Result<Task, StoreError>;

    /// 回收 updated_at 早于 cutoff 的 claimed / running 任务
    async fn reclaim_stale(&self, cutoff: i64) -> Result<Vec<ReclaimedTask>, StoreError>;

    /// 将 updated_at 早于 cutoff 的 needs_decision 任务置为 failed
    async fn expire_decisions(&self, cutoff: i64) -> Result<Vec<String>, StoreError>;

    async fn write_marker(&self, marker: &PipelineMarker) -> Result<(), StoreError>;

    async fn read_marker(&self) -> Result<Option<PipelineMarker>, StoreError>;

    /// 刷新标记的 heartbeat_at；标记不存在时为 no-op
    async fn heartbeat_marker(&self, now: i64) -> Result<(), StoreError>;

    /// 写入致命问题（覆盖旧记录，始终只有一条）
    async fn record_fatal(&self, issue: &FatalIssue) -> Result<(), StoreError>;

    async fn fatal_issue(&self) -> Result<Option<FatalIssue>, StoreError>;
}

/// 创建任务存储
///
/// backend = "sqlite" 时打开（必要时创建）数据库文件；"memory" 用于测试和演练。
/// SQLite 打不开时直接返回错误，由看门狗的重启逻辑兜底，不静默退回内存存储。
pub fn create_task_store(config: &StoreSection) -> Result<Arc<dyn TaskStore>, StoreError> {
    match config.backend.as_str() {
        "memory" => {
            tracing::info!("Using in-memory task store");
            Ok(Arc::new(MemoryTaskStore::new()))
        }
        "sqlite" => {
            let store = SqliteTaskStore::open(&config.path)?;
            tracing::info!("Using sqlite task store: {:?}", config.path);
            Ok(Arc::new(store))
        }
        other => Err(StoreError::Corrupt(format!(
            "unknown store backend '{other}', expected 'sqlite' or 'memory'"
        ))),
    }
}
