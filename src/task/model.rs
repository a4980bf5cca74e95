//! 任务数据模型
//!
//! Task 是调度的最小单元：持久化于 TaskStore，由 Dispatcher 认领执行，由 RetryPolicy 处理失败。
//! 时间戳统一为毫秒时间戳（i64）。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 任务 ID
pub type TaskId = String;

/// 列表接口单页上限
pub const MAX_PAGE_SIZE: usize = 100;

/// 列表接口默认页大小
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// 失败摘录的最大字符数
pub const FAILURE_EXCERPT_CHARS: usize = 400;

/// 当前毫秒时间戳
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待认领
    Pending,
    /// 已被某个 worker 认领，尚未开始执行
    Claimed,
    /// 正在执行
    Running,
    /// 等待外部（人工 / 治理）决策
    NeedsDecision,
    /// 已完成（终态）
    Completed,
    /// 失败（终态，除非被外部重新打开）
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Claimed,
        TaskStatus::Running,
        TaskStatus::NeedsDecision,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Running => "running",
            TaskStatus::NeedsDecision => "needs_decision",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// 是否处于被 worker 持有的状态（claimed_by 仅在此时非空）
    pub fn is_held(&self) -> bool {
        matches!(self, TaskStatus::Claimed | TaskStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::NeedsDecision
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown task status '{s}'"))
    }
}

/// 任务类型：决定路由到哪一类执行器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Spec,
    Impl,
    Test,
    Review,
}

impl TaskType {
    pub const ALL: [TaskType; 4] = [TaskType::Spec, TaskType::Impl, TaskType::Test, TaskType::Review];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Spec => "spec",
            TaskType::Impl => "impl",
            TaskType::Test => "test",
            TaskType::Review => "review",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type '{s}'"))
    }
}

/// 失败类别（封闭枚举，每类对应一个建议动作）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    QuotaExceeded,
    PaidProviderBlocked,
    EnvOrSecrets,
    TestOrLintFailure,
    RebaseConflict,
    FlakyOrNetwork,
    /// 执行器超过单次尝试的墙钟超时
    Timeout,
    Generic,
}

impl FailureCategory {
    pub const ALL: [FailureCategory; 8] = [
        FailureCategory::QuotaExceeded,
        FailureCategory::PaidProviderBlocked,
        FailureCategory::EnvOrSecrets,
        FailureCategory::TestOrLintFailure,
        FailureCategory::RebaseConflict,
        FailureCategory::FlakyOrNetwork,
        FailureCategory::Timeout,
        FailureCategory::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::QuotaExceeded => "quota_exceeded",
            FailureCategory::PaidProviderBlocked => "paid_provider_blocked",
            FailureCategory::EnvOrSecrets => "env_or_secrets",
            FailureCategory::TestOrLintFailure => "test_or_lint_failure",
            FailureCategory::RebaseConflict => "rebase_conflict",
            FailureCategory::FlakyOrNetwork => "flaky_or_network",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Generic => "generic",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown failure category '{s}'"))
    }
}

/// 一次失败尝试的结构化反思（只追加，每次失败一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryReflection {
    pub attempt_number: u32,
    pub failure_category: FailureCategory,
    /// 哪个假设失效了
    pub blind_spot: String,
    /// 具体的补救动作
    pub next_action: String,
    pub failure_excerpt: String,
    pub timestamp: i64,
}

/// 任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    /// 工作描述
    pub direction: String,
    /// 调用方附带的上下文（原样透传给执行器）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub status: TaskStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_failure_category: Option<FailureCategory>,
    #[serde(default)]
    pub retry_reflections: Vec<RetryReflection>,
    pub claimed_by: Option<String>,
    /// 重试延迟：此时间之前不可被认领
    #[serde(default)]
    pub next_attempt_at: Option<i64>,
    /// pending 时被外部取消，不再参与认领
    #[serde(default)]
    pub cancelled: bool,
    pub output: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(new: NewTask, max_attempts: u32, now: i64) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            task_type: new.task_type,
            direction: new.direction,
            context: new.context,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_attempts: max_attempts.max(1),
            last_failure_category: None,
            retry_reflections: Vec::new(),
            claimed_by: None,
            next_attempt_at: None,
            cancelled: false,
            output: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 当前是否可被认领
    pub fn is_claimable(&self, now: i64) -> bool {
        self.status == TaskStatus::Pending
            && !self.cancelled
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    pub fn last_reflection(&self) -> Option<&RetryReflection> {
        self.retry_reflections.last()
    }
}

/// 创建任务请求
#[derive(Debug, Clone, Deserialize)]
pub struct NewTask {
    pub task_type: TaskType,
    pub direction: String,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
    /// 未指定时按 task_type / 全局默认值
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl NewTask {
    pub fn new(task_type: TaskType, direction: impl Into<String>) -> Self {
        Self {
            task_type,
            direction: direction.into(),
            context: None,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// 列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TaskFilter {
    /// 实际页大小：默认 50，限制在 1..=100
    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.task_type.map_or(true, |t| task.task_type == t)
    }
}

/// 截取失败文本尾部作为摘录（错误信息通常在末尾）
pub fn failure_excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    let count = trimmed.chars().count();
    if count <= FAILURE_EXCERPT_CHARS {
        return trimmed.to_string();
    }
    let tail: String = trimmed.chars().skip(count - FAILURE_EXCERPT_CHARS).collect();
    format!("...{tail}")
}
