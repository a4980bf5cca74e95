//! 执行器网关
//!
//! 执行器实现 Executor trait（launch），由 ExecutorRegistry 按 task_type 注册；
//! ExecutorGateway 每次调用只做一次尝试：施加墙钟超时，归一化为 Outcome，并输出结构化审计日志（JSON）。
//! 网关从不重试，原始失败文本原样上交给重试策略分类。
//! 执行器 panic 在网关内被捕获，按一次失败尝试处理，不会带走 worker。

pub mod command;
pub mod scripted;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::time::timeout;

use crate::task::{Task, TaskType};

pub use command::CommandExecutor;
pub use scripted::ScriptedExecutor;

/// 执行器自身上报的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorReport {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

impl ExecutorReport {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }
}

/// 执行器 trait：对一个已认领的任务执行一次
///
/// 返回 Err 表示执行器本身不可达（进程无法启动等），网关将其视为一次失败尝试。
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    async fn launch(&self, task: &Task) -> anyhow::Result<ExecutorReport>;
}

/// 归一化的单次尝试结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration_ms: u64,
    /// 超过墙钟超时被终止
    pub timed_out: bool,
}

impl Outcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            duration_ms: 0,
            timed_out: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms: 0,
            timed_out: false,
        }
    }

    pub fn timed_out(limit: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(format!("executor timed out after {}s", limit.as_secs())),
            duration_ms: limit.as_millis() as u64,
            timed_out: true,
        }
    }

    fn from_report(report: ExecutorReport, duration: Duration) -> Self {
        Self {
            success: report.success,
            output: report.output,
            error: report.error,
            duration_ms: duration.as_millis() as u64,
            timed_out: false,
        }
    }

    /// 成功却同时带有错误：结果不可信
    pub fn is_ambiguous(&self) -> bool {
        self.success && self.error.as_deref().is_some_and(|e| !e.trim().is_empty())
    }

    /// 供分类的失败文本：优先 error，其次 output
    pub fn failure_text(&self) -> String {
        match self.error.as_deref().map(str::trim) {
            Some(e) if !e.is_empty() => e.to_string(),
            _ if !self.output.trim().is_empty() => self.output.trim().to_string(),
            _ => "executor failed without any error output".to_string(),
        }
    }
}

/// 执行器注册表：按 task_type 存储 Arc<dyn Executor>
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<TaskType, Arc<dyn Executor>>,
    timeouts: HashMap<TaskType, Duration>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task_type: TaskType, executor: impl Executor + 'static) {
        self.executors.insert(task_type, Arc::new(executor));
    }

    pub fn register_arc(&mut self, task_type: TaskType, executor: Arc<dyn Executor>) {
        self.executors.insert(task_type, executor);
    }

    /// 为某类任务单独设置超时（覆盖网关默认值）
    pub fn set_timeout(&mut self, task_type: TaskType, limit: Duration) {
        self.timeouts.insert(task_type, limit);
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn Executor>> {
        self.executors.get(&task_type).cloned()
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<_> = self.executors.keys().copied().collect();
        types.sort();
        types
    }
}

/// 执行器网关：单次尝试 + 超时 + 审计
pub struct ExecutorGateway {
    registry: ExecutorRegistry,
    default_timeout: Duration,
}

impl ExecutorGateway {
    pub fn new(registry: ExecutorRegistry, default_timeout: Duration) -> Self {
        Self {
            registry,
            default_timeout,
        }
    }

    pub fn timeout_for(&self, task_type: TaskType) -> Duration {
        self.registry
            .timeouts
            .get(&task_type)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// 对任务执行恰好一次尝试
    pub async fn run(&self, task: &Task) -> Outcome {
        let Some(executor) = self.registry.get(task.task_type) else {
            tracing::warn!(task_id = %task.id, task_type = %task.task_type, "no executor registered");
            return Outcome::failed(format!(
                "no executor registered for task type {}",
                task.task_type
            ));
        };

        let limit = self.timeout_for(task.task_type);
        let start = Instant::now();
        let launch = AssertUnwindSafe(executor.launch(task)).catch_unwind();
        let result = timeout(limit, launch).await;
        let elapsed = start.elapsed();

        let outcome = match result {
            Ok(Ok(Ok(report))) => Outcome::from_report(report, elapsed),
            Ok(Ok(Err(e))) => {
                let mut outcome = Outcome::failed(format!("executor unreachable: {e:#}"));
                outcome.duration_ms = elapsed.as_millis() as u64;
                outcome
            }
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task_id = %task.id, executor = executor.name(), panic = %message, "executor panicked");
                let mut outcome = Outcome::failed(format!("executor panicked: {message}"));
                outcome.duration_ms = elapsed.as_millis() as u64;
                outcome
            }
            Err(_) => Outcome::timed_out(limit),
        };

        let verdict = if outcome.timed_out {
            "timeout"
        } else if outcome.success {
            "ok"
        } else {
            "error"
        };
        let audit = serde_json::json!({
            "event": "executor_audit",
            "executor": executor.name(),
            "task_id": task.id,
            "task_type": task.task_type.as_str(),
            "attempt": task.attempt_count,
            "ok": outcome.success,
            "outcome": verdict,
            "duration_ms": outcome.duration_ms,
        });
        tracing::info!(audit = %audit.to_string(), "executor");

        outcome
    }
}

/// 取出 panic 载荷中的文本
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
