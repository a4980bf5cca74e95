//! 脚本化执行器（用于测试与演练，不启动任何外部进程）
//!
//! 按顺序返回预置的结果；队列耗尽后返回 fallback。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::executor::{Executor, ExecutorReport};
use crate::task::Task;

/// 脚本化执行器
pub struct ScriptedExecutor {
    name: String,
    script: Mutex<VecDeque<ExecutorReport>>,
    fallback: ExecutorReport,
    delay: Duration,
    launches: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: ExecutorReport::success("ok"),
            delay: Duration::ZERO,
            launches: AtomicUsize::new(0),
        }
    }

    /// 追加一个预置结果
    pub fn then(self, report: ExecutorReport) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(report);
        self
    }

    pub fn with_fallback(mut self, report: ExecutorReport) -> Self {
        self.fallback = report;
        self
    }

    /// 每次执行前等待（模拟耗时执行）
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn launch(&self, _task: &Task) -> anyhow::Result<ExecutorReport> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}
