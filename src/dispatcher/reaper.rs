//! Reaper：回收失联 worker 持有的任务
//!
//! 崩溃的 worker 会把任务永久留在 claimed / running；reaper 周期性地把
//! updated_at 超过 stale_after 的任务放回 pending（宽限尝试已用尽的直接 failed），
//! 同时让超期的 needs_decision 失败，并刷新流水线标记的心跳。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ReaperSection;
use crate::core::StoreError;
use crate::notify::{Notifier, NotifyEvent};
use crate::store::{PipelineMarker, TaskStore};
use crate::task::{now_ms, Reclaimed};

/// 单次清扫的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: Vec<String>,
    pub abandoned: Vec<String>,
    pub expired: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.abandoned.is_empty() && self.expired.is_empty()
    }
}

pub struct Reaper {
    store: Arc<dyn TaskStore>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    stale_after: Duration,
    /// None 表示 needs_decision 永不过期
    decision_ttl: Option<Duration>,
}

impl Reaper {
    pub fn new(store: Arc<dyn TaskStore>, notifier: Arc<dyn Notifier>, config: &ReaperSection) -> Self {
        Self {
            store,
            notifier,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            stale_after: Duration::from_secs(config.stale_after_secs),
            decision_ttl: (config.needs_decision_ttl_secs > 0)
                .then(|| Duration::from_secs(config.needs_decision_ttl_secs)),
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// 执行一次清扫
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = now_ms();
        let mut report = SweepReport::default();

        let cutoff = now - self.stale_after.as_millis() as i64;
        for reclaimed in self.store.reclaim_stale(cutoff).await? {
            match reclaimed.outcome {
                Reclaimed::Requeued => {
                    tracing::warn!(task_id = %reclaimed.id, "reclaimed stale task");
                    report.requeued.push(reclaimed.id);
                }
                Reclaimed::Abandoned => {
                    tracing::warn!(task_id = %reclaimed.id, "stale task abandoned after grace attempt");
                    report.abandoned.push(reclaimed.id);
                }
            }
        }

        if let Some(ttl) = self.decision_ttl {
            let cutoff = now - ttl.as_millis() as i64;
            report.expired = self.store.expire_decisions(cutoff).await?;
            for id in &report.expired {
                tracing::warn!(task_id = %id, "needs_decision expired");
            }
        }

        for id in report.abandoned.iter().chain(report.expired.iter()) {
            match self.store.get(id).await {
                Ok(task) => {
                    if let Some(event) = NotifyEvent::for_task(&task) {
                        self.notifier.notify(event).await;
                    }
                }
                Err(e) => tracing::warn!(task_id = %id, error = %e, "failed to load reaped task"),
            }
        }

        self.store.heartbeat_marker(now_ms()).await?;
        Ok(report)
    }

    /// 启动时立即清扫一次，之后每 interval 一次，直到 shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) if !report.is_empty() => tracing::info!(
                            requeued = report.requeued.len(),
                            abandoned = report.abandoned.len(),
                            expired = report.expired.len(),
                            "reaper sweep"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "reaper sweep failed"),
                    }
                }
            }
        }
        tracing::debug!("reaper stopped");
    }
}

/// 启动时写入流水线标记（版本 + 进程号 + 启动时间）
pub async fn write_pipeline_marker(
    store: &dyn TaskStore,
    version: &str,
) -> Result<PipelineMarker, StoreError> {
    let now = now_ms();
    let marker = PipelineMarker {
        version: version.to_string(),
        pid: std::process::id(),
        started_at: now,
        heartbeat_at: now,
    };
    store.write_marker(&marker).await?;
    tracing::info!(version = %marker.version, pid = marker.pid, "pipeline marker written");
    Ok(marker)
}
