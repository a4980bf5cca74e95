//! 看门狗（Supervisor）
//!
//! 在流水线进程之外独立运行，检测它自己察觉不到的故障：
//! - 进程已退出，或对 /health 探测连续无响应
//! - 运行中的版本落后于已部署版本（新版本已部署但旧进程仍在服务）
//! - 流水线标记的心跳长期未刷新（事件循环卡死）
//!
//! 任一信号出现即终止整个进程组并重新启动。重启次数有上限，超过后写入唯一一条
//! FatalIssue 并退出，不再继续重启。所有可变状态集中在 SupervisorState 中，并持久化为 JSON。

pub mod probe;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorSection;
use crate::core::StoreError;
use crate::notify::{Notifier, NotifyEvent};
use crate::store::{FatalIssue, TaskStore};
use crate::task::now_ms;

pub use probe::HttpHealthProbe;
pub use process::{ChildHandle, ProcessLauncher};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("restart budget exhausted: {0}")]
    Fatal(String),
}

/// 健康探测
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// 正在运行的流水线进程
#[async_trait]
pub trait PipelineHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// 进程是否已退出
    fn has_exited(&mut self) -> bool;

    /// 终止整个进程组：先温和停止，grace 后强杀
    async fn terminate(&mut self, grace: Duration) -> anyhow::Result<()>;
}

/// 启动流水线
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    async fn launch(&self) -> anyhow::Result<Box<dyn PipelineHandle>>;
}

/// 看门狗状态（跨看门狗自身重启保留）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorState {
    pub restart_count: u32,
    pub last_known_version: Option<String>,
    pub last_restart_at: Option<i64>,
    pub last_restart_reason: Option<String>,
    pub consecutive_probe_failures: u32,
    /// 本轮连续健康的起点
    pub healthy_since: Option<i64>,
    pub fatal: bool,
}

impl SupervisorState {
    /// 读取状态文件；不存在时返回默认状态
    pub fn load(path: &Path) -> Result<Self, SupervisorError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// 先写临时文件再 rename，避免写到一半崩溃留下损坏的状态
    pub fn save(&self, path: &Path) -> Result<(), SupervisorError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// 需要重启的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    NotRunning,
    ProcessExited,
    Unresponsive { failures: u32 },
    StaleVersion { running: String, deployed: String },
    Stuck { heartbeat_age_ms: i64 },
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::NotRunning => "not_running",
            RestartReason::ProcessExited => "process_exited",
            RestartReason::Unresponsive { .. } => "unresponsive",
            RestartReason::StaleVersion { .. } => "stale_version",
            RestartReason::Stuck { .. } => "stuck",
        }
    }
}

/// 单次检查的结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// 启动宽限期内，不做判定
    Starting,
    Restart(RestartReason),
}

/// 单次 tick 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    Starting,
    Restarted(RestartReason),
}

/// 看门狗参数
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probe_interval: Duration,
    pub max_probe_failures: u32,
    pub startup_grace: Duration,
    pub heartbeat_stale: Duration,
    pub version_file: Option<PathBuf>,
    pub max_restarts: u32,
    pub healthy_reset: Duration,
    pub stop_grace: Duration,
    /// None 表示不持久化（测试）
    pub state_file: Option<PathBuf>,
}

impl From<&SupervisorSection> for SupervisorConfig {
    fn from(section: &SupervisorSection) -> Self {
        Self {
            probe_interval: Duration::from_secs(section.probe_interval_secs.max(1)),
            max_probe_failures: section.max_probe_failures.max(1),
            startup_grace: Duration::from_secs(section.startup_grace_secs),
            heartbeat_stale: Duration::from_secs(section.heartbeat_stale_secs),
            version_file: section.version_file.clone(),
            max_restarts: section.max_restarts,
            healthy_reset: Duration::from_secs(section.healthy_reset_secs),
            stop_grace: Duration::from_secs(section.stop_grace_secs),
            state_file: Some(section.state_file.clone()),
        }
    }
}

/// 读取已部署版本（文件首行）
pub fn read_deployed_version(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .next()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        Err(e) => {
            tracing::debug!("version file {:?} unreadable: {}", path, e);
            None
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    /// 读取流水线标记、写入 FatalIssue；None 时跳过版本与心跳检查
    store: Option<Arc<dyn TaskStore>>,
    probe: Box<dyn HealthProbe>,
    launcher: Box<dyn PipelineLauncher>,
    notifier: Arc<dyn Notifier>,
    state: SupervisorState,
    child: Option<Box<dyn PipelineHandle>>,
    launched_at: Option<Instant>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        store: Option<Arc<dyn TaskStore>>,
        probe: Box<dyn HealthProbe>,
        launcher: Box<dyn PipelineLauncher>,
        notifier: Arc<dyn Notifier>,
        state: SupervisorState,
    ) -> Self {
        Self {
            config,
            store,
            probe,
            launcher,
            notifier,
            state,
            child: None,
            launched_at: None,
        }
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    fn persist(&self) {
        if let Some(path) = &self.config.state_file {
            if let Err(e) = self.state.save(path) {
                tracing::warn!("failed to persist supervisor state: {}", e);
            }
        }
    }

    /// 启动流水线（若尚未运行）
    pub async fn ensure_running(&mut self) {
        if self.child.is_some() {
            return;
        }
        match self.launcher.launch().await {
            Ok(handle) => {
                tracing::info!(pid = ?handle.pid(), "pipeline launched");
                self.child = Some(handle);
            }
            Err(e) => tracing::error!(error = %e, "failed to launch pipeline"),
        }
        self.launched_at = Some(Instant::now());
        self.state.consecutive_probe_failures = 0;
        self.state.healthy_since = None;
    }

    /// 汇总各项信号给出结论（探测失败计数会被更新）
    pub async fn check(&mut self) -> Result<Verdict, SupervisorError> {
        let Some(child) = self.child.as_mut() else {
            return Ok(Verdict::Restart(RestartReason::NotRunning));
        };
        if child.has_exited() {
            return Ok(Verdict::Restart(RestartReason::ProcessExited));
        }
        let child_pid = child.pid();

        if self
            .launched_at
            .is_some_and(|at| at.elapsed() < self.config.startup_grace)
        {
            return Ok(Verdict::Starting);
        }

        if let Some(store) = &self.store {
            if let Some(marker) = store.read_marker().await? {
                // 标记来自上一个进程时，新进程尚未写入，不做判定
                let current = child_pid.map_or(true, |pid| pid == marker.pid);
                if current {
                    self.state.last_known_version = Some(marker.version.clone());
                    let deployed = self
                        .config
                        .version_file
                        .as_deref()
                        .and_then(read_deployed_version);
                    if let Some(deployed) = deployed {
                        if deployed != marker.version {
                            return Ok(Verdict::Restart(RestartReason::StaleVersion {
                                running: marker.version,
                                deployed,
                            }));
                        }
                    }
                    let age = now_ms() - marker.heartbeat_at;
                    if age > self.config.heartbeat_stale.as_millis() as i64 {
                        return Ok(Verdict::Restart(RestartReason::Stuck {
                            heartbeat_age_ms: age,
                        }));
                    }
                }
            }
        }

        if self.probe.probe().await {
            self.state.consecutive_probe_failures = 0;
            Ok(Verdict::Healthy)
        } else {
            self.state.consecutive_probe_failures += 1;
            self.state.healthy_since = None;
            let failures = self.state.consecutive_probe_failures;
            tracing::warn!(failures, "health probe failed");
            if failures >= self.config.max_probe_failures {
                Ok(Verdict::Restart(RestartReason::Unresponsive { failures }))
            } else {
                Ok(Verdict::Healthy)
            }
        }
    }

    /// 检查一次并按结论行动
    pub async fn tick(&mut self) -> Result<TickOutcome, SupervisorError> {
        match self.check().await? {
            Verdict::Starting => Ok(TickOutcome::Starting),
            Verdict::Healthy => {
                if self.state.consecutive_probe_failures == 0 {
                    self.note_healthy();
                }
                Ok(TickOutcome::Healthy)
            }
            Verdict::Restart(reason) => {
                self.restart(&reason).await?;
                Ok(TickOutcome::Restarted(reason))
            }
        }
    }

    fn note_healthy(&mut self) {
        let now = now_ms();
        let since = *self.state.healthy_since.get_or_insert(now);
        if self.state.restart_count > 0
            && now - since >= self.config.healthy_reset.as_millis() as i64
        {
            tracing::info!(
                restart_count = self.state.restart_count,
                "pipeline healthy long enough, resetting restart count"
            );
            self.state.restart_count = 0;
            self.persist();
        }
    }

    async fn restart(&mut self, reason: &RestartReason) -> Result<(), SupervisorError> {
        self.state.restart_count += 1;
        self.state.healthy_since = None;
        if self.state.restart_count > self.config.max_restarts {
            return self.give_up(reason).await;
        }

        tracing::warn!(
            reason = reason.as_str(),
            detail = ?reason,
            restart_count = self.state.restart_count,
            "restarting pipeline"
        );
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.terminate(self.config.stop_grace).await {
                tracing::warn!(error = %e, "failed to terminate pipeline cleanly");
            }
        }
        self.state.last_restart_at = Some(now_ms());
        self.state.last_restart_reason = Some(reason.as_str().to_string());
        self.persist();

        self.notifier
            .notify(NotifyEvent::PipelineRestarted {
                reason: reason.as_str().to_string(),
                restart_count: self.state.restart_count,
            })
            .await;
        self.ensure_running().await;
        Ok(())
    }

    /// 重启预算耗尽：写入唯一的 FatalIssue，停止流水线，不再重启
    async fn give_up(&mut self, reason: &RestartReason) -> Result<(), SupervisorError> {
        let message = format!(
            "{} after {} restarts (max {})",
            reason.as_str(),
            self.state.restart_count - 1,
            self.config.max_restarts
        );
        tracing::error!("{}", message);

        self.state.fatal = true;
        self.persist();
        if let Some(store) = &self.store {
            store
                .record_fatal(&FatalIssue {
                    reason: message.clone(),
                    restart_count: self.state.restart_count,
                    last_version: self.state.last_known_version.clone(),
                    recorded_at: now_ms(),
                })
                .await?;
        }
        self.notifier
            .notify(NotifyEvent::PipelineFatal {
                reason: message.clone(),
                restart_count: self.state.restart_count,
            })
            .await;
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.terminate(self.config.stop_grace).await {
                tracing::warn!(error = %e, "failed to terminate pipeline cleanly");
            }
        }
        Err(SupervisorError::Fatal(message))
    }

    /// 主循环：直到 shutdown（同时停止流水线）或重启预算耗尽
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        if self.state.fatal {
            return Err(SupervisorError::Fatal(
                "a previous run exhausted the restart budget; clear the state file to resume"
                    .to_string(),
            ));
        }
        self.ensure_running().await;

        let mut ticker = tokio::time::interval(self.config.probe_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(TickOutcome::Restarted(reason)) => {
                            tracing::info!(reason = reason.as_str(), "pipeline restarted");
                        }
                        Ok(_) => {}
                        Err(SupervisorError::Fatal(msg)) => return Err(SupervisorError::Fatal(msg)),
                        // 存储暂时不可用时不重启，下一轮再看
                        Err(e) => tracing::warn!(error = %e, "supervisor check failed"),
                    }
                }
            }
        }

        tracing::info!("supervisor stopping pipeline");
        if let Some(mut child) = self.child.take() {
            child.terminate(self.config.stop_grace).await.ok();
        }
        self.persist();
        Ok(())
    }
}
