//! 监控 / 效果报告
//!
//! 对任务存储快照做纯读聚合：吞吐量、成功率、按状态与失败类别计数，
//! 以及按严重程度排序的未决问题列表。从不修改任务状态。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::core::StoreError;
use crate::store::TaskStore;
use crate::supervisor::read_deployed_version;
use crate::task::{now_ms, FailureCategory, Task, TaskStatus};

const HOUR_MS: i64 = 3_600_000;

/// 效果报告
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EffectivenessReport {
    pub window_hours: u32,
    /// 窗口内完成的任务数
    pub throughput: usize,
    /// 全部已完成（不限窗口）
    pub completed: usize,
    pub failed: usize,
    /// completed / (completed + failed)，没有终态任务时为 null
    pub success_rate: Option<f64>,
    pub by_status: BTreeMap<String, usize>,
    /// 按最近一次失败类别
    pub by_category: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    PipelineFatal,
    StalePipelineVersion,
    NeedsDecision,
    RepeatedQuotaExceeded,
    RepeatedEnvOrSecrets,
    StuckClaims,
}

impl IssueKind {
    /// 数值越大越严重
    pub fn severity(&self) -> u8 {
        match self {
            IssueKind::PipelineFatal => 100,
            IssueKind::StalePipelineVersion => 80,
            IssueKind::NeedsDecision => 60,
            IssueKind::RepeatedEnvOrSecrets => 50,
            IssueKind::RepeatedQuotaExceeded => 40,
            IssueKind::StuckClaims => 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OpenIssue {
    pub kind: IssueKind,
    pub severity: u8,
    pub count: usize,
    pub summary: String,
    /// 相关任务（最多列出 20 个）
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub task_ids: Vec<String>,
}

const MAX_LISTED_TASKS: usize = 20;

impl OpenIssue {
    fn new(kind: IssueKind, count: usize, summary: String, tasks: &[&Task]) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            count,
            summary,
            task_ids: tasks
                .iter()
                .take(MAX_LISTED_TASKS)
                .map(|t| t.id.clone())
                .collect(),
        }
    }
}

pub struct Monitor {
    store: Arc<dyn TaskStore>,
    /// 与 reaper 的回收超时一致
    stale_after: Duration,
    version_file: Option<PathBuf>,
}

impl Monitor {
    pub fn new(store: Arc<dyn TaskStore>, stale_after: Duration) -> Self {
        Self {
            store,
            stale_after,
            version_file: None,
        }
    }

    /// 已部署版本文件（用于判定运行版本是否落后）
    pub fn with_version_file(mut self, path: Option<PathBuf>) -> Self {
        self.version_file = path;
        self
    }

    pub async fn effectiveness(&self, window_hours: u32) -> Result<EffectivenessReport, StoreError> {
        let tasks = self.store.snapshot().await?;
        Ok(effectiveness_of(&tasks, window_hours, now_ms()))
    }

    pub async fn open_issues(&self) -> Result<Vec<OpenIssue>, StoreError> {
        let tasks = self.store.snapshot().await?;
        let now = now_ms();
        let mut issues = Vec::new();

        if let Some(fatal) = self.store.fatal_issue().await? {
            issues.push(OpenIssue::new(
                IssueKind::PipelineFatal,
                1,
                format!(
                    "supervisor gave up after {} restarts: {}",
                    fatal.restart_count, fatal.reason
                ),
                &[],
            ));
        }

        if let Some(marker) = self.store.read_marker().await? {
            let deployed = self.version_file.as_deref().and_then(read_deployed_version);
            if let Some(deployed) = deployed.filter(|d| *d != marker.version) {
                issues.push(OpenIssue::new(
                    IssueKind::StalePipelineVersion,
                    1,
                    format!("running {} but {} is deployed", marker.version, deployed),
                    &[],
                ));
            }
        }

        issues.extend(task_issues(&tasks, self.stale_after, now));
        rank(&mut issues);
        Ok(issues)
    }
}

pub fn effectiveness_of(tasks: &[Task], window_hours: u32, now: i64) -> EffectivenessReport {
    let window_start = now - i64::from(window_hours) * HOUR_MS;
    let mut by_status: BTreeMap<String, usize> = TaskStatus::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), 0))
        .collect();
    let mut by_category = BTreeMap::new();
    let mut throughput = 0;

    for task in tasks {
        *by_status.entry(task.status.as_str().to_string()).or_default() += 1;
        if let Some(category) = task.last_failure_category {
            *by_category.entry(category.as_str().to_string()).or_default() += 1;
        }
        if task.status == TaskStatus::Completed && task.updated_at >= window_start {
            throughput += 1;
        }
    }

    let completed = by_status.get(TaskStatus::Completed.as_str()).copied().unwrap_or(0);
    let failed = by_status.get(TaskStatus::Failed.as_str()).copied().unwrap_or(0);
    let terminal = completed + failed;
    EffectivenessReport {
        window_hours,
        throughput,
        completed,
        failed,
        success_rate: (terminal > 0).then(|| completed as f64 / terminal as f64),
        by_status,
        by_category,
    }
}

/// 从任务快照推导的问题（不含流水线级问题）
pub fn task_issues(tasks: &[Task], stale_after: Duration, now: i64) -> Vec<OpenIssue> {
    let mut issues = Vec::new();

    let waiting: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::NeedsDecision)
        .collect();
    if !waiting.is_empty() {
        issues.push(OpenIssue::new(
            IssueKind::NeedsDecision,
            waiting.len(),
            format!("{} task(s) waiting for a decision", waiting.len()),
            &waiting,
        ));
    }

    // 只看尚未完成的任务：已完成任务的旧失败不再是问题
    for (category, kind) in [
        (FailureCategory::QuotaExceeded, IssueKind::RepeatedQuotaExceeded),
        (FailureCategory::EnvOrSecrets, IssueKind::RepeatedEnvOrSecrets),
    ] {
        let hits: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Completed && t.last_failure_category == Some(category))
            .collect();
        if hits.len() >= 2 {
            issues.push(OpenIssue::new(
                kind,
                hits.len(),
                format!("{} task(s) last failed with {}", hits.len(), category),
                &hits,
            ));
        }
    }

    let cutoff = now - stale_after.as_millis() as i64;
    let stuck: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.status.is_held() && t.updated_at < cutoff)
        .collect();
    if !stuck.is_empty() {
        issues.push(OpenIssue::new(
            IssueKind::StuckClaims,
            stuck.len(),
            format!(
                "{} task(s) held without progress for over {}s",
                stuck.len(),
                stale_after.as_secs()
            ),
            &stuck,
        ));
    }

    issues
}

fn rank(issues: &mut [OpenIssue]) {
    issues.sort_by(|a, b| b.severity.cmp(&a.severity).then(b.count.cmp(&a.count)));
}
