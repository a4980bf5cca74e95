//! 通知出口
//!
//! 核心只负责产生事件，投递给人的方式（IM、邮件等）由外部实现 Notifier。
//! 投递失败只记日志，不影响任务状态。


use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::task::{FailureCategory, Task, TaskId, TaskStatus};

/// 需要外部关注的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotifyEvent {
    TaskCompleted {
        task_id: TaskId,
        attempt_count: u32,
    },
    TaskFailed {
        task_id: TaskId,
        category: Option<FailureCategory>,
        next_action: Option<String>,
    },
    TaskNeedsDecision {
        task_id: TaskId,
        category: Option<FailureCategory>,
        next_action: Option<String>,
    },
    /// 看门狗重启了流水线
    PipelineRestarted {
        reason: String,
        restart_count: u32,
    },
    /// 重启预算耗尽，需要人工处理
    PipelineFatal {
        reason: String,
        restart_count: u32,
    },
}

impl NotifyEvent {
    /// 任务进入终态（或等待决策）时对应的事件；其他状态返回 None
    pub fn for_task(task: &Task) -> Option<Self> {
        let next_action = task.last_reflection().map(|r| r.next_action.clone());
        match task.status {
            TaskStatus::Completed => Some(NotifyEvent::TaskCompleted {
                task_id: task.id.clone(),
                attempt_count: task.attempt_count,
            }),
            TaskStatus::Failed => Some(NotifyEvent::TaskFailed {
                task_id: task.id.clone(),
                category: task.last_failure_category,
                next_action,
            }),
            TaskStatus::NeedsDecision => Some(NotifyEvent::TaskNeedsDecision {
                task_id: task.id.clone(),
                category: task.last_failure_category,
                next_action,
            }),
            _ => None,
        }
    }
}

/// 通知接口
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent);
}

/// 只写日志的通知器（默认）
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifyEvent) {
        match &event {
            NotifyEvent::TaskCompleted { .. } | NotifyEvent::PipelineRestarted { .. } => {
                tracing::info!(event = ?event, "notify")
            }
            NotifyEvent::PipelineFatal { .. } => tracing::error!(event = ?event, "notify"),
            _ => tracing::warn!(event = ?event, "notify"),
        }
    }
}

/// 把事件转发到 mpsc 通道，由调用方自行消费
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<NotifyEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NotifyEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, event: NotifyEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{NewTask, TaskType};

    #[tokio::test]
    async fn test_channel_notifier_forwards() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier
            .notify(NotifyEvent::PipelineRestarted {
                reason: "stale_version".into(),
                restart_count: 1,
            })
            .await;
        assert!(matches!(
            rx.try_recv().unwrap(),
            NotifyEvent::PipelineRestarted { restart_count: 1, .. }
        ));
    }

    #[test]
    fn test_event_only_for_settled_tasks() {
        let mut task = Task::new(NewTask::new(TaskType::Test, "x"), 3, 0);
        assert!(NotifyEvent::for_task(&task).is_none());
        task.status = TaskStatus::Completed;
        assert!(matches!(
            NotifyEvent::for_task(&task),
            Some(NotifyEvent::TaskCompleted { .. })
        ));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(NotifyEvent::PipelineFatal {
            reason: "restart budget exhausted".into(),
            restart_count: 6,
        })
        .unwrap();
        assert_eq!(json["event"], "pipeline_fatal");
    }
}
