//! 任务状态机
//!
//! ```text
//! pending        --claim-->            claimed
//! claimed        --start-->            running          (attempt_count += 1)
//! running        --Complete-->         completed
//! running        --Retry-->            pending          (claimed_by 清空，设置 next_attempt_at)
//! running        --Fail-->             failed
//! running        --Escalate-->         needs_decision
//! needs_decision --resolve-->          pending | failed (仅外部决策)
//! failed         --reopen-->           pending          (仅外部决策)
//! claimed|running --reclaim-->         pending          (reaper 回收失联 worker 的任务)
//! needs_decision --expire-->           failed           (超过决策等待期限)
//! ```
//!
//! 这里的转换都是纯函数：存储层在各自的原子区间内读取任务、调用转换、写回。

use crate::core::TransitionError;
use crate::task::{FailureCategory, RetryReflection, Task, TaskStatus};

/// 重试策略对一次尝试结果给出的决定
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Complete { output: String },
    Retry { reflection: RetryReflection, delay_ms: i64 },
    Fail { reflection: RetryReflection },
    Escalate { reflection: RetryReflection },
}

impl Decision {
    pub fn reflection(&self) -> Option<&RetryReflection> {
        match self {
            Decision::Complete { .. } => None,
            Decision::Retry { reflection, .. }
            | Decision::Fail { reflection }
            | Decision::Escalate { reflection } => Some(reflection),
        }
    }

    /// 该决定落地后的目标状态
    pub fn target_status(&self) -> TaskStatus {
        match self {
            Decision::Complete { .. } => TaskStatus::Completed,
            Decision::Retry { .. } => TaskStatus::Pending,
            Decision::Fail { .. } => TaskStatus::Failed,
            Decision::Escalate { .. } => TaskStatus::NeedsDecision,
        }
    }
}

/// record_outcome 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// 已应用，任务进入该状态
    Transitioned(TaskStatus),
    /// 该尝试的结果已处理过（或任务已不在运行），未做任何修改
    Duplicate,
}

/// 外部决策的目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Pending,
    Failed,
}

impl TryFrom<TaskStatus> for Resolution {
    type Error = TransitionError;

    fn try_from(status: TaskStatus) -> Result<Self, Self::Error> {
        match status {
            TaskStatus::Pending => Ok(Resolution::Pending),
            TaskStatus::Failed => Ok(Resolution::Failed),
            other => Err(TransitionError::InvalidResolution(other)),
        }
    }
}

/// reaper 回收一个任务的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaimed {
    /// 回到 pending 等待重新认领
    Requeued,
    /// 宽限尝试已用尽，直接失败
    Abandoned,
}

const RECLAIM_BLIND_SPOT: &str =
    "The worker holding this task stopped reporting before the attempt finished";
const RECLAIM_NEXT_ACTION: &str =
    "Check executor resource usage and the dispatcher host; the grace attempt is spent";

impl Task {
    fn illegal(&self, action: &'static str) -> TransitionError {
        TransitionError::Illegal {
            action,
            from: self.status,
        }
    }

    fn ensure_holder(&self, worker_id: &str) -> Result<(), TransitionError> {
        if self.claimed_by.as_deref() == Some(worker_id) {
            Ok(())
        } else {
            Err(TransitionError::NotHolder {
                worker: worker_id.to_string(),
                holder: self.claimed_by.clone(),
            })
        }
    }

    /// 外部决策重新放行时至少留出一次尝试
    fn grant_attempt(&mut self) {
        self.max_attempts = self.max_attempts.max(self.attempt_count + 1);
    }

    /// pending -> claimed
    pub fn claim(&mut self, worker_id: &str, now: i64) -> Result<(), TransitionError> {
        if !self.is_claimable(now) {
            return Err(self.illegal("claim"));
        }
        self.status = TaskStatus::Claimed;
        self.claimed_by = Some(worker_id.to_string());
        self.updated_at = now;
        Ok(())
    }

    /// claimed -> running，计入一次尝试
    pub fn start(&mut self, worker_id: &str, now: i64) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Claimed {
            return Err(self.illegal("start"));
        }
        self.ensure_holder(worker_id)?;
        self.status = TaskStatus::Running;
        self.attempt_count += 1;
        self.next_attempt_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// 执行期间的心跳，防止被 reaper 误回收
    pub fn touch(&mut self, worker_id: &str, now: i64) -> Result<(), TransitionError> {
        if !self.status.is_held() {
            return Err(self.illegal("heartbeat"));
        }
        self.ensure_holder(worker_id)?;
        self.updated_at = now;
        Ok(())
    }

    /// 应用重试策略的决定；同一尝试重复提交时为幂等 no-op
    pub fn apply_decision(&mut self, attempt: u32, decision: &Decision, now: i64) -> Applied {
        if self.status != TaskStatus::Running || self.attempt_count != attempt {
            return Applied::Duplicate;
        }

        match decision {
            Decision::Complete { output } => {
                self.output = Some(output.clone());
                self.last_failure_category = None;
            }
            Decision::Retry { reflection, delay_ms } => {
                self.record_reflection(reflection);
                self.next_attempt_at = (*delay_ms > 0).then(|| now + delay_ms);
            }
            Decision::Fail { reflection } | Decision::Escalate { reflection } => {
                self.record_reflection(reflection);
            }
        }

        self.status = decision.target_status();
        self.claimed_by = None;
        self.updated_at = now;
        Applied::Transitioned(self.status)
    }

    fn record_reflection(&mut self, reflection: &RetryReflection) {
        self.last_failure_category = Some(reflection.failure_category);
        self.retry_reflections.push(reflection.clone());
    }

    /// needs_decision -> pending | failed
    pub fn resolve(
        &mut self,
        resolution: Resolution,
        output: Option<String>,
        now: i64,
    ) -> Result<(), TransitionError> {
        if self.status != TaskStatus::NeedsDecision {
            return Err(self.illegal("resolve"));
        }
        match resolution {
            Resolution::Pending => {
                self.status = TaskStatus::Pending;
                self.next_attempt_at = None;
                self.grant_attempt();
            }
            Resolution::Failed => self.status = TaskStatus::Failed,
        }
        if output.is_some() {
            self.output = output;
        }
        self.updated_at = now;
        Ok(())
    }

    /// failed -> pending
    pub fn reopen(&mut self, now: i64) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Failed {
            return Err(self.illegal("reopen"));
        }
        self.status = TaskStatus::Pending;
        self.next_attempt_at = None;
        self.cancelled = false;
        self.grant_attempt();
        self.updated_at = now;
        Ok(())
    }

    /// 取消：仅 pending 且未取消的任务
    pub fn cancel(&mut self, now: i64) -> Result<(), TransitionError> {
        if self.status != TaskStatus::Pending || self.cancelled {
            return Err(self.illegal("cancel"));
        }
        self.cancelled = true;
        self.updated_at = now;
        Ok(())
    }

    /// claimed | running -> pending（或宽限尝试耗尽时 -> failed）
    pub fn reclaim(&mut self, now: i64) -> Result<Reclaimed, TransitionError> {
        if !self.status.is_held() {
            return Err(self.illegal("reclaim"));
        }
        let was_running = self.status == TaskStatus::Running;
        let abandoned = was_running && self.attempt_count > self.max_attempts;
        self.claimed_by = None;
        self.updated_at = now;

        // 已 start 的尝试计入 attempt_count，必须留下对应的反思
        if was_running {
            self.record_reflection(&RetryReflection {
                attempt_number: self.attempt_count,
                failure_category: FailureCategory::Timeout,
                blind_spot: RECLAIM_BLIND_SPOT.to_string(),
                next_action: RECLAIM_NEXT_ACTION.to_string(),
                failure_excerpt: "attempt abandoned by a stale worker".to_string(),
                timestamp: now,
            });
        }

        if abandoned {
            self.status = TaskStatus::Failed;
            Ok(Reclaimed::Abandoned)
        } else {
            self.status = TaskStatus::Pending;
            Ok(Reclaimed::Requeued)
        }
    }

    /// needs_decision 超期 -> failed
    pub fn expire_decision(&mut self, now: i64) -> Result<(), TransitionError> {
        if self.status != TaskStatus::NeedsDecision {
            return Err(self.illegal("expire"));
        }
        self.status = TaskStatus::Failed;
        self.updated_at = now;
        Ok(())
    }
}
