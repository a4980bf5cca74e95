//! 重试策略
//!
//! 根据执行结果、失败分类与尝试计数给出 Decision：完成 / 重试（带延迟）/ 失败 / 升级为 needs_decision。
//! 每次失败都生成一条 RetryReflection（blind_spot + next_action 来自分类规则表）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RetrySection;
use crate::core::classifier::{rule_for, Classification, DelayHint, FailureClassifier};
use crate::executor::Outcome;
use crate::task::{failure_excerpt, Decision, FailureCategory, RetryReflection, Task, TaskType};

const AMBIGUOUS_BLIND_SPOT: &str =
    "The executor reported success but also returned an error, so the result cannot be trusted";
const AMBIGUOUS_NEXT_ACTION: &str =
    "Inspect the output and resolve the task to pending or failed by hand";

/// 重试延迟参数
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub default_max_attempts: u32,
    pub max_attempts_by_type: HashMap<TaskType, u32>,
    /// 指数退避基准
    pub base_backoff: Duration,
    /// 指数退避上限
    pub max_backoff: Duration,
    /// Generic 类失败的固定延迟
    pub generic_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            max_attempts_by_type: HashMap::new(),
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            generic_delay: Duration::from_secs(30),
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        let max_attempts_by_type = section
            .max_attempts_by_type
            .iter()
            .filter_map(|(name, n)| match name.parse::<TaskType>() {
                Ok(t) => Some((t, *n)),
                Err(e) => {
                    tracing::warn!("ignoring retry.max_attempts_by_type entry: {}", e);
                    None
                }
            })
            .collect();
        Self {
            default_max_attempts: section.default_max_attempts,
            max_attempts_by_type,
            base_backoff: Duration::from_secs(section.base_backoff_secs),
            max_backoff: Duration::from_secs(section.max_backoff_secs),
            generic_delay: Duration::from_secs(section.generic_delay_secs),
        }
    }
}

/// 重试策略
pub struct RetryPolicy {
    classifier: Arc<FailureClassifier>,
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            classifier: Arc::new(FailureClassifier::new()),
            config,
        }
    }

    /// 新任务的尝试上限：请求值 > 按类型配置 > 全局默认
    pub fn max_attempts_for(&self, task_type: TaskType, requested: Option<u32>) -> u32 {
        requested
            .or_else(|| self.config.max_attempts_by_type.get(&task_type).copied())
            .unwrap_or(self.config.default_max_attempts)
            .max(1)
    }

    /// 对刚结束的一次尝试做出决定；task 为该尝试开始时（running）的快照
    pub fn decide(&self, task: &Task, outcome: &Outcome, now: i64) -> Decision {
        if outcome.is_ambiguous() {
            let reflection = RetryReflection {
                attempt_number: task.attempt_count,
                failure_category: FailureCategory::Generic,
                blind_spot: AMBIGUOUS_BLIND_SPOT.to_string(),
                next_action: AMBIGUOUS_NEXT_ACTION.to_string(),
                failure_excerpt: failure_excerpt(outcome.error.as_deref().unwrap_or_default()),
                timestamp: now,
            };
            return Decision::Escalate { reflection };
        }

        if outcome.success {
            return Decision::Complete {
                output: outcome.output.clone(),
            };
        }

        let raw = outcome.failure_text();
        let classification: Classification = if outcome.timed_out {
            FailureCategory::Timeout.into()
        } else {
            self.classifier.classify(&raw)
        };
        let category = classification.category;
        let rule = rule_for(category);

        let reflection = RetryReflection {
            attempt_number: task.attempt_count,
            failure_category: category,
            blind_spot: classification.blind_spot.to_string(),
            next_action: classification.next_action.to_string(),
            failure_excerpt: failure_excerpt(&raw),
            timestamp: now,
        };

        if !rule.retryable {
            return Decision::Fail { reflection };
        }

        let prior_same = task
            .retry_reflections
            .iter()
            .filter(|r| r.failure_category == category)
            .count() as u32;
        let category_exhausted = rule.max_retries.map_or(false, |n| prior_same >= n);
        let budget_exhausted = task.attempt_count >= task.max_attempts;

        if category_exhausted || budget_exhausted {
            return if category == FailureCategory::Generic {
                Decision::Escalate { reflection }
            } else {
                Decision::Fail { reflection }
            };
        }

        let delay = self.delay_for(rule.delay, task.attempt_count);
        Decision::Retry {
            reflection,
            delay_ms: delay.as_millis() as i64,
        }
    }

    /// 延迟：立即 / 指数退避（base * 2^(attempt-1)，封顶）/ 固定
    pub fn delay_for(&self, hint: DelayHint, attempt: u32) -> Duration {
        match hint {
            DelayHint::Immediate | DelayHint::External => Duration::ZERO,
            DelayHint::Fixed => self.config.generic_delay,
            DelayHint::Backoff => {
                let exp = attempt.saturating_sub(1).min(16);
                let delay = self.config.base_backoff.saturating_mul(1u32 << exp);
                delay.min(self.config.max_backoff)
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}
