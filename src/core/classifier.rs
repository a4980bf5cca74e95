//! 失败分类器
//!
//! 有序规则表：对原始失败文本逐条匹配，首条命中即返回。纯函数，不读取任何外部状态，
//! 同一错误串总是得到同一类别。未命中任何规则时归为 Generic。

use regex::Regex;

use crate::task::FailureCategory;

/// 重试延迟提示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayHint {
    /// 立即重试
    Immediate,
    /// 指数退避
    Backoff,
    /// 固定短延迟
    Fixed,
    /// 等待外部窗口重置（不自动重试）
    External,
}

/// 每个失败类别对应的处理规则
#[derive(Debug, Clone, Copy)]
pub struct CategoryRule {
    pub category: FailureCategory,
    pub blind_spot: &'static str,
    pub next_action: &'static str,
    /// 是否允许自动重试
    pub retryable: bool,
    /// 该类别最多自动重试几次（None 表示仅受 max_attempts 约束）
    pub max_retries: Option<u32>,
    pub delay: DelayHint,
}

const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        category: FailureCategory::QuotaExceeded,
        blind_spot: "Assumed the provider had usage quota left for this window",
        next_action: "Wait for the usage window to reset before retrying; do not retry immediately",
        retryable: false,
        max_retries: Some(0),
        delay: DelayHint::External,
    },
    CategoryRule {
        category: FailureCategory::PaidProviderBlocked,
        blind_spot: "Assumed the configured provider or model was allowed for this task",
        next_action: "Switch the executor or set a model override, then retry",
        retryable: true,
        max_retries: None,
        delay: DelayHint::Immediate,
    },
    CategoryRule {
        category: FailureCategory::EnvOrSecrets,
        blind_spot: "Assumed the executor environment had every credential and config it needs",
        next_action: "Fix the missing environment variable, secret or config; no automatic retry",
        retryable: false,
        max_retries: Some(0),
        delay: DelayHint::External,
    },
    CategoryRule {
        category: FailureCategory::TestOrLintFailure,
        blind_spot: "Assumed the change satisfied the test suite and linters",
        next_action: "Retry once with the failing test or lint output as a targeted fix hint",
        retryable: true,
        max_retries: Some(1),
        delay: DelayHint::Immediate,
    },
    CategoryRule {
        category: FailureCategory::RebaseConflict,
        blind_spot: "Assumed the working branch was still based on the current upstream",
        next_action: "Rebase onto the latest upstream, resolve conflicts and retry",
        retryable: true,
        max_retries: None,
        delay: DelayHint::Immediate,
    },
    CategoryRule {
        category: FailureCategory::FlakyOrNetwork,
        blind_spot: "Assumed the network and remote services were stable during the attempt",
        next_action: "Retry with exponential backoff",
        retryable: true,
        max_retries: None,
        delay: DelayHint::Backoff,
    },
    CategoryRule {
        category: FailureCategory::Timeout,
        blind_spot: "Assumed the work fits inside the per-attempt time limit",
        next_action: "Retry with backoff; split the task or raise the executor timeout if it repeats",
        retryable: true,
        max_retries: None,
        delay: DelayHint::Backoff,
    },
    CategoryRule {
        category: FailureCategory::Generic,
        blind_spot: "The failure matched no known pattern, so its cause is unverified",
        next_action: "Retry once, then escalate to needs_decision for a human look",
        retryable: true,
        max_retries: Some(1),
        delay: DelayHint::Fixed,
    },
];

/// 查询某类别的处理规则
pub fn rule_for(category: FailureCategory) -> &'static CategoryRule {
    CATEGORY_RULES
        .iter()
        .find(|r| r.category == category)
        .unwrap_or(&CATEGORY_RULES[CATEGORY_RULES.len() - 1])
}

/// 匹配规则：按顺序，首条命中生效
const PATTERNS: &[(FailureCategory, &str)] = &[
    (
        FailureCategory::QuotaExceeded,
        r"(?i)(quota|usage limit|rate[ _-]?limit(ed)? exceeded|insufficient_quota|too many requests|hit your (usage )?limit|credit balance is too low)",
    ),
    (
        FailureCategory::PaidProviderBlocked,
        r"(?i)(provider (is )?blocked|paid (provider|model)s? (are |is )?(blocked|disabled|not allowed)|payment required|billing (is )?(required|disabled)|model override required)",
    ),
    (
        FailureCategory::EnvOrSecrets,
        r"(?i)(api[ _-]?key|missing (credential|secret|token|env)|environment variable \S+ (is )?(not set|missing)|not set in (the )?environment|unauthorized|authentication failed|permission denied|command not found|no executor registered|config(uration)? (file )?not found)",
    ),
    (
        FailureCategory::TestOrLintFailure,
        r"(?i)(test result: failed|tests? failed|failing tests?|assertion(error| failed)|(?-i:\bFAILED\b)|clippy|lint(ing)? (error|failed)|eslint|error\[E\d{4}\]|pytest)",
    ),
    (
        FailureCategory::RebaseConflict,
        r"(?i)(merge conflict|rebase conflict|CONFLICT \(|could not apply|unmerged paths|needs merge|non-fast-forward)",
    ),
    (
        FailureCategory::FlakyOrNetwork,
        r"(?i)(connection (reset|refused|closed|aborted)|timed? ?out|timeout|network (is )?unreachable|temporarily unavailable|service unavailable|bad gateway|\bdns\b|econnreset|broken pipe|tls handshake|\b50[234]\b)",
    ),
];

/// 分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub category: FailureCategory,
    pub blind_spot: &'static str,
    pub next_action: &'static str,
}

impl From<FailureCategory> for Classification {
    fn from(category: FailureCategory) -> Self {
        let rule = rule_for(category);
        Self {
            category,
            blind_spot: rule.blind_spot,
            next_action: rule.next_action,
        }
    }
}

/// 失败分类器：规则在构造时编译一次
pub struct FailureClassifier {
    rules: Vec<(FailureCategory, Regex)>,
}

impl FailureClassifier {
    pub fn new() -> Self {
        let rules = PATTERNS
            .iter()
            .filter_map(|(category, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((*category, re)),
                Err(e) => {
                    tracing::error!(category = %category, error = %e, "invalid classifier pattern");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// 对原始失败文本分类
    pub fn classify(&self, raw: &str) -> Classification {
        let category = self
            .rules
            .iter()
            .find(|(_, re)| re.is_match(raw))
            .map(|(category, _)| *category)
            .unwrap_or(FailureCategory::Generic);
        category.into()
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(raw: &str) -> FailureCategory {
        FailureClassifier::new().classify(raw).category
    }

    #[test]
    fn test_every_pattern_compiles() {
        assert_eq!(FailureClassifier::new().rules.len(), PATTERNS.len());
    }

    #[test]
    fn test_every_category_has_rule() {
        for category in FailureCategory::ALL {
            let rule = rule_for(category);
            assert_eq!(rule.category, category);
            assert!(!rule.blind_spot.is_empty());
            assert!(!rule.next_action.is_empty());
        }
    }

    #[test]
    fn test_quota_exceeded() {
        assert_eq!(
            classify("Error: You exceeded your current quota, please check your plan"),
            FailureCategory::QuotaExceeded
        );
        assert_eq!(classify("HTTP 429 Too Many Requests"), FailureCategory::QuotaExceeded);
    }

    #[test]
    fn test_paid_provider_blocked() {
        assert_eq!(
            classify("paid providers are disabled for this workspace"),
            FailureCategory::PaidProviderBlocked
        );
    }

    #[test]
    fn test_env_or_secrets() {
        assert_eq!(
            classify("environment variable OPENAI_API_KEY is not set"),
            FailureCategory::EnvOrSecrets
        );
        assert_eq!(
            classify("sh: 1: claude: command not found"),
            FailureCategory::EnvOrSecrets
        );
        assert_eq!(
            classify("no executor registered for task type review"),
            FailureCategory::EnvOrSecrets
        );
    }

    #[test]
    fn test_test_or_lint_failure() {
        assert_eq!(
            classify("test result: FAILED. 3 passed; 1 failed"),
            FailureCategory::TestOrLintFailure
        );
        assert_eq!(
            classify("error[E0308]: mismatched types"),
            FailureCategory::TestOrLintFailure
        );
    }

    #[test]
    fn test_rebase_conflict() {
        assert_eq!(
            classify("CONFLICT (content): Merge conflict in src/lib.rs"),
            FailureCategory::RebaseConflict
        );
    }

    #[test]
    fn test_flaky_or_network() {
        assert_eq!(classify("connection reset by peer"), FailureCategory::FlakyOrNetwork);
        assert_eq!(classify("upstream returned 503"), FailureCategory::FlakyOrNetwork);
    }

    #[test]
    fn test_generic_fallback() {
        assert_eq!(classify("something odd happened"), FailureCategory::Generic);
        assert_eq!(classify(""), FailureCategory::Generic);
    }

    #[test]
    fn test_first_match_wins() {
        // 同时含 quota 与 network 信号时，quota 在表中靠前
        assert_eq!(
            classify("quota exceeded after connection reset"),
            FailureCategory::QuotaExceeded
        );
    }

    #[test]
    fn test_deterministic() {
        let classifier = FailureClassifier::new();
        let raw = "assertion failed: left == right";
        let first = classifier.classify(raw);
        for _ in 0..10 {
            assert_eq!(classifier.classify(raw), first);
        }
    }
}
