//! 核心层：错误类型、失败分类、重试策略、优雅关闭

pub mod classifier;
pub mod error;
pub mod retry_policy;
pub mod shutdown;

pub use classifier::{rule_for, Classification, DelayHint, FailureClassifier};
pub use error::{StoreError, TransitionError};
pub use retry_policy::{RetryConfig, RetryPolicy};
pub use shutdown::{ShutdownManager, ShutdownReason};
