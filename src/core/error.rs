//! 错误类型
//!
//! - TransitionError：状态机拒绝的转换（调用方错误，对外映射为 409）
//! - StoreError：存储层错误（基础设施错误，由看门狗的重启逻辑兜底）

use thiserror::Error;

use crate::task::TaskStatus;

/// 非法状态转换
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("cannot {action} a task in status '{from}'")]
    Illegal { action: &'static str, from: TaskStatus },

    #[error("task is held by {holder:?}, not by worker '{worker}'")]
    NotHolder {
        worker: String,
        holder: Option<String>,
    },

    #[error("resolution must be 'pending' or 'failed', got '{0}'")]
    InvalidResolution(TaskStatus),
}

/// 任务存储错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}
