//! 任务：数据模型与状态机

pub mod model;
pub mod state;

pub use model::{
    failure_excerpt, now_ms, FailureCategory, NewTask, RetryReflection, Task, TaskFilter, TaskId,
    TaskStatus, TaskType, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE,
};
pub use state::{Applied, Decision, Reclaimed, Resolution};
