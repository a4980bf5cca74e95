//! Hive - 任务编排核心
//!
//! 模块划分：
//! - **task**: 任务数据模型与纯状态机转换
//! - **store**: 持久化任务存储（SQLite / 内存），认领为原子条件更新
//! - **core**: 失败分类、重试策略、错误类型、优雅关闭
//! - **executor**: 执行器契约、注册表与带超时审计的网关
//! - **dispatcher**: worker 池、reaper、上游健康闸门
//! - **supervisor**: 进程外看门狗（崩溃 / 无响应 / 版本过期 / 卡死重启）
//! - **monitor**: 吞吐量、成功率与未决问题排序
//! - **notify**: 终态通知出口
//! - **api**: axum HTTP 接口
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 初始化

pub mod api;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod executor;
pub mod monitor;
pub mod notify;
pub mod observability;
pub mod store;
pub mod supervisor;
pub mod task;

pub use store::{create_task_store, TaskStore};
pub use task::{NewTask, Task, TaskStatus, TaskType};
