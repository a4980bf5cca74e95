//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__DISPATCHER__WORKERS=8`）。
//! 每个字段都有默认值，空配置也能运行。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::task::TaskType;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub store: StoreSection,
    pub dispatcher: DispatcherSection,
    pub reaper: ReaperSection,
    pub retry: RetrySection,
    pub executor: ExecutorSection,
    /// 按 task_type 注册的外部执行器，如 [executors.impl]
    pub executors: HashMap<String, ExecutorEntry>,
    pub upstream: UpstreamSection,
    pub web: WebSection,
    pub supervisor: SupervisorSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 当前运行代码的版本标识，写入流水线标记；未设置时用包版本
    pub version: Option<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            version: None,
        }
    }
}

impl AppSection {
    pub fn running_version(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }
}

/// [store] 段：sqlite / memory
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: String,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: PathBuf::from("data/hive.db"),
        }
    }
}

/// [dispatcher] 段：worker 数量、能力过滤、轮询间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub workers: usize,
    /// 只认领这些类型的任务；为空表示全部
    pub task_types: Vec<String>,
    pub poll_interval_ms: u64,
    /// 每次轮询最多取多少个候选任务
    pub claim_batch: usize,
    /// 执行期间刷新 updated_at 的间隔（秒），须小于 reaper.stale_after_secs
    pub heartbeat_secs: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            workers: 4,
            task_types: Vec::new(),
            poll_interval_ms: 2_000,
            claim_batch: 8,
            heartbeat_secs: 30,
        }
    }
}

impl DispatcherSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    /// 解析能力过滤，未知类型名记录警告后忽略
    pub fn capability_filter(&self) -> Vec<TaskType> {
        self.task_types
            .iter()
            .filter_map(|name| match name.parse::<TaskType>() {
                Ok(t) => Some(t),
                Err(e) => {
                    tracing::warn!("ignoring dispatcher.task_types entry: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// [reaper] 段：回收失联任务、needs_decision 过期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaperSection {
    pub interval_secs: u64,
    /// claimed / running 任务超过该时长未更新即视为失联
    pub stale_after_secs: u64,
    /// needs_decision 最长等待时间，0 表示永不过期
    pub needs_decision_ttl_secs: u64,
}

impl Default for ReaperSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stale_after_secs: 600,
            needs_decision_ttl_secs: 86_400,
        }
    }
}

/// [retry] 段：尝试上限与延迟
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub default_max_attempts: u32,
    /// 按 task_type 覆盖尝试上限，如 { review = 2 }
    pub max_attempts_by_type: HashMap<String, u32>,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub generic_delay_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            max_attempts_by_type: HashMap::new(),
            base_backoff_secs: 5,
            max_backoff_secs: 300,
            generic_delay_secs: 30,
        }
    }
}

/// [executor] 段：单次尝试的默认墙钟超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub default_timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 1_800,
        }
    }
}

/// [executors.<task_type>] 段：外部执行器程序
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorEntry {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// 覆盖 executor.default_timeout_secs
    pub timeout_secs: Option<u64>,
}

/// [upstream] 段：上游健康闸门（如主干 CI 状态），未配置命令时视为健康
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub command: Option<String>,
    pub args: Vec<String>,
    /// 检查结果缓存时间（秒）
    pub cache_secs: u64,
    pub timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            cache_secs: 60,
            timeout_secs: 30,
        }
    }
}

/// [web] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub bind: String,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// [supervisor] 段：看门狗进程的探测与重启预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    /// 被看护的流水线程序（默认为 hive 二进制）
    pub program: String,
    pub args: Vec<String>,
    pub health_url: String,
    pub probe_interval_secs: u64,
    pub probe_timeout_secs: u64,
    /// 连续多少次探测失败判定为无响应
    pub max_probe_failures: u32,
    /// 每次启动后的宽限期，期间不做探测 / 心跳判定
    pub startup_grace_secs: u64,
    /// 流水线标记心跳超过该时长未刷新判定为卡死
    pub heartbeat_stale_secs: u64,
    /// 已部署版本文件（首行为版本号）；未设置时不做版本比对
    pub version_file: Option<PathBuf>,
    pub max_restarts: u32,
    /// 连续健康多久后清零重启计数
    pub healthy_reset_secs: u64,
    /// SIGTERM 之后等待多久再 SIGKILL
    pub stop_grace_secs: u64,
    pub state_file: PathBuf,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            program: "hive".to_string(),
            args: Vec::new(),
            health_url: "http://127.0.0.1:8080/health".to_string(),
            probe_interval_secs: 15,
            probe_timeout_secs: 5,
            max_probe_failures: 3,
            startup_grace_secs: 30,
            heartbeat_stale_secs: 300,
            version_file: None,
            max_restarts: 5,
            healthy_reset_secs: 600,
            stop_grace_secs: 10,
            state_file: PathBuf::from("data/supervisor.json"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path).required(false));
        } else {
            tracing::warn!("config file {:?} not found, ignoring", path);
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
