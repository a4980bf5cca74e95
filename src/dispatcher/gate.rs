//! 上游健康闸门
//!
//! 上游不健康（如主干 CI 红了）时 worker 不认领新任务，已在执行的尝试不受影响。
//! 核心只需要一个布尔信号，具体检查由外部命令完成：退出码 0 即健康。

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::UpstreamSection;

#[async_trait]
pub trait UpstreamGate: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

/// 未配置检查时使用
pub struct AlwaysHealthy;

#[async_trait]
impl UpstreamGate for AlwaysHealthy {
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// 运行外部命令判断上游是否健康，结果缓存 cache_ttl
pub struct CommandGate {
    program: String,
    args: Vec<String>,
    cache_ttl: Duration,
    timeout: Duration,
    cached: Mutex<Option<(Instant, bool)>>,
}

impl CommandGate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cache_ttl: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
            cached: Mutex::new(None),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 输出被捕获到 debug 日志，不混入调度进程自己的 stdout/stderr
    async fn run_check(&self) -> bool {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) => {
                tracing::debug!(
                    program = %self.program,
                    code = ?output.status.code(),
                    stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "upstream check finished"
                );
                output.status.success()
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %self.program, error = %e, "upstream check failed to run");
                false
            }
            Err(_) => {
                tracing::warn!(program = %self.program, "upstream check timed out");
                false
            }
        }
    }
}

#[async_trait]
impl UpstreamGate for CommandGate {
    async fn is_healthy(&self) -> bool {
        // 持锁期间完成检查，多个 worker 同时到期时只跑一次
        let mut cached = self.cached.lock().await;
        if let Some((at, healthy)) = *cached {
            if at.elapsed() < self.cache_ttl {
                return healthy;
            }
        }
        let healthy = self.run_check().await;
        if !healthy {
            tracing::warn!("upstream is unhealthy, holding new claims");
        }
        *cached = Some((Instant::now(), healthy));
        healthy
    }
}

/// 按配置创建闸门
pub fn create_gate(config: &UpstreamSection) -> Box<dyn UpstreamGate> {
    match &config.command {
        Some(program) => Box::new(
            CommandGate::new(program.clone(), config.args.clone())
                .with_cache_ttl(Duration::from_secs(config.cache_secs))
                .with_timeout(Duration::from_secs(config.timeout_secs.max(1))),
        ),
        None => Box::new(AlwaysHealthy),
    }
}
