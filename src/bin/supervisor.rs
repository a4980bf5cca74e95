//! Hive 看门狗进程
//!
//! 独立于流水线运行：启动 `supervisor.program`，周期性检查健康 / 版本 / 心跳，
//! 必要时终止整个进程组并重启。重启预算耗尽时写入 FatalIssue 并以非零码退出。
//!
//! 用法：`hive-supervisor [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::{
    config::load_config,
    core::ShutdownManager,
    notify::LogNotifier,
    observability,
    store::create_task_store,
    supervisor::{HttpHealthProbe, ProcessLauncher, Supervisor, SupervisorConfig, SupervisorState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let section = &cfg.supervisor;

    // 看门狗只读标记与写入 FatalIssue；存储打不开时仍可凭探测工作
    let store = match create_task_store(&cfg.store) {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!("task store unavailable, skipping marker checks: {}", e);
            None
        }
    };

    let state = SupervisorState::load(&section.state_file).context("Failed to load supervisor state")?;
    tracing::info!(
        program = %section.program,
        restart_count = state.restart_count,
        "supervisor starting"
    );

    let probe = HttpHealthProbe::new(
        &section.health_url,
        Duration::from_secs(section.probe_timeout_secs.max(1)),
    )
    .context("Failed to build health probe client")?;
    let launcher = ProcessLauncher::new(&section.program, section.args.clone());

    let supervisor = Supervisor::new(
        SupervisorConfig::from(section),
        store,
        Box::new(probe),
        Box::new(launcher),
        Arc::new(LogNotifier),
        state,
    );

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    if let Err(e) = supervisor.run(shutdown.token()).await {
        tracing::error!("supervisor exiting: {}", e);
        std::process::exit(1);
    }
    tracing::info!("supervisor stopped");
    Ok(())
}
