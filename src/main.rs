//! Hive 流水线进程
//!
//! 同一进程内运行：worker 池、reaper（回收 + 标记心跳）、HTTP 接口。
//! 启动时写入流水线标记供看门狗判断版本与卡死；SIGTERM / Ctrl+C 触发优雅关闭。
//!
//! 用法：`hive [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::{
    api::{self, AppState},
    config::{load_config, AppConfig},
    core::{shutdown::drain_with_timeout, RetryConfig, RetryPolicy, ShutdownManager},
    dispatcher::{create_gate, write_pipeline_marker, Dispatcher, DispatcherConfig, Reaper},
    executor::{CommandExecutor, ExecutorGateway, ExecutorRegistry},
    monitor::Monitor,
    notify::LogNotifier,
    observability,
    store::create_task_store,
    task::TaskType,
};

/// 关闭时等待 worker 完成当前尝试的上限
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// 按配置注册外部执行器；未知类型名跳过并告警
fn build_registry(cfg: &AppConfig) -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    for (name, entry) in &cfg.executors {
        let task_type = match name.parse::<TaskType>() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!("ignoring executors.{}: {}", name, e);
                continue;
            }
        };
        let mut executor = CommandExecutor::new(name.clone(), &entry.program, entry.args.clone());
        if let Some(dir) = &entry.workdir {
            executor = executor.with_workdir(dir);
        }
        registry.register(task_type, executor);
        if let Some(secs) = entry.timeout_secs {
            registry.set_timeout(task_type, Duration::from_secs(secs));
        }
        tracing::info!(task_type = %task_type, program = %entry.program, "executor registered");
    }
    registry
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let version = cfg.app.running_version();
    tracing::info!(name = %cfg.app.name, version = %version, "starting pipeline");

    let store = create_task_store(&cfg.store).context("Failed to open task store")?;
    write_pipeline_marker(store.as_ref(), &version)
        .await
        .context("Failed to write pipeline marker")?;

    let registry = build_registry(&cfg);
    if registry.task_types().is_empty() {
        tracing::warn!("no executors configured; claimed tasks will fail with env_or_secrets");
    }
    let gateway = Arc::new(ExecutorGateway::new(
        registry,
        Duration::from_secs(cfg.executor.default_timeout_secs),
    ));
    let policy = Arc::new(RetryPolicy::new(RetryConfig::from(&cfg.retry)));
    let notifier = Arc::new(LogNotifier);

    let dispatcher_config = DispatcherConfig::from(&cfg.dispatcher);
    let workers = dispatcher_config.workers;
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::clone(&store),
            Arc::clone(&gateway),
            Arc::clone(&policy),
            notifier.clone(),
            dispatcher_config,
        )
        .with_gate(Arc::from(create_gate(&cfg.upstream))),
    );
    let reaper = Reaper::new(Arc::clone(&store), notifier.clone(), &cfg.reaper);
    let monitor = Monitor::new(Arc::clone(&store), reaper.stale_after())
        .with_version_file(cfg.supervisor.version_file.clone());

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let reaper_handle = tokio::spawn(reaper.run(shutdown.token()));
    let dispatcher_handle = tokio::spawn(Arc::clone(&dispatcher).run(shutdown.token()));

    let state = Arc::new(AppState {
        store: Arc::clone(&store),
        policy,
        monitor,
        version,
        workers,
        live_workers: dispatcher.gauge(),
    });
    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.web.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.web.bind))?;
    tracing::info!("Hive API: http://{}", cfg.web.bind);

    let token = shutdown.token();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(e) = &served {
        tracing::error!("http server failed: {}", e);
        shutdown.shutdown(hive::core::ShutdownReason::FatalError(e.to_string()));
    }

    drain_with_timeout(
        "dispatcher",
        async {
            dispatcher_handle.await.ok();
        },
        DRAIN_TIMEOUT,
    )
    .await;
    drain_with_timeout(
        "reaper",
        async {
            reaper_handle.await.ok();
        },
        Duration::from_secs(5),
    )
    .await;

    tracing::info!(reason = ?shutdown.reason(), "pipeline stopped");
    served.context("HTTP server failed")?;
    Ok(())
}
