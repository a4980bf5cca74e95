//! 外部命令执行器
//!
//! 以独立进程组启动配置的程序，任务信息通过 HIVE_TASK_* 环境变量传入；
//! 退出码 0 视为成功（stdout 为输出），否则失败（stderr + stdout 尾部为错误文本）。
//! 网关超时会丢弃 launch future，此时 ProcessGroupGuard 负责杀掉整个进程组。

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::executor::{Executor, ExecutorReport};
use crate::task::Task;

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// 输出最大保留字节数
const MAX_OUTPUT_BYTES: usize = 64_000;

/// 进程组守卫：drop 时若仍处于 armed 状态则 SIGKILL 整个进程组
struct ProcessGroupGuard {
    pgid: Option<i32>,
}

impl ProcessGroupGuard {
    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(pgid) = self.pgid.take() {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    }
}

/// 运行外部程序的执行器
pub struct CommandExecutor {
    name: String,
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    fn build_command(&self, task: &Task) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("HIVE_TASK_ID", &task.id)
            .env("HIVE_TASK_TYPE", task.task_type.as_str())
            .env("HIVE_TASK_DIRECTION", &task.direction)
            .env("HIVE_TASK_ATTEMPT", task.attempt_count.to_string())
            .env(
                "HIVE_TASK_CONTEXT",
                task.context
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_default(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn launch(&self, task: &Task) -> anyhow::Result<ExecutorReport> {
        tracing::info!(executor = %self.name, program = %self.program, task_id = %task.id, "launching executor");

        let child = self.build_command(task).spawn()?;
        let mut guard = ProcessGroupGuard {
            pgid: child.id().map(|pid| pid as i32),
        };
        let output = child.wait_with_output().await?;
        guard.disarm();

        let stdout = truncate_tail(&output.stdout);
        let stderr = truncate_tail(&output.stderr);
        if output.status.success() {
            return Ok(ExecutorReport::success(stdout));
        }

        let mut error = format!("exit {:?}", output.status.code());
        if !stderr.trim().is_empty() {
            error.push_str("\nstderr: ");
            error.push_str(stderr.trim());
        }
        if !stdout.trim().is_empty() {
            error.push_str("\nstdout: ");
            error.push_str(stdout.trim());
        }
        Ok(ExecutorReport {
            success: false,
            output: stdout,
            error: Some(error),
        })
    }
}

/// 保留输出尾部，按 UTF-8 字符边界截断
fn truncate_tail(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_OUTPUT_BYTES {
        return String::from_utf8_lossy(bytes).to_string();
    }
    let mut start = bytes.len() - MAX_OUTPUT_BYTES;
    while start < bytes.len() && (bytes[start] & 0xC0) == 0x80 {
        start += 1;
    }
    format!("[truncated]...{}", String::from_utf8_lossy(&bytes[start..]))
}
