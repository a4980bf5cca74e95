//! 以子进程方式启动流水线
//!
//! 流水线运行在自己的进程组中，终止时对整个组发信号，执行器派生的子进程不会遗留。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use crate::supervisor::{PipelineHandle, PipelineLauncher};

#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl PipelineLauncher for ProcessLauncher {
    async fn launch(&self) -> anyhow::Result<Box<dyn PipelineHandle>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        Ok(Box::new(ChildHandle::new(child)))
    }
}

pub struct ChildHandle {
    child: Child,
    pgid: Option<i32>,
}

impl ChildHandle {
    pub fn new(child: Child) -> Self {
        let pgid = child.id().map(|pid| pid as i32);
        Self { child, pgid }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: Signal) {
        if let Some(pgid) = self.pgid {
            if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
                tracing::debug!(pgid, ?signal, "killpg failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl PipelineHandle for ChildHandle {
    fn pid(&self) -> Option<u32> {
        self.pgid.map(|pgid| pgid as u32)
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(?status, "pipeline process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("failed to poll pipeline process: {}", e);
                true
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            self.signal_group(Signal::SIGTERM);
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                // 领头进程退出后组内可能仍有残留
                self.signal_group(Signal::SIGKILL);
                return Ok(());
            }
            tracing::warn!(grace_secs = grace.as_secs(), "pipeline ignored SIGTERM, killing group");
            self.signal_group(Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = grace;

        self.child.start_kill().ok();
        self.child.wait().await?;
        Ok(())
    }
}
