//! 后台监控进程的生命周期管理。
//!
//! 同一时间最多跟踪一个子进程，其 stdout 与 stderr 写入共享日志文件，由日志流接口跟随读取。

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

/// 启动监控进程的程序与参数。
#[derive(Clone, Debug)]
pub struct MonitorCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl MonitorCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// 以 `monitor` 子命令重新调用当前可执行文件。
    pub fn current_exe(data_dir: &Path) -> io::Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::new(
            program,
            [
                OsString::from("--data-dir"),
                data_dir.as_os_str().to_os_string(),
                OsString::from("monitor"),
            ],
        ))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug)]
pub struct MonitorSession {
    child: Mutex<Option<Child>>,
    command: MonitorCommand,
    log_path: PathBuf,
    stop_grace: Duration,
}

impl MonitorSession {
    pub fn new(command: MonitorCommand, log_path: PathBuf, stop_grace: Duration) -> Self {
        Self {
            child: Mutex::new(None),
            command,
            log_path,
            stop_grace,
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// 子进程已退出时顺带回收。
    pub async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        poll_child(&mut slot)
    }

    /// 若没有存活的监控进程，清空日志并启动新进程。
    pub async fn start(&self) -> io::Result<StartOutcome> {
        let mut slot = self.child.lock().await;
        if poll_child(&mut slot) {
            return Ok(StartOutcome::AlreadyRunning);
        }

        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = tokio::fs::File::create(&self.log_path)
            .await?
            .into_std()
            .await;
        let log_err = log.try_clone()?;
        let child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()?;
        info!(pid = child.id(), log = %self.log_path.display(), "monitor started");
        *slot = Some(child);
        Ok(StartOutcome::Started)
    }

    /// 先发送 SIGTERM，超过宽限期后 SIGKILL。返回是否停止了存活进程。
    pub async fn stop(&self) -> io::Result<bool> {
        let mut slot = self.child.lock().await;
        if !poll_child(&mut slot) {
            return Ok(false);
        }
        let Some(mut child) = slot.take() else {
            return Ok(false);
        };

        if let Err(err) = terminate(&mut child) {
            warn!(error = %err, "failed to signal monitor");
        }
        match timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => info!(%status, "monitor stopped"),
            Ok(Err(err)) => warn!(error = %err, "failed to wait for monitor"),
            Err(_) => {
                warn!(
                    grace_secs = self.stop_grace.as_secs(),
                    "monitor ignored SIGTERM, killing"
                );
                child.kill().await?;
            }
        }
        Ok(true)
    }
}

fn poll_child(slot: &mut Option<Child>) -> bool {
    let Some(child) = slot.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            info!(%status, "monitor exited");
            *slot = None;
            false
        }
        Err(err) => {
            warn!(error = %err, "failed to poll monitor");
            *slot = None;
            false
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}
