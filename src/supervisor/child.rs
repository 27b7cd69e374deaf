//! The supervised child process.

use super::signals::{send_signal, signal_name};
use crate::error::{LockrunError, Result};
use crate::exit_codes;
use crate::heartbeat::{CHANNEL_FD_ENV, ChildEnd};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How the child ended, or why its status could not be read.
pub type ExitOutcome = std::result::Result<ExitStatus, String>;

/// Handle to a running child. Clones observe the same process.
///
/// A background task owns the OS handle and reaps the child, so exit is
/// observed even while nobody is waiting.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    pid: u32,
    status: watch::Receiver<Option<ExitOutcome>>,
}

impl ChildProcess {
    /// Start `command` with inherited stdio.
    ///
    /// With a heartbeat channel, its descriptor number is exported in
    /// `LOCKRUN_CHANNEL_FD`.
    pub fn spawn(command: &[String], channel: Option<&ChildEnd>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| LockrunError::ChildProcess("no command given".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(end) = channel {
            cmd.env(CHANNEL_FD_ENV, end.raw_fd().to_string());
        }

        let mut child = cmd.spawn().map_err(|e| {
            LockrunError::ChildProcess(format!("failed to spawn '{}': {}", program, e))
        })?;
        let pid = child.id().ok_or_else(|| {
            LockrunError::ChildProcess(format!("'{}' exited before it could be tracked", program))
        })?;

        let (tx, status) = watch::channel(None);
        tokio::spawn(async move {
            let outcome = child.wait().await.map_err(|e| e.to_string());
            let _ = tx.send(Some(outcome));
        });

        info!(pid, command = %command.join(" "), "child started");
        Ok(Self { pid, status })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.status.borrow().is_some()
    }

    /// Wait for the child to exit. Cancel-safe.
    pub async fn wait(&self) -> ExitOutcome {
        let mut status = self.status.clone();
        match status.wait_for(Option::is_some).await {
            Ok(outcome) => match &*outcome {
                Some(outcome) => outcome.clone(),
                None => Err("child status unavailable".to_string()),
            },
            Err(_) => Err("child reaper stopped".to_string()),
        }
    }

    /// SIGTERM, then SIGKILL if the child outlives `timeout`.
    ///
    /// Does nothing if the child has already been seen to exit.
    pub async fn terminate(&self, timeout: Duration) -> Result<()> {
        if self.has_exited() {
            debug!(pid = self.pid, "child already exited");
            return Ok(());
        }

        info!(pid = self.pid, "sending SIGTERM to child");
        self.signal(libc::SIGTERM)?;
        if tokio::time::timeout(timeout, self.wait()).await.is_ok() {
            return Ok(());
        }

        warn!(
            pid = self.pid,
            timeout_secs = timeout.as_secs(),
            "child still running after SIGTERM, sending SIGKILL"
        );
        self.signal(libc::SIGKILL)?;
        let _ = self.wait().await;
        Ok(())
    }

    fn signal(&self, signal: i32) -> Result<()> {
        send_signal(self.pid, signal).map_err(|e| {
            LockrunError::ChildProcess(format!(
                "failed to send {} to child {}: {}",
                signal_name(signal).unwrap_or_else(|| signal.to_string()),
                self.pid,
                e
            ))
        })
    }
}

/// The exit code lockrun reports for a child's status: the child's own
/// code, or `128 + n` if signal `n` killed it.
pub fn exit_code_for(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => exit_codes::for_signal(signal),
        (None, None) => exit_codes::CHILD_FAILURE,
    }
}
