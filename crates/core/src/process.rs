// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Spawned subprocesses with an awaitable, shareable exit status.

use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Exit status of a supervised process.
///
/// 0 is a clean exit; a plain exit code is kept as is; death by signal is
/// reported as `128 + signo`; [`ExitStatus::ABNORMAL`] means the status could
/// not be collected at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus(i32);

impl ExitStatus {
    pub const ABNORMAL: ExitStatus = ExitStatus(-1);

    pub fn code(&self) -> i32 {
        self.0
    }

    pub fn success(&self) -> bool {
        self.0 == 0
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            ExitStatus(code)
        } else if let Some(signal) = status.signal() {
            ExitStatus(128 + signal)
        } else {
            ExitStatus::ABNORMAL
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to a spawned subprocess.
///
/// Cloning is cheap; every clone observes the same exit status. The child is
/// reaped by a background task, so any number of callers may [`wait`] at once.
///
/// [`wait`]: ProcessHandle::wait
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: Arc<str>,
    pid: Option<u32>,
    status: watch::Receiver<Option<ExitStatus>>,
}

impl ProcessHandle {
    /// Spawn `command`, naming it `name` in logs and errors.
    pub fn spawn(name: &str, command: &mut Command) -> Result<Self> {
        let child = command.spawn().map_err(|source| Error::Spawn {
            tool: name.to_string(),
            source,
        })?;
        Ok(Self::from_child(name, child))
    }

    /// Take over an already spawned child (e.g. after claiming its pipes).
    pub fn from_child(name: &str, mut child: Child) -> Self {
        let name: Arc<str> = Arc::from(name);
        let pid = child.id();
        let (tx, rx) = watch::channel(None);

        let task_name = Arc::clone(&name);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus::from(status),
                Err(e) => {
                    warn!(process = %task_name, error = %e, "failed to collect exit status");
                    ExitStatus::ABNORMAL
                }
            };
            debug!(process = %task_name, %status, "process exited");
            let _ = tx.send(Some(status));
        });

        debug!(process = %name, ?pid, "process started");
        ProcessHandle {
            name,
            pid,
            status: rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit status, if the process has already exited.
    pub fn try_status(&self) -> Option<ExitStatus> {
        *self.status.borrow()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitStatus {
        let mut rx = self.status.clone();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status.unwrap_or(ExitStatus::ABNORMAL)
    }

    /// Wait at most `limit`; `None` if the process is still running.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<ExitStatus> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    /// Deliver `signal`. Does nothing once the process has exited.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.try_status().is_some() {
            return Ok(());
        }
        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return Ok(());
        };
        debug!(process = %self.name, ?signal, "signalling");
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run `command` to completion and fail unless it exits cleanly.
pub async fn run_checked(tool: &str, command: &mut Command) -> Result<()> {
    let status = command.status().await.map_err(|source| Error::Spawn {
        tool: tool.to_string(),
        source,
    })?;
    let status = ExitStatus::from(status);
    if !status.success() {
        return Err(Error::ToolFailed {
            tool: tool.to_string(),
            status: status.code(),
        });
    }
    Ok(())
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
