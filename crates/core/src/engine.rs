// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Driving the database engine and its command-line tools.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use nix::sys::signal::Signal;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fsutil::{write_atomic, POLL_INTERVAL};
use crate::layout;
use crate::process::{run_checked, ExitStatus, ProcessHandle};

/// First `major[.minor]` number in a version banner.
static VERSION_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| match Regex::new(r"(\d+)(?:\.(\d+))?") {
        Ok(re) => re,
        Err(_) => unreachable!("static regex pattern"),
    });

/// Lines of `postmaster.pid` kept when adopting an engine; later lines
/// describe the shared-memory segment of the previous run.
const PID_FILE_KEPT_LINES: usize = 6;

/// Idle sessions are cut before a stop so it does not wait on them.
const TERMINATE_IDLE_SQL: &str = "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
     WHERE pid <> pg_backend_pid() AND state = 'idle'";

/// On-disk format version of a data directory, as in `PG_VERSION`.
///
/// Engines before 10 use `major.minor` (`9.6`); later ones only `major`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: Option<u32>,
}

impl FormatVersion {
    pub fn new(major: u32, minor: Option<u32>) -> Self {
        let minor = if major >= 10 { None } else { minor };
        FormatVersion { major, minor }
    }

    /// Parse the version out of a banner such as `postgres (PostgreSQL) 16.2`.
    pub fn from_banner(banner: &str) -> Result<Self> {
        let caps = VERSION_NUMBER
            .captures(banner)
            .ok_or_else(|| Error::InvalidVersion(banner.trim().to_string()))?;
        let number = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
        let major = number(1).ok_or_else(|| Error::InvalidVersion(banner.trim().to_string()))?;
        Ok(FormatVersion::new(major, number(2)))
    }

    /// Recovery is requested with `recovery.signal` rather than `recovery.conf`.
    pub fn uses_recovery_signal(&self) -> bool {
        self.major >= 12
    }

    /// Name of the WAL streaming tool shipped with this engine.
    pub fn receiver_tool(&self) -> &'static str {
        if self.major >= 10 {
            "pg_receivewal"
        } else {
            "pg_receivexlog"
        }
    }

    /// Whether the base-backup tool understands `-X none`.
    pub fn supports_wal_method_none(&self) -> bool {
        self.major >= 10
    }
}

impl FromStr for FormatVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, Some(minor)),
            None => (s, None),
        };
        let invalid = || Error::InvalidVersion(s.to_string());
        let major = major.parse().map_err(|_| invalid())?;
        let minor = minor
            .map(|m| m.parse().map_err(|_| invalid()))
            .transpose()?;
        Ok(FormatVersion::new(major, minor))
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.minor {
            Some(minor) => write!(f, "{}.{}", self.major, minor),
            None => write!(f, "{}", self.major),
        }
    }
}

/// Read `PG_VERSION` from a data directory.
pub fn read_format_version(data_dir: &Path) -> Result<FormatVersion> {
    let path = data_dir.join(layout::VERSION_FILE);
    match fs::read_to_string(&path) {
        Ok(text) => text.parse(),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            Err(Error::MissingFormatMarker(path.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Locates engine binaries, in `bin_dir` or on `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tools {
    bin_dir: Option<PathBuf>,
}

impl Tools {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        Tools { bin_dir }
    }

    pub fn path(&self, tool: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    /// A command for `tool` with stdin closed.
    pub fn command(&self, tool: &str) -> Command {
        let mut command = Command::new(self.path(tool));
        command.stdin(Stdio::null());
        command
    }
}

/// How to launch one engine instance.
#[derive(Debug, Clone)]
pub struct Launch<'a> {
    pub data_dir: &'a Path,
    pub port: u16,
    pub socket_dir: &'a Path,
    /// Accept TCP connections; false restricts the engine to its socket.
    pub listen: bool,
    pub extra: &'a [String],
}

/// One installed engine version and the policy for stopping it.
#[derive(Debug, Clone)]
pub struct Engine {
    tools: Tools,
    stop_timeout: Duration,
    role: Option<String>,
}

impl Engine {
    pub fn new(tools: Tools, stop_timeout: Duration) -> Self {
        Engine {
            tools,
            stop_timeout,
            role: None,
        }
    }

    /// The current engine as configured.
    pub fn current(config: &Config) -> Self {
        Engine::new(Tools::new(config.bin_dir.clone()), config.stop_timeout)
            .with_role(config.role.clone())
    }

    /// The engine that wrote on-disk format `version`.
    pub fn previous(config: &Config, version: FormatVersion) -> Self {
        Engine::new(
            Tools::new(Some(config.old_bin_dir(version))),
            config.stop_timeout,
        )
        .with_role(config.role.clone())
    }

    pub fn with_role(mut self, role: Option<String>) -> Self {
        self.role = role;
        self
    }

    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Append `-U <role>` when connecting as a specific role.
    pub fn connect_as(&self, command: &mut Command) {
        if let Some(role) = &self.role {
            command.arg("-U").arg(role);
        }
    }

    /// Version of this engine's server binary.
    pub async fn version(&self) -> Result<FormatVersion> {
        let output = self
            .tools
            .command("postgres")
            .arg("-V")
            .output()
            .await
            .map_err(|source| Error::Spawn {
                tool: "postgres".to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(Error::ToolFailed {
                tool: "postgres".to_string(),
                status: ExitStatus::from(output.status).code(),
            });
        }
        FormatVersion::from_banner(&String::from_utf8_lossy(&output.stdout))
    }

    pub fn start(&self, launch: &Launch<'_>) -> Result<ProcessHandle> {
        let mut command = self.tools.command("postgres");
        command
            .arg("-D")
            .arg(launch.data_dir)
            .arg("-p")
            .arg(launch.port.to_string())
            .arg("-k")
            .arg(launch.socket_dir);
        if !launch.listen {
            command.arg("-c").arg("listen_addresses=");
        }
        command.args(launch.extra);
        info!(
            data_dir = %launch.data_dir.display(),
            port = launch.port,
            listen = launch.listen,
            "starting engine"
        );
        ProcessHandle::spawn("postgres", &mut command)
    }

    /// Signal the engine and wait; escalate to SIGQUIT after the stop timeout.
    pub async fn stop(&self, handle: &ProcessHandle, signal: Signal) -> ExitStatus {
        if let Err(e) = handle.signal(signal) {
            warn!(error = %e, ?signal, "failed to signal engine");
        }
        if let Some(status) = handle.wait_timeout(self.stop_timeout).await {
            return status;
        }
        warn!(timeout = ?self.stop_timeout, "engine did not stop in time, sending SIGQUIT");
        if let Err(e) = handle.signal(Signal::SIGQUIT) {
            warn!(error = %e, "failed to signal engine");
        }
        handle.wait().await
    }

    /// Disconnect idle client sessions so a stop is not held up by them.
    pub async fn terminate_idle_connections(&self, socket_dir: &Path, port: u16) -> Result<()> {
        let mut command = self.tools.command("psql");
        command
            .arg("-X")
            .arg("-q")
            .arg("-h")
            .arg(socket_dir)
            .arg("-p")
            .arg(port.to_string())
            .arg("-d")
            .arg("postgres")
            .arg("-c")
            .arg(TERMINATE_IDLE_SQL)
            .stdout(Stdio::null());
        self.connect_as(&mut command);
        run_checked("psql", &mut command).await
    }

    /// Poll until the engine accepts connections.
    pub async fn wait_ready(&self, handle: &ProcessHandle, socket_dir: &Path, port: u16) -> Result<()> {
        loop {
            if handle.try_status().is_some() {
                return Err(Error::ExitedEarly(handle.name().to_string()));
            }
            let mut command = self.tools.command("pg_isready");
            command
                .arg("-q")
                .arg("-h")
                .arg(socket_dir)
                .arg("-p")
                .arg(port.to_string());
            self.connect_as(&mut command);
            match command.status().await {
                Ok(status) if status.success() => {
                    debug!(port, "engine is ready");
                    return Ok(());
                }
                Ok(_) => {}
                Err(source) => {
                    return Err(Error::Spawn {
                        tool: "pg_isready".to_string(),
                        source,
                    })
                }
            }
            tokio::select! {
                _ = handle.wait() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    /// Consistency check of the cluster control file.
    pub async fn check_control_data(&self, data_dir: &Path) -> Result<()> {
        let mut command = self.tools.command("pg_controldata");
        command.arg(data_dir).stdout(Stdio::null());
        run_checked("pg_controldata", &mut command).await
    }
}

/// Point `postmaster.pid` at `pid` and drop its shared-memory lines.
///
/// Returns false if there is no pid file.
pub fn sanitize_pid_file(data_dir: &Path, pid: u32) -> Result<bool> {
    let path = data_dir.join(layout::PID_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let mut lines: Vec<String> = text
        .lines()
        .take(PID_FILE_KEPT_LINES)
        .map(str::to_string)
        .collect();
    match lines.first_mut() {
        Some(first) => *first = pid.to_string(),
        None => lines.push(pid.to_string()),
    }
    let mut contents = lines.join("\n");
    contents.push('\n');
    write_atomic(&path, contents.as_bytes())?;
    debug!(path = %path.display(), pid, "sanitized pid file");
    Ok(true)
}

/// A pid file naming no process, so status tools report "not running" while
/// nothing may start an engine in `data_dir`.
pub fn write_synthetic_pid_file(data_dir: &Path) -> Result<()> {
    let contents = format!("0\n{}\n", data_dir.display());
    write_atomic(&data_dir.join(layout::PID_FILE), contents.as_bytes())
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
