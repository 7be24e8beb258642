// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! `start`, `stop` and `restart` against the supervisor.
//!
//! Each action first looks for a supervisor on the control socket. `start`
//! spawns one when none answers, handing it the socket lock so no other
//! front-end can slip in between; `stop` and `restart` fall back to `pg_ctl`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use xpg_core::fsutil::{wait_for_path, POLL_INTERVAL};
use xpg_core::{env, Bequest, Config, EngineArgs, EnvOverrides, ExitStatus, NamedLock, Tools};
use xpg_ipc::{ControlClient, DecrefReply};

use crate::cli::ServerArgs;
use crate::error::{Error, Result};
use crate::options::split_options;
use crate::passthrough;

/// Name of the supervisor binary installed next to `xpg_ctl`.
const SUPERVISOR_NAME: &str = "xpg";

/// Configuration for `args` and the engine arguments to start a supervisor with.
pub fn resolve(args: &ServerArgs) -> Result<(Config, Vec<String>)> {
    let mut argv = Vec::new();
    if let Some(dir) = &args.data_dir {
        argv.push("-D".to_string());
        argv.push(dir.display().to_string());
    }
    for options in &args.options {
        argv.extend(split_options(options)?);
    }
    let config = Config::resolve(EngineArgs::inspect(argv.clone())?, EnvOverrides::from_env())?;
    if args.data_dir.is_none() {
        argv.splice(0..0, ["-D".to_string(), config.data_dir.display().to_string()]);
    }
    Ok((config, argv))
}

/// The `xpg` binary: `XPG_SUPERVISOR_BINARY`, next to this executable, or `PATH`.
pub fn supervisor_binary() -> PathBuf {
    if let Some(path) = env::supervisor_binary() {
        return path;
    }
    if let Ok(exe) = std::env::current_exe() {
        let sibling = exe.with_file_name(SUPERVISOR_NAME);
        if sibling.exists() {
            return sibling;
        }
    }
    PathBuf::from(SUPERVISOR_NAME)
}

fn say(args: &ServerArgs, message: &str) {
    if !args.silent {
        println!("{message}");
    }
}

/// Join the running supervisor, or start one.
pub async fn start(args: &ServerArgs, supervisor: &Path) -> Result<i32> {
    let (config, argv) = resolve(args)?;
    let mut ctl_lock = NamedLock::new(config.ctl_lock());
    if !ctl_lock.acquire_with_backoff(config.lock_attempts).await? {
        return Err(Error::Busy(ctl_lock.path().display().to_string()));
    }
    let result = start_locked(args, &config, &argv, supervisor).await;
    if let Err(e) = ctl_lock.remove() {
        warn!(error = %e, "failed to remove front-end lock");
    }
    result
}

async fn start_locked(
    args: &ServerArgs,
    config: &Config,
    argv: &[String],
    supervisor: &Path,
) -> Result<i32> {
    let socket = config.control_socket();
    if let Some(mut client) = ControlClient::connect(&socket).await? {
        match client.incref().await {
            Ok(()) => {
                say(args, "server already running; registered as another client");
                return Ok(0);
            }
            Err(e) => warn!(error = %e, "running supervisor refused a new client"),
        }
    }

    let mut socket_lock = NamedLock::new(config.socket_lock());
    if !socket_lock.acquire_with_backoff(config.lock_attempts).await? {
        return Err(Error::Busy(socket_lock.path().display().to_string()));
    }
    let bequest = socket_lock.bequest()?;
    let mut child = match spawn_supervisor(supervisor, &bequest, argv, args.log.as_deref()) {
        Ok(child) => child,
        Err(e) => {
            let _ = socket_lock.remove();
            return Err(e);
        }
    };
    let pid = child.id().unwrap_or_default();
    info!(pid, "spawned supervisor");

    let claimed = tokio::select! {
        claimed = socket_lock.bequeath(pid, config.lock_attempts) => claimed.map_err(Error::from),
        status = child.wait() => match status {
            Ok(status) => Err(Error::SupervisorExited(ExitStatus::from(status).code())),
            Err(e) => Err(e.into()),
        },
    };
    if let Err(e) = claimed {
        let _ = socket_lock.remove();
        return Err(e);
    }

    if !args.waits() {
        say(args, "server starting");
        return Ok(0);
    }
    say(args, "waiting for server to start...");
    let timeout = args.timeout();
    let attempts = u32::try_from(timeout.as_secs()).unwrap_or(u32::MAX);
    tokio::select! {
        ready = wait_for_path(&socket, attempts, POLL_INTERVAL) => {
            if ready.is_err() {
                return Err(Error::StartTimeout(timeout.as_secs()));
            }
        }
        status = child.wait() => {
            return Err(Error::SupervisorExited(ExitStatus::from(status?).code()));
        }
    }
    say(args, "server started");
    Ok(0)
}

/// Spawn `xpg` in its own process group so it outlives this front-end.
fn spawn_supervisor(
    path: &Path,
    bequest: &Bequest,
    argv: &[String],
    log: Option<&Path>,
) -> Result<Child> {
    let (stdout, stderr) = match log {
        Some(log) => {
            let file = fs::OpenOptions::new().create(true).append(true).open(log)?;
            (Stdio::from(file.try_clone()?), Stdio::from(file))
        }
        None => (Stdio::null(), Stdio::null()),
    };
    debug!(path = %path.display(), %bequest, ?argv, "spawning supervisor");
    Command::new(path)
        .arg("--inherit-lock")
        .arg(bequest.to_arg())
        .args(argv)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0)
        .spawn()
        .map_err(|source| Error::Spawn {
            path: path.display().to_string(),
            source,
        })
}

/// Release this client's reference; with no supervisor, run `pg_ctl stop`.
pub async fn stop(args: &ServerArgs, raw: &[String]) -> Result<i32> {
    let (config, _) = resolve(args)?;
    match ControlClient::connect(&config.control_socket()).await? {
        Some(client) => {
            match client.decref().await? {
                DecrefReply::Released => say(args, "server still in use by other clients"),
                DecrefReply::Stopped => say(args, "server stopped"),
            }
            Ok(0)
        }
        None => {
            info!("no supervisor listening, delegating to pg_ctl");
            passthrough::pg_ctl(&Tools::new(config.bin_dir.clone()), raw).await
        }
    }
}

/// Relay a reload to the supervisor; with none, run `pg_ctl restart`.
pub async fn restart(args: &ServerArgs, raw: &[String]) -> Result<i32> {
    let (config, _) = resolve(args)?;
    match ControlClient::connect(&config.control_socket()).await? {
        Some(mut client) => {
            client.restart().await?;
            say(args, "server reloaded");
            Ok(0)
        }
        None => {
            info!("no supervisor listening, delegating to pg_ctl");
            passthrough::pg_ctl(&Tools::new(config.bin_dir.clone()), raw).await
        }
    }
}

#[cfg(test)]
#[path = "frontend_tests.rs"]
mod tests;
