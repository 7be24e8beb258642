// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! xpg - The database engine supervisor.
//!
//! Runs the engine for one data directory with continuous WAL archiving and
//! periodic base backups. Listens on `<socket-dir>/.xpg.skt` for `xpg_ctl`.
//!
//! Usage:
//!   xpg [engine flags] [--config-file <file>] [--inherit-lock <path>=<pid>]
//!   xpg archive <from> <to>

use std::fs;
use std::path::{Path, PathBuf};

use xpg_core::engine::read_format_version;
use xpg_core::restore::needs_restore;
use xpg_core::upgrade::UpgradePaths;
use xpg_core::{archive_file, env, ArchiveCopy, Config, EngineArgs, EnvOverrides, Error, Result};

mod control;
mod supervisor;

/// Log filename within the log directory.
const LOG_NAME: &str = "xpg.log";

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("archive") {
        std::process::exit(archive(&args[1..]));
    }

    let config = match EngineArgs::inspect(args)
        .and_then(|args| Config::resolve(args, EnvOverrides::from_env()))
        .and_then(preflight)
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("xpg: {e}");
            std::process::exit(1);
        }
    };

    setup_logging(log_path().as_deref());
    tracing::info!(
        data_dir = %config.data_dir.display(),
        socket_dir = %config.socket_dir.display(),
        port = config.port,
        "xpg starting"
    );

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let code = match runtime.block_on(supervisor::run(config)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{}", e);
            1
        }
    };
    tracing::info!(code, "xpg stopped");
    std::process::exit(code);
}

/// `xpg archive <from> <to>`, invoked by the engine's `archive_command`.
fn archive(args: &[String]) -> i32 {
    let [from, to] = args else {
        eprintln!("usage: xpg archive <from> <to>");
        return 1;
    };
    match archive_file(Path::new(from), Path::new(to)) {
        Ok(ArchiveCopy::Copied | ArchiveCopy::AlreadyPresent) => 0,
        Err(e) => {
            eprintln!("xpg archive: {e}");
            1
        }
    }
}

/// Refuse to start on a data directory that cannot be brought up.
fn preflight(config: Config) -> Result<Config> {
    if needs_restore(&config) || UpgradePaths::new(&config.data_dir).workspace.exists() {
        return Ok(config);
    }
    if !config.data_dir.is_dir() {
        return Err(Error::MissingDataDir(config.data_dir.display().to_string()));
    }
    read_format_version(&config.data_dir)?;
    Ok(config)
}

fn log_path() -> Option<PathBuf> {
    let dir = env::log_dir().or_else(|| dirs::state_dir().map(|d| d.join("xpg")))?;
    fs::create_dir_all(&dir).ok()?;
    Some(dir.join(LOG_NAME))
}

fn setup_logging(log_path: Option<&Path>) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Try to open log file, fall back to stderr
    let file = log_path.and_then(|path| {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    if let Some(file) = file {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(file)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
