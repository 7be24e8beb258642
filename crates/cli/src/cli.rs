// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

/// Seconds to wait for the supervisor when `-t` is not given.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

const QUICKSTART_HELP: &str = "\
Examples:
  xpg_ctl start -D /srv/pg/data -l server.log   Start (or join) the supervisor
  xpg_ctl restart -D /srv/pg/data               Reload the engine configuration
  xpg_ctl stop -D /srv/pg/data                  Leave; the last client stops it
  xpg_ctl status -D /srv/pg/data                Anything else goes to pg_ctl";

#[derive(Parser)]
#[command(name = "xpg_ctl")]
#[command(version)]
#[command(about = "Start, stop and share a supervised database engine")]
#[command(after_help = QUICKSTART_HELP)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the supervisor, or register with the one already running
    Start(ServerArgs),

    /// Release this client; the last one stops the supervisor
    Stop(ServerArgs),

    /// Ask the engine to reload its configuration
    Restart(ServerArgs),

    /// Any other action is run by pg_ctl unchanged
    #[command(external_subcommand)]
    Other(Vec<String>),
}

/// Options shared by the actions the supervisor handles itself.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerArgs {
    /// Data directory (defaults to PGDATA)
    #[arg(short = 'D', long = "pgdata", value_name = "DATADIR")]
    pub data_dir: Option<PathBuf>,

    /// Options passed to the engine, as one shell-quoted string (repeatable)
    #[arg(
        short = 'o',
        long = "options",
        value_name = "OPTIONS",
        allow_hyphen_values = true
    )]
    pub options: Vec<String>,

    /// Append supervisor and engine output to this file
    #[arg(short = 'l', long = "log", value_name = "FILENAME")]
    pub log: Option<PathBuf>,

    /// Wait until the operation completes (default)
    #[arg(short = 'w', long = "wait", overrides_with = "no_wait")]
    pub wait: bool,

    /// Do not wait until the operation completes
    #[arg(short = 'W', long = "no-wait", overrides_with = "wait")]
    pub no_wait: bool,

    /// Seconds to wait when using -w
    #[arg(short = 't', long = "timeout", value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Shutdown mode, used when no supervisor is running
    #[arg(
        short = 'm',
        long = "mode",
        value_name = "MODE",
        value_parser = ["smart", "fast", "immediate", "s", "f", "i"]
    )]
    pub mode: Option<String>,

    /// Only print errors
    #[arg(short = 's', long = "silent")]
    pub silent: bool,
}

impl ServerArgs {
    pub fn waits(&self) -> bool {
        !self.no_wait
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
