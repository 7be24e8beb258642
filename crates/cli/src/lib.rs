// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! xpg_ctl - Front-end for the `xpg` supervisor.
//!
//! `start`, `stop` and `restart` are served by the supervisor over its
//! control socket, so any number of clients can share one running engine.
//! Every other action, and `stop`/`restart` when no supervisor is running,
//! is handed to `pg_ctl`.

mod cli;
pub mod error;
pub mod frontend;
pub mod options;
pub mod passthrough;

pub use cli::{Cli, Command, ServerArgs};
pub use error::{Error, Result};

use xpg_core::{env, Tools};

/// Run `command` to completion and return the process exit code.
///
/// `raw` is the unparsed argument list, handed to `pg_ctl` on fallback.
pub fn run(command: Command, raw: Vec<String>) -> Result<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(dispatch(command, raw))
}

async fn dispatch(command: Command, raw: Vec<String>) -> Result<i32> {
    match command {
        Command::Start(args) => frontend::start(&args, &frontend::supervisor_binary()).await,
        Command::Stop(args) => frontend::stop(&args, &raw).await,
        Command::Restart(args) => frontend::restart(&args, &raw).await,
        Command::Other(argv) => passthrough::pg_ctl(&Tools::new(env::bin_dir()), &argv).await,
    }
}

/// Log warnings and errors to stderr; `RUST_LOG` overrides.
pub fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
