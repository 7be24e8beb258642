// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

use thiserror::Error;

/// All errors `xpg_ctl` reports.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] xpg_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not take {0}\n  hint: another xpg_ctl or supervisor is busy; retry shortly")]
    Busy(String),

    #[error("failed to start {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("supervisor exited with status {0} while starting\n  hint: see the server log")]
    SupervisorExited(i32),

    #[error("supervisor did not start within {0} seconds\n  hint: see the server log")]
    StartTimeout(u64),

    #[error("unbalanced quotes in engine options: {0}")]
    Options(String),
}

/// A specialized Result type for `xpg_ctl` operations.
pub type Result<T> = std::result::Result<T, Error>;
