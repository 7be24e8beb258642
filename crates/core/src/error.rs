// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Error types for xpg-core operations.

use thiserror::Error;

/// All possible errors that can occur in xpg-core operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("data directory not found: {0}\n  hint: pass -D <dir> or set PGDATA")]
    MissingDataDir(String),

    #[error("no data directory given\n  hint: pass -D <dir> or set PGDATA")]
    NoDataDir,

    #[error("missing format marker: {0}\n  hint: the data directory was not created by initdb")]
    MissingFormatMarker(String),

    #[error("invalid format version: '{0}'")]
    InvalidVersion(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid lock inheritance entry: '{0}'\n  hint: expected <path>=<pid>")]
    InvalidBequest(String),

    #[error("lock is not held: {0}")]
    LockNotHeld(String),

    #[error("lock is held by another process: {0}")]
    LockBusy(String),

    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed with exit status {status}")]
    ToolFailed { tool: String, status: i32 },

    #[error("{0} exited before it became ready")]
    ExitedEarly(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("archive size mismatch for {path}: expected {expected} bytes, wrote {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("pattern error: {0}")]
    Regex(#[from] regex::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::errno::Errno),
}

/// A specialized Result type for xpg-core operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
