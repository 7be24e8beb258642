// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access.
//!
//! All runtime environment variables read by xpg are defined here with typed
//! accessor functions. The variable name constants are generated by `build.rs`
//! and live in the [`vars`] submodule. Nothing outside this module and
//! [`crate::config`] reads the environment.

use std::path::PathBuf;

/// Generated environment variable name constants.
pub mod vars {
    include!(concat!(env!("OUT_DIR"), "/env_vars.rs"));
}

/// Returns the value of `PGDATA` if set.
pub fn pgdata() -> Option<PathBuf> {
    non_empty(vars::PGDATA).map(PathBuf::from)
}

/// Returns the value of `PGPORT` if set and numeric.
pub fn pgport() -> Option<u16> {
    non_empty(vars::PGPORT).and_then(|v| v.parse().ok())
}

/// Returns the value of `XPG_BIN_DIR` if set.
pub fn bin_dir() -> Option<PathBuf> {
    non_empty(vars::XPG_BIN_DIR).map(PathBuf::from)
}

/// Returns the value of `XPG_OLD_BIN_TEMPLATE` if set.
pub fn old_bin_template() -> Option<String> {
    non_empty(vars::XPG_OLD_BIN_TEMPLATE)
}

/// Returns the value of `XPG_ARCHIVE_DIR` if set.
pub fn archive_dir() -> Option<PathBuf> {
    non_empty(vars::XPG_ARCHIVE_DIR).map(PathBuf::from)
}

/// Returns the value of `XPG_LOG_DIR` if set.
pub fn log_dir() -> Option<PathBuf> {
    non_empty(vars::XPG_LOG_DIR).map(PathBuf::from)
}

/// Returns the value of `XPG_SUPERVISOR_BINARY` if set.
pub fn supervisor_binary() -> Option<PathBuf> {
    non_empty(vars::XPG_SUPERVISOR_BINARY).map(PathBuf::from)
}

fn non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
