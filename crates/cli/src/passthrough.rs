// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Handing actions to `pg_ctl`.

use tracing::debug;
use xpg_core::{ExitStatus, Tools};

use crate::error::{Error, Result};

/// Run `pg_ctl` with `args` on the inherited terminal and return its exit code.
pub async fn pg_ctl(tools: &Tools, args: &[String]) -> Result<i32> {
    let path = tools.path("pg_ctl");
    debug!(path = %path.display(), ?args, "delegating to pg_ctl");
    let status = tokio::process::Command::new(&path)
        .args(args)
        .status()
        .await
        .map_err(|source| Error::Spawn {
            path: path.display().to_string(),
            source,
        })?;
    Ok(ExitStatus::from(status).code())
}

#[cfg(test)]
#[path = "passthrough_tests.rs"]
mod tests;
