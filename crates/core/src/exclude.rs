// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Hook excluding the live data directory from external backups.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::process::ExitStatus;

/// Run `command` with `data_dir` appended. Failures are logged only.
///
/// Returns true if the hook ran and exited cleanly.
pub async fn exclude_from_backups(command: &[String], data_dir: &Path) -> bool {
    let Some((program, args)) = command.split_first() else {
        return false;
    };
    let result = Command::new(program)
        .args(args)
        .arg(data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .await;
    match result {
        Ok(status) if status.success() => {
            debug!(data_dir = %data_dir.display(), "excluded data directory from backups");
            true
        }
        Ok(status) => {
            warn!(%program, status = %ExitStatus::from(status), "exclusion hook failed");
            false
        }
        Err(e) => {
            warn!(%program, error = %e, "exclusion hook could not run");
            false
        }
    }
}

#[cfg(test)]
#[path = "exclude_tests.rs"]
mod tests;
