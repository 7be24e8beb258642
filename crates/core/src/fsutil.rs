// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Filesystem helpers: atomic replacement, directory copies and path polling.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{Error, Result};

/// Interval for path and lock polling.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Replace `path` with `contents` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp = sibling(path, ".xpg-tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(&tmp, meta.permissions())?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Flush directory entries (renames, creates) to stable storage.
pub fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

/// `path` with `suffix` appended to its file name.
pub fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// Set the modification time of `path` to now.
pub fn touch(path: &Path) -> Result<()> {
    let file = fs::OpenOptions::new().append(true).open(path)?;
    file.set_modified(SystemTime::now())?;
    Ok(())
}

/// Recursively copy `from` into a new directory `to`, preserving symlinks.
pub fn copy_dir(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir(to)?;
    fs::set_permissions(to, fs::metadata(from)?.permissions())?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir(&src, &dst)?;
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&src)?, &dst)?;
        } else {
            fs::copy(&src, &dst)?;
        }
    }
    Ok(())
}

/// Poll once per `interval` until `path` exists, giving up after `attempts`.
pub async fn wait_for_path(path: &Path, attempts: u32, interval: Duration) -> Result<()> {
    for _ in 0..attempts {
        if path.exists() {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }
    if path.exists() {
        return Ok(());
    }
    Err(Error::Timeout(path.display().to_string()))
}

#[cfg(test)]
#[path = "fsutil_tests.rs"]
mod tests;
