// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Fake engine tools for tests.

#![allow(clippy::unwrap_used)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;

/// Write an executable shell script `name` into `bin_dir`.
pub fn fake_tool(bin_dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(bin_dir).unwrap();
    let path = bin_dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A config rooted in `root`, with `root/bin` as the tool directory and
/// short timings.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::new(root.join("data"));
    config.socket_dir = root.join("sock");
    config.bin_dir = Some(root.join("bin"));
    config.old_bin_template = root.join("old-{version}").display().to_string();
    config.stop_timeout = Duration::from_millis(500);
    config.backup.retry_delay = Duration::from_millis(20);
    fs::create_dir_all(&config.socket_dir).unwrap();
    config
}

/// Number of lines in a counter file a fake tool appends to.
pub fn count_lines(path: &Path) -> usize {
    fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
