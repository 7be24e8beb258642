// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn xpg_ctl() -> Command {
    let mut cmd = cargo_bin_cmd!("xpg_ctl");
    cmd.env_remove("PGDATA").env_remove("PGPORT");
    cmd
}

/// A fake `pg_ctl` that records its arguments and exits with `code`.
fn fake_pg_ctl(temp: &TempDir, code: i32) -> PathBuf {
    let bin = temp.path().join("bin");
    fs::create_dir_all(&bin).unwrap();
    let path = bin.join("pg_ctl");
    let record = temp.path().join("pg_ctl.args");
    fs::write(
        &path,
        format!(
            "#!/bin/sh\nprintf '%s\\n' \"$@\" > {}\nexit {code}\n",
            record.display()
        ),
    )
    .unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    bin
}

fn recorded_args(temp: &TempDir) -> String {
    fs::read_to_string(temp.path().join("pg_ctl.args")).unwrap()
}

fn socket_option(dir: &Path) -> String {
    format!("-k {}", dir.display())
}

#[test]
fn help_lists_actions() {
    xpg_ctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("restart"))
        .stdout(predicate::str::contains("pg_ctl"));
}

#[test]
fn other_actions_run_pg_ctl_and_propagate_exit_code() {
    let temp = TempDir::new().unwrap();
    let bin = fake_pg_ctl(&temp, 3);
    xpg_ctl()
        .env("XPG_BIN_DIR", &bin)
        .args(["status", "-D", "/srv/pg/data"])
        .assert()
        .code(3);
    assert_eq!(recorded_args(&temp), "status\n-D\n/srv/pg/data\n");
}

#[test]
fn stop_without_supervisor_delegates_to_pg_ctl() {
    let temp = TempDir::new().unwrap();
    let bin = fake_pg_ctl(&temp, 0);
    xpg_ctl()
        .env("XPG_BIN_DIR", &bin)
        .arg("stop")
        .arg("-D")
        .arg(temp.path().join("data"))
        .arg("-o")
        .arg(socket_option(temp.path()))
        .args(["-m", "fast"])
        .assert()
        .success();
    let recorded = recorded_args(&temp);
    assert!(recorded.starts_with("stop\n-D\n"));
    assert!(recorded.ends_with("-m\nfast\n"));
}

#[test]
fn restart_without_supervisor_delegates_to_pg_ctl() {
    let temp = TempDir::new().unwrap();
    let bin = fake_pg_ctl(&temp, 5);
    xpg_ctl()
        .env("XPG_BIN_DIR", &bin)
        .env("PGDATA", temp.path().join("data"))
        .arg("restart")
        .arg("-o")
        .arg(socket_option(temp.path()))
        .assert()
        .code(5);
    assert!(recorded_args(&temp).starts_with("restart\n"));
}

#[test]
fn start_rejects_unbalanced_options() {
    let temp = TempDir::new().unwrap();
    xpg_ctl()
        .arg("start")
        .arg("-D")
        .arg(temp.path())
        .args(["-o", "-c 'port=5433"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("unbalanced quotes"));
}

#[test]
fn stop_needs_a_data_directory() {
    xpg_ctl()
        .arg("stop")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("no data directory given"));
}

#[test]
fn start_reports_missing_supervisor_binary() {
    let temp = TempDir::new().unwrap();
    xpg_ctl()
        .env("XPG_SUPERVISOR_BINARY", temp.path().join("no-such-xpg"))
        .arg("start")
        .arg("-D")
        .arg(temp.path().join("data"))
        .arg("-o")
        .arg(socket_option(temp.path()))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("failed to start"));
    assert!(fs::symlink_metadata(temp.path().join(".xpg.skt.lock")).is_err());
    assert!(fs::symlink_metadata(temp.path().join(".xpg_ctl.lock")).is_err());
}
