// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::testutil::{fake_tool, test_config};
use yare::parameterized;

const CONF: &str = "\
# sample
listen_addresses = 'localhost'
#archive_mode = off\t\t# enables archiving
  # archive_command = ''
wal_level = minimal
shared_buffers = 128MB
";

fn manager(root: &Path, version: &str) -> ArchiveManager {
    let config = test_config(root);
    fs::create_dir_all(&config.data_dir).unwrap();
    fs::write(config.data_dir.join("postgresql.conf"), CONF).unwrap();
    ArchiveManager::new(
        Arc::new(config),
        version.parse().unwrap(),
        PathBuf::from("/usr/bin/xpg"),
    )
}

fn read_conf(manager: &ArchiveManager) -> String {
    fs::read_to_string(manager.config.data_dir.join("postgresql.conf")).unwrap()
}

#[parameterized(
    plain = { "archive_mode = off", true },
    commented = { "#archive_mode = on", true },
    spaced_comment = { "  #  archive_mode=on", true },
    prefix_only = { "archive_mode_extra = 1", false },
    mentioned_later = { "foo = 1 # archive_mode = on", false },
)]
fn directive_matching(line: &str, matches: bool) {
    let out = transform_conf(line, &["archive_mode"], |_, _| "X".to_string()).unwrap();
    assert_eq!(out == "X", matches);
}

#[test]
fn enabling_rewrites_present_directives_only() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    manager.toggle(true).unwrap();
    let conf = read_conf(&manager);

    assert!(conf.contains("\narchive_mode = on\n"));
    assert!(conf.contains(&format!(
        "\narchive_command = '\"/usr/bin/xpg\" archive \"%p\" \"{}/%f\"'\n",
        manager.dir().display()
    )));
    assert!(conf.contains("\nwal_level = replica\n"));
    assert!(conf.contains("listen_addresses = 'localhost'\n"));
    assert!(conf.contains("shared_buffers = 128MB\n"));
    // Absent from the file, so not added.
    assert!(!conf.contains("archive_timeout"));
    assert!(!conf.contains("max_wal_senders"));
    assert_eq!(conf.lines().count(), CONF.lines().count());
}

#[test]
fn disabling_comments_directives_out() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    manager.toggle(true).unwrap();
    manager.toggle(false).unwrap();
    let conf = read_conf(&manager);
    assert!(conf.contains("\n#archive_mode = on\n"));
    assert!(conf.contains("\n#wal_level = replica\n"));
    assert!(!conf
        .lines()
        .any(|l| l.starts_with("archive_mode") || l.starts_with("wal_level")));
}

#[test]
fn legacy_engines_get_legacy_wal_level() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "9.5");
    manager.toggle(true).unwrap();
    assert!(read_conf(&manager).contains("\nwal_level = hot_standby\n"));
}

#[test]
fn replication_rule_added_once() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    let hba = manager.config.data_dir.join("pg_hba.conf");
    fs::write(&hba, "local all all trust\n#local replication all trust\n").unwrap();

    manager.toggle(true).unwrap();
    manager.toggle(true).unwrap();
    let text = fs::read_to_string(&hba).unwrap();
    let rules = text
        .lines()
        .filter(|l| l.split_whitespace().collect::<Vec<_>>() == ["local", "replication", "all", "trust"])
        .count();
    assert_eq!(rules, 1);
}

#[test]
fn archive_file_copies_then_skips_equal_size() {
    let dir = tempfile::tempdir().unwrap();
    let from = dir.path().join("seg");
    let to = dir.path().join("archived");
    fs::write(&from, b"0123456789").unwrap();

    assert_eq!(archive_file(&from, &to).unwrap(), ArchiveCopy::Copied);
    assert_eq!(fs::read(&to).unwrap(), b"0123456789");
    assert!(!sibling(&to, IN_PROGRESS_SUFFIX).exists());
    assert_eq!(archive_file(&from, &to).unwrap(), ArchiveCopy::AlreadyPresent);
}

#[test]
fn archive_file_replaces_truncated_target() {
    let dir = tempfile::tempdir().unwrap();
    let from = dir.path().join("seg");
    let to = dir.path().join("archived");
    fs::write(&from, b"complete").unwrap();
    fs::write(&to, b"half").unwrap();

    assert_eq!(archive_file(&from, &to).unwrap(), ArchiveCopy::Copied);
    assert_eq!(fs::read(&to).unwrap(), b"complete");
}

#[test]
fn archive_file_missing_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = archive_file(&dir.path().join("nope"), &dir.path().join("to")).unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

const SEG_A: &str = "000000010000000000000001";
const SEG_B: &str = "000000010000000000000002";

#[test]
fn prune_removes_superseded_partials_and_transfers() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    manager.ensure_dir().unwrap();
    let dir = manager.dir().to_path_buf();
    fs::write(dir.join(SEG_A), "a").unwrap();
    fs::write(dir.join(format!("{SEG_A}.partial")), "a").unwrap();
    fs::write(dir.join(format!("{SEG_B}.partial")), "b").unwrap();
    fs::write(dir.join(format!("{SEG_B}.in-progress")), "b").unwrap();

    assert_eq!(manager.prune_stale_archive().unwrap(), 2);
    assert!(dir.join(SEG_A).exists());
    assert!(!dir.join(format!("{SEG_A}.partial")).exists());
    assert!(dir.join(format!("{SEG_B}.partial")).exists());
    assert!(!dir.join(format!("{SEG_B}.in-progress")).exists());
}

#[test]
fn prune_without_archive_dir_is_noop() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    assert_eq!(manager.prune_stale_archive().unwrap(), 0);
}

#[test]
fn unpartialize_keeps_complete_segments() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    manager.ensure_dir().unwrap();
    let dir = manager.dir().to_path_buf();
    fs::write(dir.join(SEG_A), "complete").unwrap();
    fs::write(dir.join(format!("{SEG_A}.partial")), "stale").unwrap();
    fs::write(dir.join(format!("{SEG_B}.partial")), "latest").unwrap();

    assert_eq!(manager.unpartialize().unwrap(), 1);
    assert_eq!(fs::read_to_string(dir.join(SEG_A)).unwrap(), "complete");
    assert_eq!(fs::read_to_string(dir.join(SEG_B)).unwrap(), "latest");
}

#[test]
fn quarantine_moves_wrong_sized_segments() {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    config.wal_segment_size = 8;
    let manager = ArchiveManager::new(Arc::new(config), "16".parse().unwrap(), PathBuf::new());
    manager.ensure_dir().unwrap();
    let dir = manager.dir().to_path_buf();
    fs::write(dir.join(SEG_A), "12345678").unwrap();
    fs::write(dir.join(SEG_B), "1234").unwrap();
    fs::write(dir.join("00000002.history"), "x").unwrap();

    assert_eq!(manager.quarantine_bad_sizes().unwrap(), 1);
    assert!(dir.join(SEG_A).exists());
    assert!(dir.join(format!("{SEG_B}.bad-size")).exists());
    assert!(dir.join("00000002.history").exists());
}

#[test]
fn discard_all_keeps_opt_out_marker() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    manager.ensure_dir().unwrap();
    let dir = manager.dir().to_path_buf();
    fs::create_dir_all(dir.join("backup")).unwrap();
    fs::write(dir.join("backup/base_complete.tar.gz"), "b").unwrap();
    fs::write(dir.join(SEG_A), "a").unwrap();
    fs::write(dir.join(".DoNotBackup"), "").unwrap();

    manager.discard_all().unwrap();
    let left: Vec<_> = fs::read_dir(&dir)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(left, vec![std::ffi::OsString::from(".DoNotBackup")]);
}

#[tokio::test]
async fn receiver_reports_streaming() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    let args = root.path().join("args");
    fake_tool(
        &root.path().join("bin"),
        "pg_receivewal",
        &format!(
            "echo \"$LC_ALL $@\" > {}\necho 'pg_receivewal: starting log streaming at 0/1000000' >&2\nexec sleep 30",
            args.display()
        ),
    );

    let receiver = manager.start_receiver().unwrap();
    let handle = tokio::time::timeout(Duration::from_secs(5), receiver.started())
        .await
        .unwrap()
        .unwrap();
    let recorded = fs::read_to_string(&args).unwrap();
    assert!(recorded.starts_with("C -D "));
    assert!(recorded.contains(" -v"));

    handle.signal(Signal::SIGKILL).unwrap();
    handle.wait().await;
}

#[tokio::test]
async fn receiver_exiting_early_is_an_error() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "9.6");
    fake_tool(
        &root.path().join("bin"),
        "pg_receivexlog",
        "echo 'could not connect' >&2\nexit 1",
    );
    let receiver = manager.start_receiver().unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), receiver.started())
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::ExitedEarly(ref tool) if tool == "pg_receivexlog"));
}

#[tokio::test]
async fn stop_receiver_interrupts_lingering_process() {
    let root = tempfile::tempdir().unwrap();
    let manager = manager(root.path(), "16");
    fake_tool(&root.path().join("bin"), "pg_receivewal", "exec sleep 30");
    let receiver = manager.start_receiver().unwrap();
    let handle = receiver.handle().clone();

    tokio::time::timeout(Duration::from_secs(30), manager.stop_receiver(&handle))
        .await
        .unwrap();
    assert!(handle.try_status().is_some());
}
