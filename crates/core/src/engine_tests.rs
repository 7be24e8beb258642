// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use crate::testutil::{fake_tool, test_config};
use yare::parameterized;

#[parameterized(
    legacy = { "9.6", 9, Some(6) },
    modern = { "16", 16, None },
    trailing_newline = { "12\n", 12, None },
    modern_minor_dropped = { "10.3", 10, None },
)]
fn parse_format_version(text: &str, major: u32, minor: Option<u32>) {
    let version: FormatVersion = text.parse().unwrap();
    assert_eq!(version, FormatVersion { major, minor });
}

#[parameterized(
    empty = { "" },
    word = { "sixteen" },
    bad_minor = { "9.x" },
)]
fn parse_format_version_rejects(text: &str) {
    assert!(matches!(
        text.parse::<FormatVersion>(),
        Err(Error::InvalidVersion(_))
    ));
}

#[parameterized(
    modern = { "postgres (PostgreSQL) 16.2", "16" },
    distro = { "postgres (PostgreSQL) 15.6 (Debian 15.6-1.pgdg120+2)", "15" },
    legacy = { "postgres (PostgreSQL) 9.6.24", "9.6" },
)]
fn banner_version(banner: &str, expected: &str) {
    assert_eq!(FormatVersion::from_banner(banner).unwrap().to_string(), expected);
}

#[test]
fn versions_order_across_numbering_change() {
    let v95: FormatVersion = "9.5".parse().unwrap();
    let v96: FormatVersion = "9.6".parse().unwrap();
    let v10: FormatVersion = "10".parse().unwrap();
    let v16: FormatVersion = "16".parse().unwrap();
    assert!(v95 < v96);
    assert!(v96 < v10);
    assert!(v10 < v16);
}

#[parameterized(
    v96 = { "9.6", "pg_receivexlog", false },
    v10 = { "10", "pg_receivewal", false },
    v12 = { "12", "pg_receivewal", true },
)]
fn version_capabilities(text: &str, receiver: &str, signal: bool) {
    let version: FormatVersion = text.parse().unwrap();
    assert_eq!(version.receiver_tool(), receiver);
    assert_eq!(version.uses_recovery_signal(), signal);
}

#[test]
fn read_format_version_from_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("PG_VERSION"), "14\n").unwrap();
    assert_eq!(read_format_version(dir.path()).unwrap().major, 14);

    let empty = tempfile::tempdir().unwrap();
    assert!(matches!(
        read_format_version(empty.path()),
        Err(Error::MissingFormatMarker(_))
    ));
}

#[test]
fn tools_resolve_in_bin_dir_or_path() {
    assert_eq!(Tools::default().path("psql"), PathBuf::from("psql"));
    assert_eq!(
        Tools::new(Some(PathBuf::from("/opt/pg/bin"))).path("psql"),
        PathBuf::from("/opt/pg/bin/psql")
    );
}

#[test]
fn sanitize_pid_file_adopts_and_strips_shared_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("postmaster.pid");
    fs::write(
        &path,
        "4711\n/srv/db\n1700000000\n5432\n/tmp\n*\n  5432001    327680\nready   \n",
    )
    .unwrap();

    assert!(sanitize_pid_file(dir.path(), 99).unwrap());
    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["99", "/srv/db", "1700000000", "5432", "/tmp", "*"]);
}

#[test]
fn sanitize_without_pid_file_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!sanitize_pid_file(dir.path(), 99).unwrap());
    assert!(!dir.path().join("postmaster.pid").exists());
}

#[test]
fn synthetic_pid_file_names_no_process() {
    let dir = tempfile::tempdir().unwrap();
    write_synthetic_pid_file(dir.path()).unwrap();
    let text = fs::read_to_string(dir.path().join("postmaster.pid")).unwrap();
    assert_eq!(text.lines().next(), Some("0"));
}

#[tokio::test]
async fn version_reads_server_banner() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    fake_tool(
        &root.path().join("bin"),
        "postgres",
        "echo 'postgres (PostgreSQL) 13.4'",
    );
    let version = Engine::current(&config).version().await.unwrap();
    assert_eq!(version, FormatVersion::new(13, None));
}

#[tokio::test]
async fn start_passes_launch_flags() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let args = root.path().join("args");
    fake_tool(
        &root.path().join("bin"),
        "postgres",
        &format!("echo \"$@\" > {}", args.display()),
    );

    let extra = vec!["-F".to_string()];
    let handle = Engine::current(&config)
        .start(&Launch {
            data_dir: Path::new("/srv/db"),
            port: 6000,
            socket_dir: Path::new("/run/x"),
            listen: false,
            extra: &extra,
        })
        .unwrap();
    assert!(handle.wait().await.success());
    assert_eq!(
        fs::read_to_string(&args).unwrap().trim(),
        "-D /srv/db -p 6000 -k /run/x -c listen_addresses= -F"
    );
}

#[tokio::test]
async fn stop_escalates_when_engine_ignores_signal() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    fake_tool(
        &root.path().join("bin"),
        "postgres",
        "trap '' TERM\nwhile true; do sleep 0.05; done",
    );
    let engine = Engine::current(&config);
    let handle = engine
        .start(&Launch {
            data_dir: root.path(),
            port: 6001,
            socket_dir: root.path(),
            listen: true,
            extra: &[],
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = engine.stop(&handle, Signal::SIGTERM).await;
    assert_eq!(status.code(), 128 + Signal::SIGQUIT as i32);
}

#[tokio::test]
async fn wait_ready_polls_until_accepting() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let bin = root.path().join("bin");
    let flag = root.path().join("ready");
    fake_tool(&bin, "postgres", "sleep 30");
    fake_tool(&bin, "pg_isready", &format!("test -e {}", flag.display()));

    let engine = Engine::current(&config);
    let handle = engine
        .start(&Launch {
            data_dir: root.path(),
            port: 6002,
            socket_dir: root.path(),
            listen: true,
            extra: &[],
        })
        .unwrap();

    let flag_writer = flag.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        fs::write(flag_writer, "").unwrap();
    });
    tokio::time::timeout(
        Duration::from_secs(5),
        engine.wait_ready(&handle, root.path(), 6002),
    )
    .await
    .unwrap()
    .unwrap();
    handle.signal(Signal::SIGKILL).unwrap();
}

#[tokio::test]
async fn wait_ready_fails_when_engine_exits() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let bin = root.path().join("bin");
    fake_tool(&bin, "postgres", "exit 1");
    fake_tool(&bin, "pg_isready", "exit 2");

    let engine = Engine::current(&config);
    let handle = engine
        .start(&Launch {
            data_dir: root.path(),
            port: 6003,
            socket_dir: root.path(),
            listen: true,
            extra: &[],
        })
        .unwrap();
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        engine.wait_ready(&handle, root.path(), 6003),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, Error::ExitedEarly(_)));
}

#[tokio::test]
async fn control_data_failure_is_reported() {
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    fake_tool(&root.path().join("bin"), "pg_controldata", "exit 1");
    let err = Engine::current(&config)
        .check_control_data(root.path())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ToolFailed { ref tool, status: 1 } if tool == "pg_controldata"));
}
