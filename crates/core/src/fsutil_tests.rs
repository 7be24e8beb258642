// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]

use super::*;
use std::fs;
use std::time::Duration;

#[test]
fn write_atomic_replaces_contents_without_leftovers() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("postgresql.conf");
    fs::write(&path, "old").unwrap();

    write_atomic(&path, b"new").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    let names: Vec<_> = fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names.len(), 1);
}

#[test]
fn sibling_appends_suffix() {
    let path = Path::new("/a/b/000000010000000000000001");
    assert_eq!(
        sibling(path, ".partial"),
        Path::new("/a/b/000000010000000000000001.partial")
    );
}

#[test]
fn copy_dir_copies_nested_files_and_links() {
    let temp = tempfile::tempdir().unwrap();
    let src = temp.path().join("src");
    fs::create_dir_all(src.join("base/1")).unwrap();
    fs::write(src.join("PG_VERSION"), "16\n").unwrap();
    fs::write(src.join("base/1/1259"), "rel").unwrap();
    std::os::unix::fs::symlink("base", src.join("link")).unwrap();

    let dst = temp.path().join("dst");
    copy_dir(&src, &dst).unwrap();

    assert_eq!(fs::read_to_string(dst.join("PG_VERSION")).unwrap(), "16\n");
    assert_eq!(fs::read_to_string(dst.join("base/1/1259")).unwrap(), "rel");
    assert_eq!(fs::read_link(dst.join("link")).unwrap(), Path::new("base"));
}

#[tokio::test]
async fn wait_for_path_times_out() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("never");
    let err = wait_for_path(&missing, 2, Duration::from_millis(5))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
}

#[tokio::test]
async fn wait_for_path_sees_late_file() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("recovery.done");
    let writer = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(writer, "").unwrap();
    });
    wait_for_path(&path, 100, Duration::from_millis(5))
        .await
        .unwrap();
}
