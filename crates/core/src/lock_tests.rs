// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use super::*;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::tempdir;

/// Pid of a process that has already exited and been reaped.
fn dead_pid() -> u32 {
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn acquire_creates_symlink_to_own_pid() {
    let dir = tempdir().unwrap();
    let path = dir.path().join(".xpg.skt.lock");
    let mut lock = NamedLock::new(&path);

    assert!(lock.acquire().unwrap());
    assert!(lock.is_locked());
    assert_eq!(lock.holder(), Some(std::process::id()));
    assert_eq!(
        fs::read_link(&path).unwrap(),
        PathBuf::from(std::process::id().to_string())
    );
}

#[test]
fn second_handle_fails_while_holder_lives() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let mut first = NamedLock::new(&path);
    let mut second = NamedLock::new(&path);

    assert!(first.acquire().unwrap());
    assert!(!second.acquire().unwrap());
    assert!(!second.is_locked());
}

#[test]
fn stale_lock_of_dead_process_is_replaced() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    symlink(dead_pid().to_string(), &path).unwrap();

    let mut lock = NamedLock::new(&path);
    assert!(lock.acquire().unwrap());
    assert_eq!(lock.holder(), Some(std::process::id()));
}

#[test]
fn garbage_lock_target_is_stale() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    symlink("not-a-pid", &path).unwrap();

    let mut lock = NamedLock::new(&path);
    assert!(lock.acquire().unwrap());
}

#[test]
fn concurrent_acquire_has_exactly_one_winner() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));

    // Every contender uses this (live) process id, so losers never judge
    // the winner's link stale.
    let handles: Vec<_> = (0..contenders)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut lock = NamedLock::new(&path);
                barrier.wait();
                lock.acquire().unwrap()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

#[test]
fn concurrent_takeover_of_stale_lock_has_one_winner() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let stale = dead_pid();
    let contenders = 8;

    for _ in 0..50 {
        let _ = fs::remove_file(&path);
        symlink(stale.to_string(), &path).unwrap();
        let barrier = Arc::new(Barrier::new(contenders));
        let handles: Vec<_> = (0..contenders)
            .map(|_| {
                let path = path.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut lock = NamedLock::new(&path);
                    barrier.wait();
                    lock.acquire().unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|name| name != "lock")
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
}

#[test]
fn retiring_a_replaced_link_puts_it_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let stale = dead_pid();
    // Another contender already swapped the stale link for its own.
    symlink(std::process::id().to_string(), &path).unwrap();

    let lock = NamedLock::new(&path);
    assert!(!lock.retire(Path::new(&stale.to_string())).unwrap());
    assert_eq!(lock.holder(), Some(std::process::id()));
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn retiring_the_stale_link_frees_the_lock() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let stale = dead_pid().to_string();
    symlink(&stale, &path).unwrap();

    let lock = NamedLock::new(&path);
    assert!(lock.retire(Path::new(&stale)).unwrap());
    assert!(fs::symlink_metadata(&path).is_err());
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn inherited_lock_is_claimed_without_contention() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    // The giver is alive (this very process), so a plain acquire would fail.
    let giver = std::process::id();
    symlink(giver.to_string(), &path).unwrap();

    let heir_pid = giver + 1;
    let mut inheritance = LockInheritance::new();
    inheritance.insert(Bequest {
        path: path.clone(),
        pid: giver,
    });
    let mut heir = NamedLock::for_pid(&path, heir_pid).with_inheritance(&inheritance);

    assert!(heir.acquire().unwrap());
    assert_eq!(heir.holder(), Some(heir_pid));
}

#[test]
fn inheritance_for_other_path_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    symlink(std::process::id().to_string(), &path).unwrap();

    let mut inheritance = LockInheritance::new();
    inheritance.insert(Bequest {
        path: dir.path().join("other.lock"),
        pid: std::process::id(),
    });
    let mut lock = NamedLock::for_pid(&path, 1).with_inheritance(&inheritance);
    assert!(!lock.acquire().unwrap());
}

#[test]
fn bequest_requires_holding_the_lock() {
    let dir = tempdir().unwrap();
    let lock = NamedLock::new(dir.path().join("lock"));
    assert!(matches!(lock.bequest(), Err(Error::LockNotHeld(_))));
}

#[test]
fn bequest_roundtrips_through_argument() {
    let bequest = Bequest {
        path: PathBuf::from("/tmp/.xpg.skt.lock"),
        pid: 4242,
    };
    let parsed: Bequest = bequest.to_arg().parse().unwrap();
    assert_eq!(parsed, bequest);
}

#[test]
fn malformed_bequest_is_rejected() {
    assert!("/tmp/lock".parse::<Bequest>().is_err());
    assert!("/tmp/lock=abc".parse::<Bequest>().is_err());
    assert!("=12".parse::<Bequest>().is_err());
}

#[tokio::test]
async fn bequeath_resolves_when_heir_claims() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let mut giver = NamedLock::new(&path);
    assert!(giver.acquire().unwrap());

    let bequest = giver.bequest().unwrap();
    let heir_pid = std::process::id() + 1;
    let mut inheritance = LockInheritance::new();
    inheritance.insert(bequest);

    let heir_path = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut heir = NamedLock::for_pid(heir_path, heir_pid).with_inheritance(&inheritance);
        assert!(heir.acquire().unwrap());
    });

    giver
        .bequeath_polling(heir_pid, 200, Duration::from_millis(5))
        .await
        .unwrap();
    assert!(!giver.is_locked());
    assert_eq!(giver.holder(), Some(heir_pid));
}

#[tokio::test]
async fn bequeath_times_out_without_heir() {
    let dir = tempdir().unwrap();
    let mut lock = NamedLock::new(dir.path().join("lock"));
    assert!(lock.acquire().unwrap());

    let err = lock
        .bequeath_polling(std::process::id() + 1, 3, Duration::from_millis(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    // Local ownership ended even though the hand-off failed.
    assert!(!lock.is_locked());
}

#[test]
fn release_keeps_symlink_and_remove_deletes_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let mut lock = NamedLock::new(&path);
    assert!(lock.acquire().unwrap());

    lock.release();
    assert!(!lock.is_locked());
    assert!(fs::symlink_metadata(&path).is_ok());

    lock.remove().unwrap();
    assert!(fs::symlink_metadata(&path).is_err());
}

#[test]
fn remove_leaves_someone_elses_lock() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    symlink("1", &path).unwrap();

    let mut lock = NamedLock::new(&path);
    lock.remove().unwrap();
    assert!(fs::symlink_metadata(&path).is_ok());
}

#[tokio::test]
async fn acquire_with_backoff_gives_up() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("lock");
    let mut holder = NamedLock::new(&path);
    assert!(holder.acquire().unwrap());

    let mut contender = NamedLock::new(&path);
    assert!(!contender.acquire_with_backoff(2).await.unwrap());
}
