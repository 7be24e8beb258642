// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Symlink-backed named lock with ownership hand-off.
//!
//! The lock is a symlink whose target is the holder's pid. Symlink creation is
//! atomic, so of any number of racing processes exactly one succeeds. A holder
//! can bequeath the lock to a child it is about to spawn: the child receives a
//! [`Bequest`] as a startup argument and, on [`NamedLock::acquire`], swaps the
//! symlink to its own pid without the lock ever appearing free.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fsutil::{sibling, POLL_INTERVAL};

/// Executable name prefix identifying processes of this supervisor.
const SUPERVISOR_PREFIX: &str = "xpg";
/// Distinguishes concurrent retirements of a stale link within one process.
static RETIRE_SEQ: AtomicU64 = AtomicU64::new(0);
/// Longest pause between acquisition attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// A lock handed from its holder to a process about to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bequest {
    /// Absolute path of the lock.
    pub path: PathBuf,
    /// Pid of the bequeathing holder (the symlink target at hand-off time).
    pub pid: u32,
}

impl Bequest {
    /// Render as a `--inherit-lock` argument value.
    pub fn to_arg(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Bequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.path.display(), self.pid)
    }
}

impl FromStr for Bequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (path, pid) = s
            .rsplit_once('=')
            .ok_or_else(|| Error::InvalidBequest(s.to_string()))?;
        let pid = pid
            .parse()
            .map_err(|_| Error::InvalidBequest(s.to_string()))?;
        if path.is_empty() {
            return Err(Error::InvalidBequest(s.to_string()));
        }
        Ok(Bequest {
            path: PathBuf::from(path),
            pid,
        })
    }
}

/// Locks this process was handed at spawn time, keyed by absolute path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockInheritance {
    entries: HashMap<PathBuf, u32>,
}

impl LockInheritance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bequest: Bequest) {
        self.entries.insert(bequest.path, bequest.pid);
    }

    pub fn get(&self, path: &Path) -> Option<u32> {
        self.entries.get(path).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A crash-tolerant, transferable mutual exclusion lock backed by a symlink.
#[derive(Debug)]
pub struct NamedLock {
    path: PathBuf,
    pid: u32,
    inherited: Option<u32>,
    locked: bool,
}

impl NamedLock {
    /// Create a handle for the lock at `path` owned by this process.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::for_pid(path, std::process::id())
    }

    pub(crate) fn for_pid(path: impl Into<PathBuf>, pid: u32) -> Self {
        let path = path.into();
        let path = std::path::absolute(&path).unwrap_or(path);
        NamedLock {
            path,
            pid,
            inherited: None,
            locked: false,
        }
    }

    /// Consult `inheritance` for a bequest of this lock on the next acquire.
    pub fn with_inheritance(mut self, inheritance: &LockInheritance) -> Self {
        self.inherited = inheritance.get(&self.path);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Pid named by the symlink, if it exists and names a pid.
    pub fn holder(&self) -> Option<u32> {
        let target = fs::read_link(&self.path).ok()?;
        target.to_str()?.parse().ok()
    }

    /// Try to take the lock. Returns false if another live process holds it.
    pub fn acquire(&mut self) -> Result<bool> {
        if self.locked {
            return Ok(true);
        }

        if let Some(pid) = self.inherited.take() {
            if self.holder() == Some(pid) {
                self.claim()?;
                self.locked = true;
                info!(lock = %self.path.display(), from = pid, "inherited lock");
                return Ok(true);
            }
            warn!(lock = %self.path.display(), from = pid, "bequeathed lock is no longer held by its giver");
        }

        if self.try_create()? {
            self.locked = true;
            return Ok(true);
        }
        if !self.clear_if_stale()? {
            return Ok(false);
        }
        self.locked = self.try_create()?;
        Ok(self.locked)
    }

    /// Acquire with bounded retries, backing off between attempts.
    pub async fn acquire_with_backoff(&mut self, attempts: u32) -> Result<bool> {
        let mut delay = Duration::from_millis(100);
        for attempt in 0..attempts.max(1) {
            if self.acquire()? {
                return Ok(true);
            }
            debug!(lock = %self.path.display(), attempt, holder = ?self.holder(), "lock busy");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
        Ok(false)
    }

    /// Describe a hand-off of this lock to a child about to be spawned.
    pub fn bequest(&self) -> Result<Bequest> {
        if !self.locked {
            return Err(Error::LockNotHeld(self.path.display().to_string()));
        }
        Ok(Bequest {
            path: self.path.clone(),
            pid: self.pid,
        })
    }

    /// Hand the lock to `heir` and wait until it has claimed the symlink.
    ///
    /// Local ownership ends immediately; the symlink stays in place for the
    /// heir. Polls once per second for at most `attempts` seconds.
    pub async fn bequeath(&mut self, heir: u32, attempts: u32) -> Result<()> {
        self.bequeath_polling(heir, attempts, POLL_INTERVAL).await
    }

    pub(crate) async fn bequeath_polling(
        &mut self,
        heir: u32,
        attempts: u32,
        interval: Duration,
    ) -> Result<()> {
        self.locked = false;
        for _ in 0..attempts {
            if self.holder() == Some(heir) {
                debug!(lock = %self.path.display(), heir, "lock bequeathed");
                return Ok(());
            }
            tokio::time::sleep(interval).await;
        }
        if self.holder() == Some(heir) {
            return Ok(());
        }
        Err(Error::Timeout(format!(
            "process {} to claim {}",
            heir,
            self.path.display()
        )))
    }

    /// Forget local ownership. The symlink is left for [`NamedLock::remove`].
    pub fn release(&mut self) {
        self.locked = false;
    }

    /// Release and delete the symlink if it still names this process.
    pub fn remove(&mut self) -> Result<()> {
        self.locked = false;
        if self.holder() == Some(self.pid) {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn try_create(&self) -> Result<bool> {
        match symlink(self.pid.to_string(), &self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Point the symlink at this process in one rename.
    fn claim(&self) -> Result<()> {
        let tmp = sibling(&self.path, &format!(".{}", self.pid));
        let _ = fs::remove_file(&tmp);
        symlink(self.pid.to_string(), &tmp)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Remove the symlink if its holder is gone. Returns true if the lock is free.
    fn clear_if_stale(&self) -> Result<bool> {
        let target = match fs::read_link(&self.path) {
            Ok(target) => target,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let holder = target.to_str().and_then(|s| s.parse::<u32>().ok());
        if let Some(pid) = holder {
            if holder_is_live(pid) {
                return Ok(false);
            }
        }

        if !self.retire(&target)? {
            return Ok(false);
        }
        warn!(lock = %self.path.display(), stale = %target.display(), "removed stale lock");
        Ok(true)
    }

    /// Move the link aside and delete it only if it still names `stale`.
    ///
    /// A racer may have replaced the stale link since it was read; its fresh
    /// link is linked back into place and the lock reported as taken.
    fn retire(&self, stale: &Path) -> Result<bool> {
        let seq = RETIRE_SEQ.fetch_add(1, Ordering::Relaxed);
        let aside = sibling(&self.path, &format!(".stale.{}.{seq}", self.pid));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }
        if fs::read_link(&aside).ok().as_deref() == Some(stale) {
            fs::remove_file(&aside)?;
            return Ok(true);
        }
        match fs::hard_link(&aside, &self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                warn!(lock = %self.path.display(), "lock was retaken while restoring a live link");
            }
            Err(e) => {
                let _ = fs::remove_file(&aside);
                return Err(e.into());
            }
        }
        fs::remove_file(&aside)?;
        Ok(false)
    }
}

/// A holder counts as live if it runs as us, or runs as another user and is
/// an instance of this supervisor.
fn holder_is_live(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => is_supervisor_process(pid),
        Err(_) => false,
    }
}

fn is_supervisor_process(pid: u32) -> bool {
    let Ok(cmdline) = fs::read(format!("/proc/{pid}/cmdline")) else {
        // Without /proc we cannot tell; never steal from another user.
        return true;
    };
    let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
    Path::new(std::ffi::OsStr::from_bytes(argv0))
        .file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with(SUPERVISOR_PREFIX))
}

#[cfg(test)]
#[path = "lock_tests.rs"]
mod tests;
