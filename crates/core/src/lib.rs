// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! xpg-core: Shared library for the xpg database supervisor
//!
//! This crate provides locking, process supervision, WAL archiving, backup,
//! restore and upgrade primitives used by both the `xpg` supervisor and the
//! `xpg_ctl` front-end.

pub mod archive;
pub mod backup;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod exclude;
pub mod fsutil;
pub mod layout;
pub mod lock;
pub mod process;
pub mod refcount;
pub mod restore;
pub mod upgrade;

#[cfg(test)]
mod testutil;

pub use archive::{archive_file, ArchiveCopy, ArchiveManager, WalReceiver};
pub use backup::{BackupEngine, BackupOutcome, BackupState};
pub use config::{BackupPolicy, Config, EngineArgs, EnvOverrides, Settings};
pub use engine::{Engine, FormatVersion, Launch, Tools};
pub use error::{Error, Result};
pub use lock::{Bequest, LockInheritance, NamedLock};
pub use process::{ExitStatus, ProcessHandle};
pub use refcount::{Decref, RefCount};
pub use restore::RestoreCoordinator;
pub use upgrade::{resume_interrupted_upgrade, UpgradeResume, Upgrader};
