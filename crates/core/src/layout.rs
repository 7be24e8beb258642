// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! On-disk layout shared by the supervisor, the front-end and the archive helper.
//!
//! ```text
//! <socket-dir>/.xpg.skt                      control socket
//! <socket-dir>/.xpg.skt.lock                 supervisor singleton lock
//! <socket-dir>/.xpg_ctl.lock                 front-end serialization lock
//! <data-dir>/postmaster.pid                  engine lock/status file
//! <data-dir>/PG_VERSION                      on-disk format marker
//! <data-dir>/.NoRestoreNeeded                absence triggers restore
//! <archive-dir>/.DoNotBackup                 suppresses scheduled backups
//! <archive-dir>/backup/base_complete.tar.gz  canonical base backup
//! <archive-dir>/<segment>[.partial]          archived WAL
//! ```

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Control socket filename within the socket directory.
pub const CONTROL_SOCKET_NAME: &str = ".xpg.skt";
/// Front-end lock filename within the socket directory.
pub const CTL_LOCK_NAME: &str = ".xpg_ctl.lock";
/// Engine lock/status file within the data directory.
pub const PID_FILE: &str = "postmaster.pid";
/// On-disk format marker within the data directory.
pub const VERSION_FILE: &str = "PG_VERSION";
/// Engine configuration file within the data directory.
pub const CONF_FILE: &str = "postgresql.conf";
/// Engine access-control file within the data directory.
pub const HBA_FILE: &str = "pg_hba.conf";
/// Marker whose absence means the data directory must be restored.
pub const NO_RESTORE_MARKER: &str = ".NoRestoreNeeded";
/// Marker that suppresses scheduled backups.
pub const DO_NOT_BACKUP_MARKER: &str = ".DoNotBackup";
/// Subdirectory of the archive directory holding base backups.
pub const BACKUP_SUBDIR: &str = "backup";
/// Canonical base backup filename.
pub const BACKUP_NAME: &str = "base_complete.tar.gz";

/// Suffix of a WAL segment the receiver is still writing.
pub const PARTIAL_SUFFIX: &str = ".partial";
/// Suffix of an archive-helper copy that never completed.
pub const IN_PROGRESS_SUFFIX: &str = ".in-progress";
/// Suffix given to segments quarantined for having the wrong size.
pub const BAD_SIZE_SUFFIX: &str = ".bad-size";

/// Path of the control socket.
pub fn control_socket(socket_dir: &Path) -> PathBuf {
    socket_dir.join(CONTROL_SOCKET_NAME)
}

/// Path of the supervisor singleton lock (`<control-socket>.lock`).
pub fn socket_lock(socket_dir: &Path) -> PathBuf {
    socket_dir.join(format!("{CONTROL_SOCKET_NAME}.lock"))
}

/// Path of the front-end serialization lock.
pub fn ctl_lock(socket_dir: &Path) -> PathBuf {
    socket_dir.join(CTL_LOCK_NAME)
}

/// Path of the engine's own unix socket for `port`.
pub fn engine_socket(socket_dir: &Path, port: u16) -> PathBuf {
    socket_dir.join(format!(".s.PGSQL.{port}"))
}

/// Returns true if `name` looks like a WAL segment (24 hex digits).
pub fn is_segment_name(name: &str) -> bool {
    name.len() == 24 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// The base backup and its sibling files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    /// Directory holding the backup files.
    pub dir: PathBuf,
    /// The only path a finished backup is ever visible at.
    pub canonical: PathBuf,
    /// Where the backup tool writes while running.
    pub temporary: PathBuf,
    /// The artifact superseded by the most recent backup.
    pub previous: PathBuf,
}

impl BackupArtifact {
    pub fn in_archive(archive_dir: &Path) -> Self {
        let dir = archive_dir.join(BACKUP_SUBDIR);
        BackupArtifact {
            canonical: dir.join(BACKUP_NAME),
            temporary: dir.join(format!("{BACKUP_NAME}.tmp")),
            previous: dir.join(format!("{BACKUP_NAME}.previous")),
            dir,
        }
    }

    pub fn exists(&self) -> bool {
        self.canonical.is_file()
    }

    /// Modification time of the canonical artifact, if any.
    pub fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.canonical)
            .and_then(|m| m.modified())
            .ok()
    }
}

#[cfg(test)]
#[path = "layout_tests.rs"]
mod tests;
