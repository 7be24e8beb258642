// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Rebuilding the data directory from the base backup and archived WAL.

use std::fs;
use std::io::{BufReader, ErrorKind};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::archive::ArchiveManager;
use crate::config::Config;
use crate::engine::{read_format_version, Engine, FormatVersion, Launch};
use crate::error::{Error, Result};
use crate::fsutil::{write_atomic, POLL_INTERVAL};
use crate::upgrade::Upgrader;

/// Recovery configuration file read by engines before 12.
pub const RECOVERY_CONF: &str = "recovery.conf";
/// What engines before 12 rename `recovery.conf` to once recovery is done.
pub const RECOVERY_DONE: &str = "recovery.done";
/// Presence requests recovery on engines 12 and later.
pub const RECOVERY_SIGNAL: &str = "recovery.signal";
/// Settings file written by `ALTER SYSTEM`, read after `postgresql.conf`.
pub const AUTO_CONF: &str = "postgresql.auto.conf";

/// True when a backup exists and the data directory was never confirmed.
pub fn needs_restore(config: &Config) -> bool {
    config.backup_artifact().exists() && !config.no_restore_marker().exists()
}

/// Where an existing data directory is moved before a restore.
pub fn previous_data_dir(data_dir: &Path, stamp: &str) -> PathBuf {
    crate::fsutil::sibling(data_dir, &format!(".previous-{stamp}"))
}

fn restore_command(archive_dir: &Path) -> String {
    format!(
        "restore_command = 'cp \"{}/%f\" \"%p\"'\n",
        archive_dir.display().to_string().replace('\'', "''")
    )
}

/// Whether the engine has finished replaying the archive.
pub fn recovery_finished(data_dir: &Path, version: FormatVersion) -> bool {
    if version.uses_recovery_signal() {
        !data_dir.join(RECOVERY_SIGNAL).exists()
    } else {
        data_dir.join(RECOVERY_DONE).exists()
    }
}

/// Restore workflow: unpack the backup, then replay or upgrade.
#[derive(Debug, Clone)]
pub struct RestoreCoordinator {
    config: Arc<Config>,
    archive: ArchiveManager,
    engine: Engine,
    current: FormatVersion,
}

impl RestoreCoordinator {
    /// `current` is the on-disk format of the installed engine.
    pub fn new(config: Arc<Config>, archive: ArchiveManager, current: FormatVersion) -> Self {
        RestoreCoordinator {
            engine: Engine::current(&config),
            config,
            archive,
            current,
        }
    }

    /// Restore the data directory and bring it up to the current format.
    pub async fn restore(&self) -> Result<()> {
        let version = self.prepare()?;
        if version < self.current {
            info!(from = %version, to = %self.current, "restored data is outdated, upgrading");
            Upgrader::new(Arc::clone(&self.config), self.archive.clone())
                .run(version)
                .await
        } else {
            self.recover(version).await
        }
    }

    /// Unpack the backup into a fresh data directory, ready for recovery.
    ///
    /// Returns the on-disk format of the restored directory.
    pub fn prepare(&self) -> Result<FormatVersion> {
        let data_dir = &self.config.data_dir;
        let artifact = self.config.backup_artifact();

        let completed = self.archive.unpartialize()?;
        info!(completed, "restoring from base backup");

        if fs::symlink_metadata(data_dir).is_ok() {
            let stamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
            let aside = previous_data_dir(data_dir, &stamp);
            warn!(to = %aside.display(), "moving existing data directory aside");
            fs::rename(data_dir, &aside)?;
        }

        fs::DirBuilder::new().mode(0o700).create(data_dir)?;
        let file = fs::File::open(&artifact.canonical)?;
        tar::Archive::new(GzDecoder::new(BufReader::new(file))).unpack(data_dir)?;

        let version = read_format_version(data_dir)?;
        // The backup copied the live directory's markers; recovery has not run yet.
        for leftover in [data_dir.join(RECOVERY_DONE), self.config.no_restore_marker()] {
            match fs::remove_file(&leftover) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.write_recovery_config(version)?;
        self.archive.toggle(false)?;

        let quarantined = self.archive.quarantine_bad_sizes()?;
        if quarantined > 0 {
            warn!(quarantined, "set aside WAL segments of unexpected size");
        }
        Ok(version)
    }

    fn write_recovery_config(&self, version: FormatVersion) -> Result<()> {
        let data_dir = &self.config.data_dir;
        let command = restore_command(&self.config.archive_dir);
        if version.uses_recovery_signal() {
            let auto = data_dir.join(AUTO_CONF);
            let mut text = match fs::read_to_string(&auto) {
                Ok(text) => text,
                Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            };
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&command);
            write_atomic(&auto, text.as_bytes())?;
            write_atomic(&data_dir.join(RECOVERY_SIGNAL), b"")
        } else {
            write_atomic(&data_dir.join(RECOVERY_CONF), command.as_bytes())
        }
    }

    /// Run the engine privately until it has replayed the archive, then stop it.
    pub async fn recover(&self, version: FormatVersion) -> Result<()> {
        let data_dir = &self.config.data_dir;
        let socket_dir = private_socket_dir("restore")?;
        let launch = Launch {
            data_dir,
            port: self.config.port,
            socket_dir: &socket_dir,
            listen: false,
            extra: &self.config.engine_args,
        };
        let handle = self.engine.start(&launch)?;
        info!("replaying archived WAL");

        let result = loop {
            if recovery_finished(data_dir, version) {
                break Ok(());
            }
            if handle.try_status().is_some() {
                break Err(Error::ExitedEarly(handle.name().to_string()));
            }
            tokio::select! {
                _ = handle.wait() => {}
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        };

        let status = self.engine.stop(&handle, Signal::SIGINT).await;
        let _ = fs::remove_dir_all(&socket_dir);
        result?;
        info!(%status, "recovery complete");
        Ok(())
    }
}

/// A socket directory no client knows about.
pub(crate) fn private_socket_dir(purpose: &str) -> Result<PathBuf> {
    static SEQUENCE: AtomicU32 = AtomicU32::new(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("xpg-{purpose}-{}-{seq}", std::process::id()));
    match fs::DirBuilder::new().mode(0o700).create(&dir) {
        Ok(()) => Ok(dir),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(dir),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[path = "restore_tests.rs"]
mod tests;
