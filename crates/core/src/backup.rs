// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Periodic base backups into the archive directory.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::archive::ArchiveManager;
use crate::config::Config;
use crate::engine::{Engine, FormatVersion};
use crate::error::Result;
use crate::fsutil::sync_dir;
use crate::layout::{self, BackupArtifact, PARTIAL_SUFFIX};
use crate::process::run_checked;
use crate::refcount::RefCount;

/// Whether a backup is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    Running,
}

/// How a call to [`BackupEngine::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    /// A new artifact is at the canonical path.
    Completed(PathBuf),
    /// The supervisor lost its last client before a backup succeeded.
    Abandoned,
    /// Another backup was already running.
    Skipped,
}

/// A WAL file in the archive directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    /// Birth time where the filesystem records one, else modification time.
    pub created: SystemTime,
    pub size: u64,
}

/// Clears the running flag when a backup ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Takes base backups with the engine's backup tool.
#[derive(Debug, Clone)]
pub struct BackupEngine {
    config: Arc<Config>,
    archive: ArchiveManager,
    engine: Engine,
    version: FormatVersion,
    refcount: RefCount,
    running: Arc<AtomicBool>,
}

impl BackupEngine {
    pub fn new(
        config: Arc<Config>,
        archive: ArchiveManager,
        version: FormatVersion,
        refcount: RefCount,
    ) -> Self {
        BackupEngine {
            engine: Engine::current(&config),
            config,
            archive,
            version,
            refcount,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn state(&self) -> BackupState {
        if self.running.load(Ordering::SeqCst) {
            BackupState::Running
        } else {
            BackupState::Idle
        }
    }

    pub fn artifact(&self) -> BackupArtifact {
        self.config.backup_artifact()
    }

    pub fn should_backup(&self) -> bool {
        self.should_backup_at(SystemTime::now())
    }

    /// Backup decision as of `now`.
    pub fn should_backup_at(&self, now: SystemTime) -> bool {
        if self.config.do_not_backup_marker().exists() {
            return false;
        }
        if self.state() == BackupState::Running {
            return false;
        }
        let Some(taken) = self.artifact().modified() else {
            return true;
        };
        let age = now.duration_since(taken).unwrap_or(Duration::ZERO);
        let policy = &self.config.backup;
        if age < policy.min_interval {
            return false;
        }
        if age >= policy.max_age {
            return true;
        }
        match self.wal_since(taken) {
            Ok(bytes) => bytes >= policy.wal_ceiling,
            Err(e) => {
                warn!(error = %e, "could not measure archived WAL");
                false
            }
        }
    }

    /// Bytes of WAL archived after `since`, counting partial segments.
    fn wal_since(&self, since: SystemTime) -> Result<u64> {
        let mut total = 0;
        for entry in read_archive(&self.config.archive_dir, true)? {
            let modified = fs::metadata(&entry.path)?.modified()?;
            if modified > since {
                total += entry.size;
            }
        }
        Ok(total)
    }

    /// Complete archived segments, oldest first.
    pub fn archive_entries(&self) -> Result<Vec<ArchiveEntry>> {
        read_archive(&self.config.archive_dir, false)
    }

    /// Take a base backup, retrying until it succeeds or no client remains.
    ///
    /// Afterwards only the newest `keep_segments` of the segments archived
    /// before the backup started are kept.
    pub async fn run(&self) -> Result<BackupOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(BackupOutcome::Skipped);
        }
        let _guard = RunningGuard(&self.running);

        let started = SystemTime::now();
        self.archive.touch_partials()?;
        let before: Vec<ArchiveEntry> = self
            .archive_entries()?
            .into_iter()
            .filter(|e| e.created <= started)
            .collect();

        let artifact = self.artifact();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&artifact.dir)?;

        info!("starting base backup");
        let mut attempt = 0u32;
        loop {
            if !self.refcount.is_alive() {
                remove_if_present(&artifact.temporary)?;
                info!("base backup abandoned, supervisor is shutting down");
                return Ok(BackupOutcome::Abandoned);
            }
            attempt += 1;
            match self.attempt(&artifact.temporary).await {
                Ok(()) => break,
                Err(e) => warn!(attempt, error = %e, "base backup failed, will retry"),
            }
            remove_if_present(&artifact.temporary)?;
            tokio::select! {
                _ = tokio::time::sleep(self.config.backup.retry_delay) => {}
                _ = self.refcount.wait_zero() => {}
            }
        }

        publish(&artifact)?;
        let pruned = prune(&before, self.config.backup.keep_segments)?;
        info!(attempts = attempt, pruned, "base backup complete");
        Ok(BackupOutcome::Completed(artifact.canonical))
    }

    async fn attempt(&self, temporary: &Path) -> Result<()> {
        let out = fs::File::create(temporary)?;
        let mut command = self.engine.tools().command("pg_basebackup");
        command
            .arg("-D")
            .arg("-")
            .arg("-Ft")
            .arg("-z")
            .arg("-h")
            .arg(&self.config.socket_dir)
            .arg("-p")
            .arg(self.config.port.to_string())
            .stdout(Stdio::from(out));
        if self.version.supports_wal_method_none() {
            command.arg("-X").arg("none");
        }
        self.engine.connect_as(&mut command);
        run_checked("pg_basebackup", &mut command).await
    }
}

/// Flush the temporary artifact, keep the current one as `.previous`, and
/// move the new one into place.
fn publish(artifact: &BackupArtifact) -> Result<()> {
    fs::File::open(&artifact.temporary)?.sync_all()?;
    if artifact.exists() {
        remove_if_present(&artifact.previous)?;
        fs::hard_link(&artifact.canonical, &artifact.previous)?;
    }
    fs::rename(&artifact.temporary, &artifact.canonical)?;
    sync_dir(&artifact.dir)
}

/// Delete all but the newest `keep` of `entries` (sorted oldest first).
fn prune(entries: &[ArchiveEntry], keep: usize) -> Result<usize> {
    let excess = entries.len().saturating_sub(keep);
    for entry in &entries[..excess] {
        debug!(path = %entry.path.display(), "pruning archived segment");
        remove_if_present(&entry.path)?;
    }
    Ok(excess)
}

fn read_archive(dir: &Path, with_partials: bool) -> Result<Vec<ArchiveEntry>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut entries = Vec::new();
    for entry in read {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let segment = name.strip_suffix(PARTIAL_SUFFIX).filter(|_| with_partials).unwrap_or(name);
        if !layout::is_segment_name(segment) {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let created = meta.created().or_else(|_| meta.modified())?;
        entries.push(ArchiveEntry {
            path: entry.path(),
            created,
            size: meta.len(),
        });
    }
    entries.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.path.cmp(&b.path)));
    Ok(entries)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
#[path = "backup_tests.rs"]
mod tests;
