// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Major-version upgrade by dump and reload between two live engines.
//!
//! The data directory moves through a fixed set of sibling names:
//!
//! - `<data>.upgrade-old`: the original data, served by the old engine
//! - `<data>`: a fresh `initdb` holding a synthetic pid file while the upgrade runs
//! - `<data>.upgrade-new`: copy of the fresh directory, loaded by the new engine
//! - `<data>.upgrade-discard`: the fresh directory once the load succeeded
//!
//! Finalizing marks the loaded copy complete before any rename, so after a
//! crash [`resume_interrupted_upgrade`] can always tell which copy to keep.

use std::fs;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::Signal;
use tracing::{info, warn};

use crate::archive::ArchiveManager;
use crate::config::Config;
use crate::engine::{write_synthetic_pid_file, Engine, FormatVersion, Launch};
use crate::error::{Error, Result};
use crate::fsutil::{copy_dir, sibling, sync_dir};
use crate::process::{run_checked, ExitStatus, ProcessHandle};
use crate::restore::private_socket_dir;

/// Written into the loaded copy once it is complete.
pub const UPGRADE_COMPLETE_MARKER: &str = ".UpgradeComplete";

/// Sibling paths used while upgrading one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePaths {
    pub original: PathBuf,
    pub old: PathBuf,
    pub workspace: PathBuf,
    pub discard: PathBuf,
}

impl UpgradePaths {
    pub fn new(data_dir: &Path) -> Self {
        UpgradePaths {
            original: data_dir.to_path_buf(),
            old: sibling(data_dir, ".upgrade-old"),
            workspace: sibling(data_dir, ".upgrade-new"),
            discard: sibling(data_dir, ".upgrade-discard"),
        }
    }
}

/// One upgrade attempt: its paths and the two ports its engines listen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeWorkspace {
    pub paths: UpgradePaths,
    pub old_port: u16,
    pub new_port: u16,
}

/// Two distinct local ports that were free a moment ago.
pub fn allocate_ports() -> Result<(u16, u16)> {
    let first = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    let second = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok((first.local_addr()?.port(), second.local_addr()?.port()))
}

/// What [`resume_interrupted_upgrade`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeResume {
    /// No upgrade leftovers.
    Clean,
    /// A finalize was cut short and has now been completed.
    Completed,
    /// An upgrade failed before its result was complete; left for inspection.
    Abandoned,
}

fn remove_dir_if_present(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn parent_of(path: &Path) -> &Path {
    path.parent().unwrap_or(Path::new("."))
}

/// Swap the loaded copy into place.
///
/// Every step is a rename or a deletion of a directory that is no longer
/// needed, and the loaded copy carries the completion marker throughout.
pub fn finalize(paths: &UpgradePaths) -> Result<()> {
    fs::write(paths.workspace.join(UPGRADE_COMPLETE_MARKER), b"")?;
    sync_dir(&paths.workspace)?;
    finish_finalize(paths)
}

fn finish_finalize(paths: &UpgradePaths) -> Result<()> {
    let parent = parent_of(&paths.original);
    if exists(&paths.workspace) {
        if exists(&paths.original) {
            fs::rename(&paths.original, &paths.discard)?;
        }
        fs::rename(&paths.workspace, &paths.original)?;
        sync_dir(parent)?;
    }
    remove_dir_if_present(&paths.discard)?;
    remove_dir_if_present(&paths.old)?;
    match fs::remove_file(paths.original.join(UPGRADE_COMPLETE_MARKER)) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    sync_dir(parent)?;
    Ok(())
}

/// Complete a finalize interrupted by a crash.
pub fn resume_interrupted_upgrade(data_dir: &Path) -> Result<UpgradeResume> {
    let paths = UpgradePaths::new(data_dir);
    let loaded_in_workspace = paths.workspace.join(UPGRADE_COMPLETE_MARKER).exists();
    let loaded_in_place = paths.original.join(UPGRADE_COMPLETE_MARKER).exists();

    if loaded_in_workspace || loaded_in_place {
        warn!(data_dir = %data_dir.display(), "completing interrupted upgrade");
        finish_finalize(&paths)?;
        return Ok(UpgradeResume::Completed);
    }
    if exists(&paths.old) || exists(&paths.workspace) {
        warn!(
            old = %paths.old.display(),
            "found leftovers of a failed upgrade; original data is kept there"
        );
        return Ok(UpgradeResume::Abandoned);
    }
    Ok(UpgradeResume::Clean)
}

/// Drives one upgrade from an older on-disk format to the current engine.
#[derive(Debug, Clone)]
pub struct Upgrader {
    config: Arc<Config>,
    archive: ArchiveManager,
    current: Engine,
}

impl Upgrader {
    pub fn new(config: Arc<Config>, archive: ArchiveManager) -> Self {
        Upgrader {
            current: Engine::current(&config),
            config,
            archive,
        }
    }

    pub async fn run(&self, from: FormatVersion) -> Result<()> {
        let (old_port, new_port) = allocate_ports()?;
        let workspace = UpgradeWorkspace {
            paths: UpgradePaths::new(&self.config.data_dir),
            old_port,
            new_port,
        };
        let paths = &workspace.paths;
        if exists(&paths.old) || exists(&paths.workspace) {
            return Err(Error::InvalidConfig(format!(
                "upgrade leftovers at {}; inspect and remove them first",
                paths.old.display()
            )));
        }
        info!(%from, old_port, new_port, "upgrading data directory");

        self.archive.toggle(false)?;
        fs::rename(&paths.original, &paths.old)?;
        self.initdb(&paths.original).await?;
        copy_dir(&paths.original, &paths.workspace)?;
        write_synthetic_pid_file(&paths.original)?;

        let socket_dir = private_socket_dir("upgrade")?;
        let result = self.dump_and_reload(from, &workspace, &socket_dir).await;
        let _ = fs::remove_dir_all(&socket_dir);
        result?;

        finalize(paths)?;
        self.archive.discard_all()?;
        info!(%from, "upgrade complete");
        Ok(())
    }

    async fn initdb(&self, data_dir: &Path) -> Result<()> {
        let mut command = self.current.tools().command("initdb");
        command
            .arg("-D")
            .arg(data_dir)
            .arg("-E")
            .arg("UTF8")
            .stdout(Stdio::null());
        if let Some(role) = self.current.role() {
            command.arg("-U").arg(role);
        }
        run_checked("initdb", &mut command).await
    }

    async fn dump_and_reload(
        &self,
        from: FormatVersion,
        workspace: &UpgradeWorkspace,
        socket_dir: &Path,
    ) -> Result<()> {
        let previous = Engine::previous(&self.config, from);
        let old = previous.start(&Launch {
            data_dir: &workspace.paths.old,
            port: workspace.old_port,
            socket_dir,
            listen: false,
            extra: &[],
        })?;
        let new = match self.current.start(&Launch {
            data_dir: &workspace.paths.workspace,
            port: workspace.new_port,
            socket_dir,
            listen: false,
            extra: &[],
        }) {
            Ok(new) => new,
            Err(e) => {
                previous.stop(&old, Signal::SIGINT).await;
                return Err(e);
            }
        };

        let result = async {
            previous.wait_ready(&old, socket_dir, workspace.old_port).await?;
            self.current
                .wait_ready(&new, socket_dir, workspace.new_port)
                .await?;
            self.pipe_dump(socket_dir, workspace).await
        }
        .await;

        let (old_status, new_status) = tokio::join!(
            previous.stop(&old, Signal::SIGINT),
            self.current.stop(&new, Signal::SIGINT)
        );
        info!(%old_status, %new_status, "upgrade engines stopped");
        result
    }

    /// `pg_dumpall` from the old engine straight into `psql` on the new one.
    async fn pipe_dump(&self, socket_dir: &Path, workspace: &UpgradeWorkspace) -> Result<()> {
        let mut dump = self.current.tools().command("pg_dumpall");
        dump.arg("-h")
            .arg(socket_dir)
            .arg("-p")
            .arg(workspace.old_port.to_string())
            .stdout(Stdio::piped());
        self.current.connect_as(&mut dump);

        let mut load = self.current.tools().command("psql");
        load.arg("-X")
            .arg("-q")
            .arg("-h")
            .arg(socket_dir)
            .arg("-p")
            .arg(workspace.new_port.to_string())
            .arg("-d")
            .arg("postgres")
            .stdin(Stdio::piped())
            .stdout(Stdio::null());
        self.current.connect_as(&mut load);

        let mut dump_child = dump.spawn().map_err(|source| Error::Spawn {
            tool: "pg_dumpall".to_string(),
            source,
        })?;
        let mut load_child = load.spawn().map_err(|source| Error::Spawn {
            tool: "psql".to_string(),
            source,
        })?;

        let copied = match (dump_child.stdout.take(), load_child.stdin.take()) {
            (Some(mut from), Some(mut to)) => tokio::io::copy(&mut from, &mut to).await,
            _ => Ok(0),
        };
        let dump = ProcessHandle::from_child("pg_dumpall", dump_child);
        let load = ProcessHandle::from_child("psql", load_child);
        let (dump_status, load_status) = tokio::join!(dump.wait(), load.wait());

        check("pg_dumpall", dump_status)?;
        check("psql", load_status)?;
        let bytes = copied?;
        info!(bytes, "dump reloaded");
        Ok(())
    }
}

fn check(tool: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::ToolFailed {
            tool: tool.to_string(),
            status: status.code(),
        })
    }
}

#[cfg(test)]
#[path = "upgrade_tests.rs"]
mod tests;
