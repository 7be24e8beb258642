// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Continuous WAL archiving.
//!
//! Archiving is switched on and off by rewriting directives in the engine
//! configuration. While the engine runs, a WAL receiver streams segments into
//! the archive directory; the engine's own `archive_command` calls back into
//! this binary (`xpg archive`) as a second path.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{Engine, FormatVersion};
use crate::error::{Error, Result};
use crate::fsutil::{sibling, sync_dir, touch, write_atomic};
use crate::layout::{self, BAD_SIZE_SUFFIX, IN_PROGRESS_SUFFIX, PARTIAL_SUFFIX};
use crate::process::ProcessHandle;

/// Printed by the receiver once it is connected and streaming.
const STREAMING_MARKER: &str = "starting log streaming";
/// Time a receiver gets to exit on its own before it is interrupted.
const RECEIVER_GRACE: Duration = Duration::from_secs(5);
/// Replication rule the receiver needs on the local socket.
const REPLICATION_RULE: &str = "local replication all trust";

/// Directives rewritten by [`ArchiveManager::toggle`].
const DIRECTIVES: &[&str] = &[
    "archive_mode",
    "archive_command",
    "archive_timeout",
    "max_wal_senders",
    "wal_level",
];

/// Rewrite every line setting `name` (commented or not) with `replace`.
///
/// Lines not matching any directive are kept verbatim; directives absent from
/// `text` are not added.
pub fn transform_conf<F>(text: &str, directives: &[&str], mut replace: F) -> Result<String>
where
    F: FnMut(&str, &str) -> String,
{
    let patterns = directives
        .iter()
        .map(|name| {
            let regex = Regex::new(&format!(r"^\s*#?\s*{}\s*=", regex::escape(name)))?;
            Ok((*name, regex))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let body = line.strip_suffix('\n').unwrap_or(line);
        match patterns.iter().find(|(_, re)| re.is_match(body)) {
            Some((name, _)) => {
                out.push_str(&replace(name, body));
                if line.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str(line),
        }
    }
    Ok(out)
}

/// Comment out a configuration line, leaving commented lines alone.
fn commented(line: &str) -> String {
    if line.trim_start().starts_with('#') {
        line.to_string()
    } else {
        format!("#{line}")
    }
}

/// Quote a value for `postgresql.conf`.
fn conf_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Outcome of [`archive_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveCopy {
    Copied,
    AlreadyPresent,
}

/// Copy a finished WAL segment into the archive.
///
/// A target of the same size is left alone. Otherwise the data goes to
/// `<to>.in-progress`, is flushed and size-checked, then renamed into place.
pub fn archive_file(from: &Path, to: &Path) -> Result<ArchiveCopy> {
    let expected = fs::metadata(from)?.len();
    if let Ok(existing) = fs::metadata(to) {
        if existing.len() == expected {
            return Ok(ArchiveCopy::AlreadyPresent);
        }
        warn!(path = %to.display(), "replacing archived file of different size");
    }

    let tmp = sibling(to, IN_PROGRESS_SUFFIX);
    fs::copy(from, &tmp)?;
    fs::File::open(&tmp)?.sync_all()?;
    let actual = fs::metadata(&tmp)?.len();
    if actual != expected {
        let _ = fs::remove_file(&tmp);
        return Err(Error::SizeMismatch {
            path: to.display().to_string(),
            expected,
            actual,
        });
    }
    fs::rename(&tmp, to)?;
    if let Some(parent) = to.parent() {
        sync_dir(parent)?;
    }
    Ok(ArchiveCopy::Copied)
}

/// A receiver that has been spawned but may not be streaming yet.
#[derive(Debug)]
pub struct WalReceiver {
    handle: ProcessHandle,
    started: oneshot::Receiver<()>,
}

impl WalReceiver {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Wait until the receiver reports streaming; error if it exits first.
    pub async fn started(self) -> Result<ProcessHandle> {
        let WalReceiver { handle, started } = self;
        let streaming = tokio::select! {
            biased;
            signalled = started => signalled.is_ok(),
            _ = handle.wait() => false,
        };
        if streaming {
            info!(pid = ?handle.pid(), "WAL receiver streaming");
            Ok(handle)
        } else {
            Err(Error::ExitedEarly(handle.name().to_string()))
        }
    }
}

/// Archive directory, engine archiving directives and the WAL receiver.
#[derive(Debug, Clone)]
pub struct ArchiveManager {
    config: Arc<Config>,
    engine: Engine,
    version: FormatVersion,
    helper: PathBuf,
}

impl ArchiveManager {
    /// `helper` is the binary the engine's `archive_command` runs.
    pub fn new(config: Arc<Config>, version: FormatVersion, helper: PathBuf) -> Self {
        ArchiveManager {
            engine: Engine::current(&config),
            config,
            version,
            helper,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.config.archive_dir
    }

    /// Create the archive directory (mode 0700) if needed.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.config.archive_dir)?;
        Ok(())
    }

    fn wal_level(&self) -> &str {
        // `replica` was introduced in 9.6.
        if self.version < FormatVersion::new(9, Some(6)) && self.config.wal_level == "replica" {
            "hot_standby"
        } else {
            &self.config.wal_level
        }
    }

    fn enabled_value(&self, name: &str) -> String {
        match name {
            "archive_mode" => "on".to_string(),
            "archive_command" => conf_quote(&format!(
                "\"{}\" archive \"%p\" \"{}/%f\"",
                self.helper.display(),
                self.config.archive_dir.display()
            )),
            "archive_timeout" => "60".to_string(),
            "max_wal_senders" => "5".to_string(),
            _ => self.wal_level().to_string(),
        }
    }

    /// Switch archiving directives in the engine configuration on or off.
    pub fn toggle(&self, enabled: bool) -> Result<()> {
        let conf = self.config.data_dir.join(layout::CONF_FILE);
        let text = fs::read_to_string(&conf)?;
        let updated = transform_conf(&text, DIRECTIVES, |name, line| {
            if enabled {
                format!("{name} = {}", self.enabled_value(name))
            } else {
                commented(line)
            }
        })?;
        if updated != text {
            write_atomic(&conf, updated.as_bytes())?;
        }
        if enabled {
            self.ensure_replication_rule()?;
        }
        info!(enabled, "archiving configured");
        Ok(())
    }

    fn ensure_replication_rule(&self) -> Result<()> {
        let hba = self.config.data_dir.join(layout::HBA_FILE);
        let text = match fs::read_to_string(&hba) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let wanted: Vec<&str> = REPLICATION_RULE.split_whitespace().collect();
        let present = text.lines().any(|line| {
            let line = line.split('#').next().unwrap_or_default();
            line.split_whitespace().collect::<Vec<_>>() == wanted
        });
        if present {
            return Ok(());
        }
        let mut updated = text;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(REPLICATION_RULE);
        updated.push('\n');
        write_atomic(&hba, updated.as_bytes())
    }

    /// Spawn the WAL receiver against the running engine.
    pub fn start_receiver(&self) -> Result<WalReceiver> {
        self.ensure_dir()?;
        let tool = self.version.receiver_tool();
        let mut command = self.engine.tools().command(tool);
        command
            .arg("-D")
            .arg(&self.config.archive_dir)
            .arg("-h")
            .arg(&self.config.socket_dir)
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-v")
            .env("LC_ALL", "C")
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        self.engine.connect_as(&mut command);

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            tool: tool.to_string(),
            source,
        })?;
        let stderr = child.stderr.take();
        let handle = ProcessHandle::from_child(tool, child);

        let (tx, started) = oneshot::channel();
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut tx = Some(tx);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "xpg::receiver", "{line}");
                    if line.contains(STREAMING_MARKER) {
                        if let Some(tx) = tx.take() {
                            let _ = tx.send(());
                        }
                    }
                }
            });
        }
        Ok(WalReceiver { handle, started })
    }

    /// Let the receiver finish on its own, interrupting it after a grace period.
    pub async fn stop_receiver(&self, handle: &ProcessHandle) {
        if handle.wait_timeout(RECEIVER_GRACE).await.is_some() {
            return;
        }
        debug!("interrupting WAL receiver");
        if let Err(e) = handle.signal(Signal::SIGINT) {
            warn!(error = %e, "failed to interrupt WAL receiver");
        }
        let status = handle.wait().await;
        debug!(%status, "WAL receiver stopped");
    }

    fn entries(&self) -> Result<Vec<(String, PathBuf)>> {
        let read = match fs::read_dir(&self.config.archive_dir) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for entry in read {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                entries.push((name.to_string(), entry.path()));
            }
        }
        Ok(entries)
    }

    /// Remove leftovers of interrupted transfers. Returns how many went.
    ///
    /// `X.partial` goes when `X` is complete; `*.in-progress` always goes.
    pub fn prune_stale_archive(&self) -> Result<usize> {
        let mut removed = 0;
        for (name, path) in self.entries()? {
            let stale = if let Some(stem) = name.strip_suffix(PARTIAL_SUFFIX) {
                self.config.archive_dir.join(stem).exists()
            } else {
                name.ends_with(IN_PROGRESS_SUFFIX)
            };
            if stale {
                debug!(file = %name, "pruning stale archive entry");
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Bump the mtime of `.partial` files so they count as current.
    pub fn touch_partials(&self) -> Result<()> {
        for (name, path) in self.entries()? {
            if name.ends_with(PARTIAL_SUFFIX) {
                touch(&path)?;
            }
        }
        Ok(())
    }

    /// Rename `X.partial` to `X` where no complete `X` exists.
    pub fn unpartialize(&self) -> Result<usize> {
        let mut renamed = 0;
        for (name, path) in self.entries()? {
            let Some(stem) = name.strip_suffix(PARTIAL_SUFFIX) else {
                continue;
            };
            let complete = self.config.archive_dir.join(stem);
            if !complete.exists() {
                fs::rename(&path, &complete)?;
                renamed += 1;
            }
        }
        Ok(renamed)
    }

    /// Move aside segments whose size is not the configured segment size.
    pub fn quarantine_bad_sizes(&self) -> Result<usize> {
        let mut moved = 0;
        for (name, path) in self.entries()? {
            if !layout::is_segment_name(&name) {
                continue;
            }
            let size = fs::metadata(&path)?.len();
            if size != self.config.wal_segment_size {
                warn!(file = %name, size, "quarantining WAL segment of unexpected size");
                fs::rename(&path, sibling(&path, BAD_SIZE_SUFFIX))?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    /// Delete every archived segment and backup artifact. An opt-out marker
    /// survives.
    pub fn discard_all(&self) -> Result<()> {
        let read = match fs::read_dir(&self.config.archive_dir) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in read {
            let entry = entry?;
            if entry.file_name() == layout::DO_NOT_BACKUP_MARKER {
                continue;
            }
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        sync_dir(&self.config.archive_dir)?;
        info!(dir = %self.config.archive_dir.display(), "discarded archive");
        Ok(())
    }
}

#[cfg(test)]
#[path = "archive_tests.rs"]
mod tests;
