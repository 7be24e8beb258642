// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Supervisor configuration.
//!
//! A [`Config`] is resolved exactly once per invocation, from (lowest to
//! highest precedence) built-in defaults, an optional TOML settings file,
//! environment variables and command-line flags. Everything downstream takes
//! the resolved `Config` and never reads the environment itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::engine::FormatVersion;
use crate::env;
use crate::error::{Error, Result};
use crate::layout::{self, BackupArtifact};
use crate::lock::{Bequest, LockInheritance};

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_SOCKET_DIR: &str = "/tmp";
const DEFAULT_OLD_BIN_TEMPLATE: &str = "/usr/lib/postgresql/{version}/bin";
const DEFAULT_WAL_LEVEL: &str = "replica";
const DEFAULT_SERVICE_ACCOUNT: &str = "_postgres";
const DEFAULT_SUPERUSER: &str = "postgres";
const MIB: u64 = 1024 * 1024;

/// When and how base backups are taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
    /// Never back up more often than this.
    pub min_interval: Duration,
    /// Back up once the artifact is this old, regardless of WAL volume.
    pub max_age: Duration,
    /// Back up once this many bytes of WAL were archived since the artifact.
    pub wal_ceiling: u64,
    /// Pre-backup WAL segments kept after a successful backup.
    pub keep_segments: usize,
    /// Pause between failed backup attempts.
    pub retry_delay: Duration,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        BackupPolicy {
            min_interval: Duration::from_secs(6 * 60 * 60),
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            wal_ceiling: 1024 * MIB,
            keep_segments: 4,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Backup section of the settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackupSettings {
    pub min_interval_secs: Option<u64>,
    pub max_age_secs: Option<u64>,
    pub wal_ceiling_mb: Option<u64>,
    pub keep_segments: Option<usize>,
    pub retry_delay_secs: Option<u64>,
}

/// Optional TOML settings file (`--config-file`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub data_dir: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
    pub socket_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub bin_dir: Option<PathBuf>,
    /// Binary directory of an older engine; `{version}` is substituted.
    pub old_bin_template: Option<String>,
    pub heartbeat_secs: Option<u64>,
    pub stop_timeout_secs: Option<u64>,
    pub lock_attempts: Option<u32>,
    pub wal_segment_mb: Option<u64>,
    pub wal_level: Option<String>,
    pub service_account: Option<String>,
    pub superuser: Option<String>,
    /// Command run with the data directory appended to exclude it from
    /// external backups.
    pub exclusion_command: Option<Vec<String>>,
    pub backup: BackupSettings,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Environment overrides, captured in one place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub bin_dir: Option<PathBuf>,
    pub old_bin_template: Option<String>,
    pub archive_dir: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        EnvOverrides {
            data_dir: env::pgdata(),
            port: env::pgport(),
            bin_dir: env::bin_dir(),
            old_bin_template: env::old_bin_template(),
            archive_dir: env::archive_dir(),
        }
    }
}

/// Engine command-line flags the supervisor inspects.
///
/// Flags it needs (`-D`, `-p`, `-k` and their `-c`/`--name=value` spellings)
/// are consumed; its own `--config-file` and `--inherit-lock` are consumed;
/// everything else is kept in `passthrough` for the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineArgs {
    pub data_dir: Option<PathBuf>,
    pub port: Option<u16>,
    pub socket_dir: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub inheritance: LockInheritance,
    pub passthrough: Vec<String>,
}

impl EngineArgs {
    pub fn inspect<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = EngineArgs::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            if let Some((flag, inline)) = short_flag(&arg, &["-D", "-p", "-k", "-c"]) {
                let value = match inline {
                    Some(v) => v,
                    None => args
                        .next()
                        .ok_or_else(|| Error::InvalidConfig(format!("{flag} needs a value")))?,
                };
                match flag {
                    "-D" => parsed.data_dir = Some(PathBuf::from(value)),
                    "-p" => parsed.port = Some(parse_port(&value)?),
                    "-k" => parsed.socket_dir = Some(first_socket_dir(&value)),
                    _ => {
                        if !parsed.setting(&value)? {
                            parsed.passthrough.push("-c".to_string());
                            parsed.passthrough.push(value);
                        }
                    }
                }
            } else if let Some(rest) = arg.strip_prefix("--config-file") {
                parsed.config_file = Some(PathBuf::from(long_value(rest, &mut args, &arg)?));
            } else if let Some(rest) = arg.strip_prefix("--inherit-lock") {
                let bequest: Bequest = long_value(rest, &mut args, &arg)?.parse()?;
                parsed.inheritance.insert(bequest);
            } else if let Some(setting) = arg.strip_prefix("--").filter(|s| s.contains('=')) {
                let setting = setting.to_string();
                if !parsed.setting(&setting)? {
                    parsed.passthrough.push(arg);
                }
            } else {
                parsed.passthrough.push(arg);
            }
        }
        Ok(parsed)
    }

    /// Absorb a `name=value` engine setting. Returns false if not inspected.
    fn setting(&mut self, setting: &str) -> Result<bool> {
        let Some((name, value)) = setting.split_once('=') else {
            return Ok(false);
        };
        let name = name.replace('-', "_");
        let value = value.trim().trim_matches('\'');
        match name.as_str() {
            "data_directory" => self.data_dir = Some(PathBuf::from(value)),
            "port" => self.port = Some(parse_port(value)?),
            "unix_socket_directories" | "unix_socket_directory" => {
                self.socket_dir = Some(first_socket_dir(value))
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

/// Split `-Dvalue` / `-D` into the flag and an optional inline value.
fn short_flag<'a>(arg: &'a str, flags: &[&'static str]) -> Option<(&'static str, Option<String>)> {
    flags.iter().find_map(|flag| {
        let rest = arg.strip_prefix(flag)?;
        Some((*flag, (!rest.is_empty()).then(|| rest.to_string())))
    })
}

fn long_value(
    rest: &str,
    args: &mut impl Iterator<Item = String>,
    arg: &str,
) -> Result<String> {
    match rest.strip_prefix('=') {
        Some(value) => Ok(value.to_string()),
        None if rest.is_empty() => args
            .next()
            .ok_or_else(|| Error::InvalidConfig(format!("{arg} needs a value"))),
        None => Err(Error::InvalidConfig(format!("unknown option {arg}"))),
    }
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid port: '{value}'")))
}

fn first_socket_dir(value: &str) -> PathBuf {
    PathBuf::from(value.split(',').next().unwrap_or(value).trim())
}

fn megabytes(key: &str, mb: u64) -> Result<u64> {
    mb.checked_mul(MIB)
        .ok_or_else(|| Error::InvalidConfig(format!("{key} is too large: {mb}")))
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub port: u16,
    pub archive_dir: PathBuf,
    /// Directory of the current engine's binaries; `None` searches `PATH`.
    pub bin_dir: Option<PathBuf>,
    pub old_bin_template: String,
    pub backup: BackupPolicy,
    pub heartbeat_interval: Duration,
    pub stop_timeout: Duration,
    pub lock_attempts: u32,
    pub wal_segment_size: u64,
    pub wal_level: String,
    pub service_account: String,
    pub superuser: String,
    /// Role to connect and initialize as, when running under the service account.
    pub role: Option<String>,
    pub exclusion_command: Option<Vec<String>>,
    /// Extra engine flags passed through untouched.
    pub engine_args: Vec<String>,
    pub inheritance: LockInheritance,
}

impl Config {
    /// Defaults for `data_dir`, with the archive directory alongside it.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Config {
            archive_dir: default_archive_dir(&data_dir),
            data_dir,
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            port: DEFAULT_PORT,
            bin_dir: None,
            old_bin_template: DEFAULT_OLD_BIN_TEMPLATE.to_string(),
            backup: BackupPolicy::default(),
            heartbeat_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(30),
            lock_attempts: 10,
            wal_segment_size: 16 * MIB,
            wal_level: DEFAULT_WAL_LEVEL.to_string(),
            service_account: DEFAULT_SERVICE_ACCOUNT.to_string(),
            superuser: DEFAULT_SUPERUSER.to_string(),
            role: None,
            exclusion_command: None,
            engine_args: Vec::new(),
            inheritance: LockInheritance::new(),
        }
    }

    /// Resolve from flags and environment, loading `--config-file` if given.
    pub fn resolve(args: EngineArgs, env: EnvOverrides) -> Result<Self> {
        let settings = match &args.config_file {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        Self::resolve_with(args, settings, env)
    }

    pub fn resolve_with(args: EngineArgs, settings: Settings, env: EnvOverrides) -> Result<Self> {
        let data_dir = args
            .data_dir
            .or(env.data_dir)
            .or(settings.data_dir)
            .ok_or(Error::NoDataDir)?;
        let data_dir = absolute(&data_dir)?;

        let mut config = Config::new(data_dir);
        if let Some(dir) = env.archive_dir.or(settings.archive_dir) {
            config.archive_dir = absolute(&dir)?;
        }
        if let Some(dir) = args.socket_dir.or(settings.socket_dir) {
            config.socket_dir = absolute(&dir)?;
        }
        config.port = args.port.or(env.port).or(settings.port).unwrap_or(DEFAULT_PORT);
        config.bin_dir = env.bin_dir.or(settings.bin_dir);
        if let Some(template) = env.old_bin_template.or(settings.old_bin_template) {
            config.old_bin_template = template;
        }

        let backup = settings.backup;
        let policy = &mut config.backup;
        if let Some(secs) = backup.min_interval_secs {
            policy.min_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = backup.max_age_secs {
            policy.max_age = Duration::from_secs(secs);
        }
        if let Some(mb) = backup.wal_ceiling_mb {
            policy.wal_ceiling = megabytes("backup.wal_ceiling_mb", mb)?;
        }
        if let Some(keep) = backup.keep_segments {
            policy.keep_segments = keep;
        }
        if let Some(secs) = backup.retry_delay_secs {
            policy.retry_delay = Duration::from_secs(secs);
        }

        if let Some(secs) = settings.heartbeat_secs {
            config.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = settings.stop_timeout_secs {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(attempts) = settings.lock_attempts {
            config.lock_attempts = attempts;
        }
        if let Some(mb) = settings.wal_segment_mb {
            config.wal_segment_size = megabytes("wal_segment_mb", mb)?;
        }
        if let Some(level) = settings.wal_level {
            config.wal_level = level;
        }
        if let Some(account) = settings.service_account {
            config.service_account = account;
        }
        if let Some(superuser) = settings.superuser {
            config.superuser = superuser;
        }
        config.exclusion_command = settings.exclusion_command.filter(|c| !c.is_empty());
        config.engine_args = args.passthrough;
        config.inheritance = args.inheritance;

        if current_user().as_deref() == Some(config.service_account.as_str()) {
            config.role = Some(config.superuser.clone());
        }
        Ok(config)
    }

    pub fn control_socket(&self) -> PathBuf {
        layout::control_socket(&self.socket_dir)
    }

    pub fn socket_lock(&self) -> PathBuf {
        layout::socket_lock(&self.socket_dir)
    }

    pub fn ctl_lock(&self) -> PathBuf {
        layout::ctl_lock(&self.socket_dir)
    }

    pub fn backup_artifact(&self) -> BackupArtifact {
        BackupArtifact::in_archive(&self.archive_dir)
    }

    pub fn no_restore_marker(&self) -> PathBuf {
        self.data_dir.join(layout::NO_RESTORE_MARKER)
    }

    pub fn do_not_backup_marker(&self) -> PathBuf {
        self.archive_dir.join(layout::DO_NOT_BACKUP_MARKER)
    }

    /// Binary directory of the engine that wrote on-disk format `version`.
    pub fn old_bin_dir(&self, version: FormatVersion) -> PathBuf {
        PathBuf::from(
            self.old_bin_template
                .replace("{version}", &version.to_string()),
        )
    }
}

/// `<parent>/<name>-archive` next to the data directory.
fn default_archive_dir(data_dir: &Path) -> PathBuf {
    let name = data_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    data_dir.with_file_name(format!("{name}-archive"))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn current_user() -> Option<String> {
    let user = nix::unistd::User::from_uid(nix::unistd::getuid()).ok()??;
    Some(user.name)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
