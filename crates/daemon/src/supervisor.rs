// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The supervisor: owns the engine, the WAL receiver and the backup schedule
//! for one data directory, and stays up while any client holds a reference.
//!
//! Lifecycle:
//! 1. Take the socket lock (retrying, or by inheritance) and bind the control socket
//! 2. Finish an interrupted upgrade, restore from backup if needed
//! 3. Check, upgrade and configure the data directory, then start the engine
//! 4. Keep the WAL receiver alive and take base backups when due
//! 5. When the reference count drops to zero, run shutdown hooks, then reply
//!    to the waiting clients, then remove the socket and the lock

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture};
use nix::sys::signal::Signal;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use xpg_core::engine::{read_format_version, sanitize_pid_file};
use xpg_core::exclude::exclude_from_backups;
use xpg_core::fsutil::write_atomic;
use xpg_core::restore::needs_restore;
use xpg_core::{
    env, resume_interrupted_upgrade, ArchiveManager, BackupEngine, BackupOutcome, Config, Decref,
    Engine, Error, ExitStatus, Launch, NamedLock, ProcessHandle, RefCount, RestoreCoordinator,
    Result, UpgradeResume, Upgrader,
};

use crate::control;

/// Pause before restarting a WAL receiver that exited.
const RECEIVER_RESTART_DELAY: Duration = Duration::from_secs(5);
/// Added to the engine stop timeout to bound the shutdown hooks.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(10);

/// Where the supervisor is in its life. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Starting,
    Restoring,
    Running,
    ShuttingDown,
    Stopped,
}

/// Work run during shutdown.
pub type Hook = BoxFuture<'static, ()>;

/// Shared supervisor state. Clones refer to the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<Config>,
    engine: Engine,
    refcount: RefCount,
    phase: watch::Sender<Phase>,
    engine_handle: Mutex<Option<ProcessHandle>>,
    receiver: Mutex<Option<ProcessHandle>>,
    archive: OnceLock<ArchiveManager>,
    backup_task: Mutex<Option<JoinHandle<()>>>,
    restoring: AtomicBool,
    engine_failed: AtomicBool,
    shutdown_hooks: Mutex<Vec<Hook>>,
    /// `None` once the post-shutdown hooks have run.
    post_shutdown_hooks: Mutex<Option<Vec<Hook>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a supervisor for `config` until its last client lets go.
///
/// Returns the process exit code. Errors are reserved for failing to take
/// the socket lock or bind the control socket.
pub async fn run(config: Config) -> Result<i32> {
    let config = Arc::new(config);
    let mut socket_lock =
        NamedLock::new(config.socket_lock()).with_inheritance(&config.inheritance);
    if !socket_lock
        .acquire_with_backoff(config.lock_attempts)
        .await?
    {
        return Err(Error::LockBusy(socket_lock.path().display().to_string()));
    }

    let socket = config.control_socket();
    let listener = match bind(&socket) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = socket_lock.remove();
            return Err(e);
        }
    };
    info!(socket = %socket.display(), "listening");

    let supervisor = Supervisor::new(Arc::clone(&config));
    let server = tokio::spawn(control::serve(supervisor.clone(), listener));
    let signals = match supervisor.watch_signals() {
        Ok(task) => Some(task),
        Err(e) => {
            warn!(error = %e, "could not install signal handlers");
            None
        }
    };

    let code = supervisor.supervise().await;

    server.abort();
    if let Some(signals) = signals {
        signals.abort();
    }
    if let Err(e) = fs::remove_file(&socket) {
        if e.kind() != ErrorKind::NotFound {
            warn!(error = %e, "failed to remove control socket");
        }
    }
    if let Err(e) = socket_lock.remove() {
        warn!(error = %e, "failed to remove socket lock");
    }
    supervisor.advance(Phase::Stopped);
    Ok(code)
}

/// Bind the control socket, replacing a stale one. Only call with the lock held.
fn bind(socket: &Path) -> Result<UnixListener> {
    match fs::remove_file(socket) {
        Ok(()) => debug!(socket = %socket.display(), "removed stale control socket"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(socket)?)
}

/// The binary the engine's `archive_command` invokes.
fn helper_binary() -> PathBuf {
    env::supervisor_binary()
        .or_else(|| std::env::current_exe().ok())
        .unwrap_or_else(|| PathBuf::from("xpg"))
}

impl Supervisor {
    /// A supervisor with one reference: the client that started it.
    pub fn new(config: Arc<Config>) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        Supervisor {
            inner: Arc::new(Inner {
                engine: Engine::current(&config),
                config,
                refcount: RefCount::new(1),
                phase,
                engine_handle: Mutex::new(None),
                receiver: Mutex::new(None),
                archive: OnceLock::new(),
                backup_task: Mutex::new(None),
                restoring: AtomicBool::new(false),
                engine_failed: AtomicBool::new(false),
                shutdown_hooks: Mutex::new(Vec::new()),
                post_shutdown_hooks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    #[allow(dead_code)]
    pub fn refcount(&self) -> usize {
        self.inner.refcount.get()
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    pub fn is_restoring(&self) -> bool {
        self.inner.restoring.load(Ordering::SeqCst)
    }

    /// Move to `next` unless already there or beyond.
    pub fn advance(&self, next: Phase) {
        self.inner.phase.send_if_modified(|phase| {
            if *phase < next {
                debug!(from = ?*phase, to = ?next, "phase change");
                *phase = next;
                true
            } else {
                false
            }
        });
    }

    /// Add a client. `None` once shutdown is underway.
    pub fn incref(&self) -> Option<usize> {
        if self.phase() >= Phase::ShuttingDown || !self.inner.refcount.is_alive() {
            return None;
        }
        Some(self.inner.refcount.incref())
    }

    pub fn decref(&self) -> Decref {
        self.inner.refcount.decref()
    }

    /// Ask the engine to reload its configuration.
    pub fn reload_engine(&self) -> std::result::Result<(), String> {
        let handle = lock(&self.inner.engine_handle).clone();
        let Some(handle) = handle else {
            return Err("engine not running".to_string());
        };
        info!("reloading engine configuration");
        handle.signal(Signal::SIGHUP).map_err(|e| e.to_string())
    }

    /// Run `hook` concurrently with the other shutdown hooks.
    #[allow(dead_code)]
    pub fn on_shutdown(&self, hook: Hook) {
        lock(&self.inner.shutdown_hooks).push(hook);
    }

    /// Run `hook` once shutdown has completed, or right away if it already has.
    pub fn after_shutdown(&self, hook: Hook) {
        let mut hooks = lock(&self.inner.post_shutdown_hooks);
        match hooks.as_mut() {
            Some(hooks) => hooks.push(hook),
            None => {
                tokio::spawn(hook);
            }
        }
    }

    pub(crate) fn set_engine(&self, handle: ProcessHandle) {
        *lock(&self.inner.engine_handle) = Some(handle);
    }

    /// Drop every reference on SIGTERM or SIGINT.
    fn watch_signals(&self) -> Result<JoinHandle<()>> {
        let mut term = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let refcount = self.inner.refcount.clone();
        Ok(tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    Some(()) = term.recv() => "SIGTERM",
                    Some(()) = interrupt.recv() => "SIGINT",
                    else => break,
                };
                info!(signal = name, "received signal, shutting down");
                refcount.clear();
            }
        }))
    }

    /// Start everything, wait for the last reference to go, then shut down.
    async fn supervise(&self) -> i32 {
        let started = self.start().await;
        if let Err(e) = &started {
            error!(error = %e, "startup failed");
            self.inner.refcount.clear();
        }
        self.inner.refcount.wait_zero().await;
        self.shutdown().await;

        if started.is_err() || self.inner.engine_failed.load(Ordering::SeqCst) {
            1
        } else {
            0
        }
    }

    async fn start(&self) -> Result<()> {
        let config = &self.inner.config;
        let data_dir = &config.data_dir;

        match resume_interrupted_upgrade(data_dir)? {
            UpgradeResume::Completed => info!("finished an interrupted upgrade"),
            UpgradeResume::Abandoned => {
                warn!("a failed upgrade left its directories behind; they are kept for inspection")
            }
            UpgradeResume::Clean => {}
        }

        let current = self.inner.engine.version().await?;
        info!(version = %current, "found engine");
        let archive = self
            .inner
            .archive
            .get_or_init(|| ArchiveManager::new(Arc::clone(config), current, helper_binary()))
            .clone();

        if needs_restore(config) {
            self.advance(Phase::Restoring);
            self.inner.restoring.store(true, Ordering::SeqCst);
            let restored = RestoreCoordinator::new(Arc::clone(config), archive.clone(), current)
                .restore()
                .await;
            self.inner.restoring.store(false, Ordering::SeqCst);
            restored?;
        }

        if let Some(command) = &config.exclusion_command {
            exclude_from_backups(command, data_dir).await;
        }

        let on_disk = read_format_version(data_dir)?;
        let checker = if on_disk < current {
            Engine::previous(config, on_disk)
        } else {
            self.inner.engine.clone()
        };
        checker.check_control_data(data_dir).await?;
        if on_disk < current {
            info!(from = %on_disk, to = %current, "data directory is outdated, upgrading");
            Upgrader::new(Arc::clone(config), archive.clone())
                .run(on_disk)
                .await?;
        }

        archive.toggle(true)?;
        if sanitize_pid_file(data_dir, std::process::id())? {
            info!("took over stale postmaster.pid");
        }
        let pruned = archive.prune_stale_archive()?;
        if pruned > 0 {
            info!(pruned, "removed leftovers from the archive");
        }

        if !self.inner.refcount.is_alive() {
            info!("no clients left, not starting the engine");
            return Ok(());
        }

        let launch = Launch {
            data_dir,
            port: config.port,
            socket_dir: &config.socket_dir,
            listen: true,
            extra: &config.engine_args,
        };
        let handle = self.inner.engine.start(&launch)?;
        self.set_engine(handle.clone());
        tokio::spawn(self.clone().watch_engine(handle.clone()));
        self.inner
            .engine
            .wait_ready(&handle, &config.socket_dir, config.port)
            .await?;
        write_atomic(&config.no_restore_marker(), b"")?;
        info!(port = config.port, "engine ready");

        self.advance(Phase::Running);
        tokio::spawn(self.clone().keep_receiver(archive.clone()));
        let backups = BackupEngine::new(
            Arc::clone(config),
            archive,
            current,
            self.inner.refcount.clone(),
        );
        tokio::spawn(self.clone().heartbeat(backups));
        Ok(())
    }

    /// Force shutdown if the engine exits on its own.
    async fn watch_engine(self, handle: ProcessHandle) {
        let status = handle.wait().await;
        if self.phase() >= Phase::ShuttingDown {
            return;
        }
        error!(%status, "engine exited unexpectedly");
        self.inner.engine_failed.store(true, Ordering::SeqCst);
        self.inner.refcount.clear();
    }

    /// Keep a WAL receiver streaming while running.
    async fn keep_receiver(self, archive: ArchiveManager) {
        while self.phase() == Phase::Running {
            match archive.start_receiver() {
                Ok(receiver) => {
                    let handle = receiver.handle().clone();
                    *lock(&self.inner.receiver) = Some(handle.clone());
                    // Shutdown may already have collected its hooks.
                    if self.phase() != Phase::Running {
                        let _ = handle.signal(Signal::SIGINT);
                        break;
                    }
                    match receiver.started().await {
                        Ok(handle) => {
                            info!("WAL receiver streaming");
                            let status = handle.wait().await;
                            if self.phase() == Phase::Running {
                                warn!(%status, "WAL receiver exited");
                            }
                        }
                        Err(e) => warn!(error = %e, "WAL receiver did not start streaming"),
                    }
                }
                Err(e) => warn!(error = %e, "failed to start WAL receiver"),
            }

            if self.phase() != Phase::Running {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(RECEIVER_RESTART_DELAY) => {}
                _ = self.left_running() => {}
            }
        }
    }

    /// Check the backup policy once per heartbeat and start a backup when due.
    async fn heartbeat(self, backups: BackupEngine) {
        let mut ticks = tokio::time::interval(self.inner.config.heartbeat_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = self.left_running() => break,
            }
            if self.phase() != Phase::Running {
                break;
            }
            if !backups.should_backup() {
                continue;
            }
            let backups = backups.clone();
            let task = tokio::spawn(async move {
                match backups.run().await {
                    Ok(BackupOutcome::Completed(path)) => {
                        info!(path = %path.display(), "base backup complete")
                    }
                    Ok(BackupOutcome::Abandoned) => info!("base backup abandoned"),
                    Ok(BackupOutcome::Skipped) => debug!("base backup already running"),
                    Err(e) => warn!(error = %e, "base backup failed"),
                }
            });
            *lock(&self.inner.backup_task) = Some(task);
        }
    }

    async fn left_running(&self) {
        let mut phase = self.inner.phase.subscribe();
        let _ = phase.wait_for(|p| *p != Phase::Running).await;
    }

    /// Stop the engine: drop idle sessions (not while restoring), deliver
    /// `signal`, and escalate to SIGQUIT after the stop timeout.
    pub async fn stop_engine(&self, handle: &ProcessHandle, signal: Signal) -> ExitStatus {
        let config = &self.inner.config;
        if !self.is_restoring() {
            let terminate = self
                .inner
                .engine
                .terminate_idle_connections(&config.socket_dir, config.port);
            match tokio::time::timeout(config.stop_timeout, terminate).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "could not terminate idle connections"),
                Err(_) => debug!("timed out terminating idle connections"),
            }
        }
        let status = self.inner.engine.stop(handle, signal).await;
        info!(%status, "engine stopped");
        status
    }

    /// Run shutdown hooks concurrently under a bounded window, then the
    /// post-shutdown hooks.
    pub async fn shutdown(&self) {
        self.advance(Phase::ShuttingDown);
        info!("shutting down");

        let mut hooks = std::mem::take(&mut *lock(&self.inner.shutdown_hooks));
        let engine = lock(&self.inner.engine_handle).take();
        if let Some(handle) = engine {
            let supervisor = self.clone();
            hooks.push(Box::pin(async move {
                supervisor.stop_engine(&handle, Signal::SIGTERM).await;
            }));
        }
        let receiver = lock(&self.inner.receiver).take();
        if let (Some(handle), Some(archive)) = (receiver, self.inner.archive.get().cloned()) {
            hooks.push(Box::pin(async move {
                archive.stop_receiver(&handle).await;
            }));
        }
        let backup = lock(&self.inner.backup_task).take();
        if let Some(task) = backup {
            hooks.push(Box::pin(async move {
                let _ = task.await;
            }));
        }

        let window = self.inner.config.stop_timeout + SHUTDOWN_SLACK;
        if tokio::time::timeout(window, join_all(hooks)).await.is_err() {
            warn!(?window, "shutdown hooks did not finish in time");
        }

        let post = lock(&self.inner.post_shutdown_hooks).take();
        join_all(post.unwrap_or_default()).await;
        info!("shutdown complete");
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
