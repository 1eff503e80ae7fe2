//! Daemon lifecycle: start, stop, restart and one-shot operations.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use histsync_core::config::HistSyncConfig;
use histsync_core::errors::{ConfigError, CoreError, SyncError};
use histsync_core::models::SyncResult;
use histsync_core::strategy::SyncStrategy;

use crate::daemon::{self, PidFile};
use crate::scheduler;
use crate::signals::ShutdownFlag;

/// Default time a stopping daemon gets to finish its cycle.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// How long a detached daemon gets to write its pid file.
pub const DEFAULT_STARTUP_WAIT: Duration = Duration::from_secs(5);

const STOP_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is already running (PID {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("daemon is not running")]
    NotRunning,

    #[error("daemon (PID {pid}) did not exit after SIGTERM")]
    StopTimedOut { pid: u32 },

    #[error("pid file error: {0}")]
    PidFile(#[from] std::io::Error),

    #[error("failed to signal daemon: {0}")]
    Signal(String),

    #[error("background daemon failed to start: {0}")]
    Spawn(String),

    /// Configuration or sync failure from the core library.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<SyncError> for DaemonError {
    fn from(err: SyncError) -> Self {
        Self::Core(err.into())
    }
}

impl From<ConfigError> for DaemonError {
    fn from(err: ConfigError) -> Self {
        Self::Core(err.into())
    }
}

/// Build the configured sync strategy.
pub fn build_strategy(config: &HistSyncConfig) -> Result<SyncStrategy, DaemonError> {
    Ok(SyncStrategy::from_config(config)?)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of this controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Restarting => write!(f, "restarting"),
        }
    }
}

/// What the daemon loop has done so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    pub pid_file_path: PathBuf,
    pub running: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Error of the most recent cycle; cleared by the next success.
    pub last_error: Option<String>,
    pub cycles: u64,
    pub failures: u64,
}

impl SyncState {
    pub fn new(pid_file_path: impl Into<PathBuf>) -> Self {
        Self {
            pid_file_path: pid_file_path.into(),
            running: false,
            last_sync_at: None,
            last_error: None,
            cycles: 0,
            failures: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct DaemonController {
    pid_file: PidFile,
    interval: Duration,
    state: DaemonState,
}

impl DaemonController {
    pub fn new(pid_file_path: impl AsRef<Path>, interval: Duration) -> Self {
        Self {
            pid_file: PidFile::new(pid_file_path),
            interval,
            state: DaemonState::Stopped,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    fn transition(&mut self, next: DaemonState) {
        info!(from = %self.state, to = %next, "daemon state change");
        self.state = next;
    }

    /// Pid of the running daemon, if there is one.
    pub fn status(&self) -> Result<Option<u32>, DaemonError> {
        Ok(self.pid_file.live_pid()?)
    }

    /// Run the daemon loop in this process until `shutdown` is raised.
    pub async fn start(
        &mut self,
        strategy: &mut SyncStrategy,
        shutdown: ShutdownFlag,
    ) -> Result<SyncState, DaemonError> {
        self.transition(DaemonState::Starting);
        let existing = match self.pid_file.live_pid() {
            Ok(existing) => existing,
            Err(e) => {
                self.transition(DaemonState::Stopped);
                return Err(e.into());
            }
        };
        if let Some(pid) = existing {
            self.transition(DaemonState::Stopped);
            return Err(DaemonError::AlreadyRunning { pid });
        }
        if let Err(e) = self.pid_file.write_current() {
            self.transition(DaemonState::Stopped);
            return Err(e.into());
        }

        strategy.attach_shutdown(shutdown.clone());
        let mut state = SyncState::new(self.pid_file.path());
        state.running = true;
        self.transition(DaemonState::Running);

        scheduler::run_sync_loop(strategy, self.interval, &shutdown, &mut state).await;

        self.transition(DaemonState::Stopping);
        state.running = false;
        let removed = self.pid_file.remove();
        self.transition(DaemonState::Stopped);
        removed?;

        info!(
            cycles = state.cycles,
            failures = state.failures,
            "daemon stopped"
        );
        Ok(state)
    }

    /// Spawn `command` (see [`daemon::detached_command`]) as the daemon and
    /// wait up to `startup_wait` for it to claim the pid file.
    ///
    /// Returns the running child; dropping it does not stop the daemon.
    pub async fn start_detached(
        &mut self,
        mut command: Command,
        startup_wait: Duration,
    ) -> Result<Child, DaemonError> {
        if let Some(pid) = self.pid_file.live_pid()? {
            return Err(DaemonError::AlreadyRunning { pid });
        }
        self.transition(DaemonState::Starting);
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.transition(DaemonState::Stopped);
                return Err(DaemonError::Spawn(e.to_string()));
            }
        };
        let pid = child.id();
        info!(pid, "spawned background daemon");

        let deadline = Instant::now() + startup_wait;
        loop {
            let exited = child
                .try_wait()
                .map_err(|e| DaemonError::Spawn(e.to_string()))?;
            if let Some(status) = exited {
                self.transition(DaemonState::Stopped);
                return Err(DaemonError::Spawn(format!("daemon (PID {pid}) exited with {status}")));
            }
            if self.pid_file.read()?.is_some_and(|record| record.pid == pid) {
                self.transition(DaemonState::Running);
                return Ok(child);
            }
            if Instant::now() >= deadline {
                self.transition(DaemonState::Stopped);
                return Err(DaemonError::Spawn(format!(
                    "daemon (PID {pid}) did not write {} within {}s",
                    self.pid_file.path().display(),
                    startup_wait.as_secs()
                )));
            }
            tokio::time::sleep(STOP_POLL).await;
        }
    }

    /// Ask the daemon named in the pid file to stop, waiting up to `grace`.
    /// Returns the pid that was stopped.
    pub async fn stop(&mut self, grace: Duration) -> Result<u32, DaemonError> {
        let Some(record) = self.pid_file.read()? else {
            if self.pid_file.exists() {
                self.pid_file.remove()?;
            }
            return Err(DaemonError::NotRunning);
        };
        let pid = record.pid;
        if !record.is_live() {
            warn!(pid, "pid file names a dead or reused pid, removing it");
            self.pid_file.remove()?;
            return Err(DaemonError::NotRunning);
        }

        let previous = self.state;
        self.transition(DaemonState::Stopping);
        let outcome = self.wait_for_exit(pid, grace).await;
        self.transition(if previous == DaemonState::Restarting {
            DaemonState::Restarting
        } else {
            DaemonState::Stopped
        });
        outcome
    }

    async fn wait_for_exit(&self, pid: u32, grace: Duration) -> Result<u32, DaemonError> {
        daemon::send_sigterm(pid).map_err(|e| DaemonError::Signal(e.to_string()))?;

        let deadline = Instant::now() + grace;
        loop {
            if !self.pid_file.exists() {
                info!(pid, "daemon stopped");
                return Ok(pid);
            }
            if !daemon::is_process_alive(pid) {
                warn!(pid, "daemon exited without removing its pid file");
                self.pid_file.remove()?;
                return Ok(pid);
            }
            if Instant::now() >= deadline {
                warn!(pid, grace_secs = grace.as_secs(), "daemon did not stop in time");
                return Err(DaemonError::StopTimedOut { pid });
            }
            tokio::time::sleep(STOP_POLL).await;
        }
    }

    /// Stop any running daemon, then start one in this process.
    pub async fn restart(
        &mut self,
        strategy: &mut SyncStrategy,
        grace: Duration,
        shutdown: ShutdownFlag,
    ) -> Result<SyncState, DaemonError> {
        self.stop_for_restart(grace).await?;
        self.start(strategy, shutdown).await
    }

    /// Stop any running daemon, then start a detached one.
    pub async fn restart_detached(
        &mut self,
        command: Command,
        grace: Duration,
        startup_wait: Duration,
    ) -> Result<Child, DaemonError> {
        self.stop_for_restart(grace).await?;
        self.start_detached(command, startup_wait).await
    }

    async fn stop_for_restart(&mut self, grace: Duration) -> Result<(), DaemonError> {
        self.transition(DaemonState::Restarting);
        match self.stop(grace).await {
            Ok(pid) => info!(pid, "previous daemon stopped"),
            Err(DaemonError::NotRunning) => info!("no daemon was running"),
            Err(e) => {
                self.transition(DaemonState::Stopped);
                return Err(e);
            }
        }
        Ok(())
    }

    /// One sync cycle outside the daemon loop. The pid file is not touched.
    pub async fn sync_once(&mut self, strategy: &mut SyncStrategy) -> Result<SyncResult, DaemonError> {
        Ok(strategy.sync().await?)
    }

    pub async fn clear_remote(&mut self, strategy: &mut SyncStrategy) -> Result<(), DaemonError> {
        Ok(strategy.clear_remote().await?)
    }
}
