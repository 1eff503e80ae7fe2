//! Pid file and process helpers for the sync daemon.
//!
//! Supports both foreground (interactive) and background (detached) modes.
//! A background daemon is this binary re-run as `daemon start` in a new
//! session, with stdio pointed at the log file.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{info, warn};

/// A process that started this long after its pid file was written is not
/// the process that wrote it.
const PID_REUSE_SLACK_SECS: i64 = 5;

/// Contents of a pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    /// Unix seconds; absent for pid files holding only a pid.
    pub started_at: Option<i64>,
}

impl PidRecord {
    /// Parse `"<pid> <started_at>"` or a bare `"<pid>"`.
    pub fn parse(contents: &str) -> Option<Self> {
        let mut fields = contents.split_whitespace();
        let pid = fields.next()?.parse().ok()?;
        let started_at = match fields.next() {
            Some(field) => Some(field.parse().ok()?),
            None => None,
        };
        if fields.next().is_some() {
            return None;
        }
        Some(Self { pid, started_at })
    }

    /// Whether the recorded process is still the one running under `pid`.
    ///
    /// A live pid whose process started after the record was written has
    /// been reused by something else.
    pub fn is_live(&self) -> bool {
        if !is_process_alive(self.pid) {
            return false;
        }
        match (self.started_at, process_started_at(self.pid)) {
            (Some(written), Some(started)) if started > written + PID_REUSE_SLACK_SECS => {
                warn!(
                    pid = self.pid,
                    written,
                    started,
                    "pid has been reused by a newer process"
                );
                false
            }
            _ => true,
        }
    }
}

/// The daemon's pid file. Its presence means "a daemon claims to run".
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the pid file. A missing or unparsable file reads as `None`.
    pub fn read(&self) -> io::Result<Option<PidRecord>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record = PidRecord::parse(&contents);
        if record.is_none() {
            warn!(path = %self.path.display(), "pid file contains invalid data");
        }
        Ok(record)
    }

    /// Record this process as the running daemon.
    pub fn write_current(&self) -> io::Result<PidRecord> {
        let record = PidRecord {
            pid: std::process::id(),
            started_at: Some(chrono::Utc::now().timestamp()),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let started_at = record.started_at.unwrap_or_default();
        fs::write(&self.path, format!("{} {}\n", record.pid, started_at))?;
        info!(pid = record.pid, path = %self.path.display(), "wrote pid file");
        Ok(record)
    }

    /// Remove the pid file. Returns whether there was one.
    pub fn remove(&self) -> io::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "removed pid file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Pid of the live daemon, if any. A pid file naming a dead or reused
    /// pid (or holding garbage) is removed.
    pub fn live_pid(&self) -> io::Result<Option<u32>> {
        match self.read()? {
            Some(record) if record.is_live() => Ok(Some(record.pid)),
            Some(record) => {
                warn!(pid = record.pid, "removing stale pid file");
                self.remove()?;
                Ok(None)
            }
            None if self.exists() => {
                warn!(path = %self.path.display(), "removing unreadable pid file");
                self.remove()?;
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Check whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // pid 0 and negative pids address process groups, not a process.
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        if pid <= 0 {
            return false;
        }
        // Signal 0 doesn't send a signal, just checks if process exists
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Unix time at which `pid` started, where the OS exposes it.
#[cfg(target_os = "linux")]
pub fn process_started_at(pid: u32) -> Option<i64> {
    // Field 22 of /proc/<pid>/stat is the start time in clock ticks since
    // boot. The command name (field 2) may contain spaces, so count fields
    // from the closing paren.
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let start_ticks: i64 = after_comm.split_whitespace().nth(19)?.parse().ok()?;

    let boot_time: i64 = fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    // SAFETY: sysconf only reads a system constant.
    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    Some(boot_time + start_ticks / i64::from(ticks_per_sec))
}

#[cfg(not(target_os = "linux"))]
pub fn process_started_at(pid: u32) -> Option<i64> {
    let _ = pid;
    None
}

/// Arguments that re-run this binary as a foreground daemon.
pub fn foreground_args(config_path: &Path, log_level: Option<&str>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["--config".into(), config_path.as_os_str().to_owned()];
    if let Some(level) = log_level {
        args.push("--log-level".into());
        args.push(level.into());
    }
    args.extend(["daemon".into(), "start".into(), "--detached-child".into()]);
    args
}

/// Build the command for a detached daemon: no stdin, stdout and stderr
/// appended to `log_file`, and (on unix) a new session so the daemon
/// outlives the terminal that started it.
pub fn detached_command<I, A>(program: &Path, args: I, log_file: &Path) -> io::Result<Command>
where
    I: IntoIterator<Item = A>,
    A: Into<OsString>,
{
    if let Some(parent) = log_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let out = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;
    let err = out.try_clone()?;

    let mut command = Command::new(program);
    command
        .args(args.into_iter().map(Into::into))
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid is async-signal-safe and touches no parent state.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    Ok(command)
}

/// Ask a process to shut down with SIGTERM.
///
/// A process that is already gone is not an error.
pub fn send_sigterm(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        let target = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        info!(pid, "sending SIGTERM to daemon");
        if unsafe { libc::kill(target, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        Err(err)
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signals are only supported on unix",
        ))
    }
}
