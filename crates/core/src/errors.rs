//! Error types for the histsync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

/// A history line that could not be turned into a record.
///
/// Never surfaced to callers: the codec logs and drops the offending line.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("blank history line")]
    Blank,

    #[error("timestamped history line has no command: {0:?}")]
    EmptyCommand(String),
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors surfaced by a sync strategy to the daemon or one-shot caller.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network, authentication or missing-remote failure.
    #[error("transport error: {detail}")]
    Transport { detail: String },

    /// The remote lock could not be acquired within the configured window.
    #[error("timed out after {waited_secs}s waiting for lock '{resource}'")]
    LockTimeout { resource: String, waited_secs: u64 },

    /// The remote kept advancing concurrently beyond the retry budget.
    #[error("remote advanced concurrently; gave up after {attempts} attempts")]
    Conflict { attempts: u32 },

    /// Shutdown was requested before the cycle could finish.
    #[error("sync interrupted by shutdown request")]
    Interrupted,

    /// Local file-system failure while reading or writing history.
    #[error("history I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            detail: detail.into(),
        }
    }
}

impl From<TransportError> for SyncError {
    fn from(err: TransportError) -> Self {
        Self::transport(err.to_string())
    }
}

impl From<GitError> for SyncError {
    fn from(err: GitError) -> Self {
        match err {
            GitError::IoError(e) => Self::Io(e),
            other => Self::transport(other.to_string()),
        }
    }
}

impl From<LockError> for SyncError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout {
                resource,
                waited_secs,
            } => Self::LockTimeout {
                resource,
                waited_secs,
            },
            LockError::Interrupted { .. } => Self::Interrupted,
            LockError::Transport(e) => e.into(),
            LockError::Io(e) => Self::Io(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

/// Errors from the lock manager and its backends.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock stayed held by a live holder for the whole timeout.
    #[error("lock '{resource}' still held after {waited_secs}s")]
    Timeout { resource: String, waited_secs: u64 },

    /// Shutdown was requested while waiting; the lock was not taken.
    #[error("gave up waiting for lock '{resource}': shutdown requested")]
    Interrupted { resource: String },

    /// The remote backend could not be reached.
    #[error("lock backend transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local lock-file I/O.
    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// Push was rejected (e.g. non-fast-forward).
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// Errors from the remote shell transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The `ssh` binary could not be started.
    #[error("{0} binary not found")]
    BinaryNotFound(String),

    /// Connection or authentication failure (ssh exit status 255).
    #[error("cannot reach {target}: {stderr}")]
    Unreachable { target: String, stderr: String },

    /// The remote refused access to a path.
    #[error("permission denied on {target}: {stderr}")]
    PermissionDenied { target: String, stderr: String },

    /// A remote command exited with a non-zero status.
    #[error("remote command failed (exit {exit_code}): {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// Generic I/O wrapper.
    #[error("transport I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// CoreError implements `std::error::Error` via `thiserror`, so
// `anyhow::Error: From<CoreError>` comes from the blanket impl.
