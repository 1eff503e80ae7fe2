//! Advisory locks over a shared resource.
//!
//! A lock is a small JSON document created exclusively by its holder. The
//! [`LockManager`] implements acquisition (with stale-lock reclaim and
//! bounded backoff) and holder-checked release on top of any
//! [`LockBackend`]: a local directory or a remote shell.
//!
//! Backends publish a lock with its body already written (temp file, then a
//! hard link that fails if the lock exists). A body that still reads as
//! empty or unparsable is treated as held until its mtime is older than the
//! stale threshold.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::{LockError, TransportError};
use crate::models::{now_unix, shutdown_raised, ShutdownFlag};
use crate::transport::{quote_remote_path, RemoteShell};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Exit status the remote scripts use for "lock already exists" / "no lock".
const EXIT_LOCK_PRESENT: i32 = 3;
const EXIT_LOCK_ABSENT: i32 = 4;

/// On-disk representation of a held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub holder: String,
    pub acquired_at: i64,
}

/// Proof of a held lock, returned by [`LockManager::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource_id: String,
    pub acquired_at: i64,
    pub holder_token: String,
}

/// A lock document as found in storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLock {
    pub body: String,
    /// Last modification time of the lock, unix seconds.
    pub modified_at: i64,
}

/// Storage for lock documents.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Atomically create the lock with `contents` as its body. `Ok(false)`
    /// if it already exists. The lock must never be visible without its body.
    async fn try_create(&self, resource_id: &str, contents: &str) -> Result<bool, LockError>;

    /// Current lock, or `None` if there is no lock.
    async fn read(&self, resource_id: &str) -> Result<Option<StoredLock>, LockError>;

    async fn remove(&self, resource_id: &str) -> Result<(), LockError>;
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct LockManager<B> {
    backend: B,
    stale_after: Duration,
    shutdown: Option<ShutdownFlag>,
}

impl<B: LockBackend> LockManager<B> {
    /// Locks older than `stale_after` are considered abandoned and reclaimed.
    pub fn new(backend: B, stale_after: Duration) -> Self {
        Self {
            backend,
            stale_after,
            shutdown: None,
        }
    }

    /// Give up waiting (with [`LockError::Interrupted`]) once `flag` is raised.
    pub fn with_shutdown(mut self, flag: ShutdownFlag) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn set_shutdown(&mut self, flag: ShutdownFlag) {
        self.shutdown = Some(flag);
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Acquire `resource_id` for `holder_token`, waiting at most `timeout`
    /// for a live holder to let go.
    ///
    /// The shutdown flag is checked before every attempt, so a raised flag
    /// never leaves a fresh lock behind.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        resource_id: &str,
        holder_token: &str,
        timeout: Duration,
    ) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if shutdown_raised(self.shutdown.as_ref()) {
                info!("shutdown requested, no longer waiting for lock");
                return Err(LockError::Interrupted {
                    resource: resource_id.to_string(),
                });
            }

            if let Some(handle) = self.try_acquire(resource_id, holder_token).await? {
                return Ok(handle);
            }

            if let Some(stored) = self.backend.read(resource_id).await? {
                let reclaim = match serde_json::from_str::<LockRecord>(&stored.body) {
                    Ok(record) if self.record_is_stale(&record) => {
                        warn!(
                            holder = %record.holder,
                            acquired_at = record.acquired_at,
                            "reclaiming stale lock"
                        );
                        true
                    }
                    Ok(record) => {
                        debug!(holder = %record.holder, "lock held, waiting");
                        false
                    }
                    Err(e) if self.age_exceeds_stale(stored.modified_at) => {
                        warn!(
                            error = %e,
                            modified_at = stored.modified_at,
                            "reclaiming corrupt lock"
                        );
                        true
                    }
                    Err(e) => {
                        debug!(error = %e, "lock body unreadable but recent, waiting");
                        false
                    }
                };
                if reclaim {
                    self.backend.remove(resource_id).await?;
                    if let Some(handle) = self.try_acquire(resource_id, holder_token).await? {
                        return Ok(handle);
                    }
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(waited_ms = elapsed.as_millis() as u64, "gave up waiting for lock");
                return Err(LockError::Timeout {
                    resource: resource_id.to_string(),
                    waited_secs: elapsed.as_secs(),
                });
            }
            tokio::time::sleep(backoff.min(timeout - elapsed)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Release a lock. Returns `false` (and leaves the lock alone) when the
    /// lock is gone or now belongs to someone else.
    #[instrument(skip(self, handle), fields(resource = %handle.resource_id))]
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let Some(stored) = self.backend.read(&handle.resource_id).await? else {
            warn!("lock already released");
            return Ok(false);
        };
        match serde_json::from_str::<LockRecord>(&stored.body) {
            Ok(record) if record.holder == handle.holder_token => {
                self.backend.remove(&handle.resource_id).await?;
                info!(holder = %handle.holder_token, "lock released");
                Ok(true)
            }
            Ok(record) => {
                warn!(
                    holder = %record.holder,
                    ours = %handle.holder_token,
                    "lock taken over by another holder, not releasing"
                );
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "lock contents unreadable, not releasing");
                Ok(false)
            }
        }
    }

    /// Whether `handle` has been held longer than `threshold`.
    pub fn is_stale(&self, handle: &LockHandle, threshold: Duration) -> bool {
        now_unix() - handle.acquired_at > threshold.as_secs() as i64
    }

    fn record_is_stale(&self, record: &LockRecord) -> bool {
        self.age_exceeds_stale(record.acquired_at)
    }

    fn age_exceeds_stale(&self, since: i64) -> bool {
        now_unix() - since > self.stale_after.as_secs() as i64
    }

    async fn try_acquire(
        &self,
        resource_id: &str,
        holder_token: &str,
    ) -> Result<Option<LockHandle>, LockError> {
        let record = LockRecord {
            holder: holder_token.to_string(),
            acquired_at: now_unix(),
        };
        let contents = serde_json::to_string(&record).map_err(std::io::Error::from)?;
        if !self.backend.try_create(resource_id, &contents).await? {
            return Ok(None);
        }
        info!(resource = resource_id, holder = holder_token, "lock acquired");
        Ok(Some(LockHandle {
            resource_id: resource_id.to_string(),
            acquired_at: record.acquired_at,
            holder_token: record.holder,
        }))
    }
}

// ---------------------------------------------------------------------------
// Local directory backend
// ---------------------------------------------------------------------------

/// Lock files in a local directory; `resource_id` is the file name.
#[derive(Debug, Clone)]
pub struct DirLockBackend {
    dir: PathBuf,
}

impl DirLockBackend {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn lock_path(&self, resource_id: &str) -> PathBuf {
        self.dir.join(resource_id)
    }
}

/// Write `contents` to a temp file next to `lock_path`, then link it into
/// place. Linking fails if the lock exists, so the lock appears fully written.
fn publish_lock_file(dir: &Path, lock_path: &Path, contents: &str) -> std::io::Result<bool> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.as_file().sync_all()?;
    match tmp.persist_noclobber(lock_path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

#[async_trait]
impl LockBackend for DirLockBackend {
    async fn try_create(&self, resource_id: &str, contents: &str) -> Result<bool, LockError> {
        let dir = self.dir.clone();
        let lock_path = self.lock_path(resource_id);
        let contents = contents.to_string();
        let created =
            tokio::task::spawn_blocking(move || publish_lock_file(&dir, &lock_path, &contents))
                .await
                .map_err(|e| std::io::Error::other(format!("lock publish task panicked: {e}")))??;
        Ok(created)
    }

    async fn read(&self, resource_id: &str) -> Result<Option<StoredLock>, LockError> {
        let path = self.lock_path(resource_id);
        let body = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let modified = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(StoredLock {
            body,
            modified_at: chrono::DateTime::<chrono::Utc>::from(modified).timestamp(),
        }))
    }

    async fn remove(&self, resource_id: &str) -> Result<(), LockError> {
        match tokio::fs::remove_file(self.lock_path(resource_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Remote shell backend
// ---------------------------------------------------------------------------

/// Lock files on a remote host; `resource_id` is the remote path.
///
/// Creation writes a temp file and hard-links it to the lock path; `ln`
/// refuses to replace an existing lock.
#[derive(Debug, Clone)]
pub struct ShellLockBackend<S> {
    shell: S,
}

impl<S: RemoteShell> ShellLockBackend<S> {
    pub fn new(shell: S) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &S {
        &self.shell
    }
}

#[async_trait]
impl<S: RemoteShell> LockBackend for ShellLockBackend<S> {
    async fn try_create(&self, resource_id: &str, contents: &str) -> Result<bool, LockError> {
        let path = quote_remote_path(resource_id);
        let tmp = format!("{path}.$$.tmp");
        let script = format!(
            "mkdir -p \"$(dirname -- {path})\" || exit 1\n\
             cat > {tmp} || {{ rm -f {tmp}; exit 1; }}\n\
             if ln {tmp} {path} 2>/dev/null; then rm -f {tmp}; exit 0; fi\n\
             rm -f {tmp}\n\
             [ -e {path} ] && exit {EXIT_LOCK_PRESENT}\n\
             exit 1"
        );
        let output = self.shell.run(&script, Some(contents.as_bytes())).await?;
        match output.exit_code {
            0 => Ok(true),
            EXIT_LOCK_PRESENT => Ok(false),
            exit_code => Err(TransportError::CommandFailed {
                exit_code,
                stderr: output.stderr,
            }
            .into()),
        }
    }

    async fn read(&self, resource_id: &str) -> Result<Option<StoredLock>, LockError> {
        let path = quote_remote_path(resource_id);
        // First line: mtime (GNU stat, then BSD stat). Rest: the body.
        let script = format!(
            "m=$(stat -c %Y {path} 2>/dev/null || stat -f %m {path} 2>/dev/null) || exit {EXIT_LOCK_ABSENT}\n\
             echo \"$m\"\n\
             cat {path} 2>/dev/null || exit {EXIT_LOCK_ABSENT}"
        );
        let output = self.shell.run(&script, None).await?;
        match output.exit_code {
            0 => Ok(Some(parse_stored_lock(&output.stdout))),
            EXIT_LOCK_ABSENT => Ok(None),
            exit_code => Err(TransportError::CommandFailed {
                exit_code,
                stderr: output.stderr,
            }
            .into()),
        }
    }

    async fn remove(&self, resource_id: &str) -> Result<(), LockError> {
        let script = format!("rm -f {}", quote_remote_path(resource_id));
        self.shell.run_checked(&script, None).await?;
        Ok(())
    }
}

/// Split the read script's output into mtime and body. An mtime that
/// does not parse counts as "just now", which keeps the lock held.
fn parse_stored_lock(stdout: &[u8]) -> StoredLock {
    let text = String::from_utf8_lossy(stdout);
    let (first, body) = text.split_once('\n').unwrap_or((text.as_ref(), ""));
    StoredLock {
        body: body.to_string(),
        modified_at: first.trim().parse().unwrap_or_else(|_| now_unix()),
    }
}
