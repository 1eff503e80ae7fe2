//! History shared as a plain file on a host reachable over SSH.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::write_back_local;
use crate::config::HistSyncConfig;
use crate::errors::{ConfigError, SyncError, TransportError};
use crate::history::{self, codec, HistorySet, TextEncoding};
use crate::lock::{LockHandle, LockManager, ShellLockBackend};
use crate::models::{holder_token, ShutdownFlag, SyncResult};
use crate::transport::{quote_remote_path, RemoteShell, SshClient};

/// Exit status of the read script when the remote file does not exist.
const EXIT_NO_FILE: i32 = 4;

/// Reads, merges and rewrites a remote history file while holding a lock
/// file next to it on the same host.
pub struct SshStrategy<S = SshClient> {
    locks: LockManager<ShellLockBackend<S>>,
    remote_path: String,
    lock_file: String,
    lock_timeout: Duration,
    local_history: PathBuf,
    encodings: Vec<TextEncoding>,
    holder: String,
}

impl SshStrategy<SshClient> {
    pub fn from_config(config: &HistSyncConfig) -> Result<Self, ConfigError> {
        let ssh = ssh_section(config)?;
        Self::with_shell(SshClient::from_config(ssh), config)
    }
}

fn ssh_section(config: &HistSyncConfig) -> Result<&crate::config::SshConfig, ConfigError> {
    config.ssh.as_ref().ok_or_else(|| ConfigError::InvalidValue {
        field: "ssh".into(),
        detail: "sync_type = \"ssh\" requires an [ssh] section".into(),
    })
}

impl<S: RemoteShell> SshStrategy<S> {
    /// Build the strategy over any remote shell.
    pub fn with_shell(shell: S, config: &HistSyncConfig) -> Result<Self, ConfigError> {
        let ssh = ssh_section(config)?;
        Ok(Self {
            locks: LockManager::new(ShellLockBackend::new(shell), config.lock_stale_after()),
            remote_path: ssh.remote_path.clone(),
            lock_file: ssh.lock_file.clone(),
            lock_timeout: Duration::from_secs(ssh.lock_timeout_secs),
            local_history: config.paths.local_history.clone(),
            encodings: config.settings.encodings.clone(),
            holder: holder_token(),
        })
    }

    fn shell(&self) -> &S {
        self.locks.backend().shell()
    }

    /// Stop waiting for the remote lock once `flag` is raised.
    pub fn set_shutdown(&mut self, flag: ShutdownFlag) {
        self.locks.set_shutdown(flag);
    }

    async fn lock(&self) -> Result<LockHandle, SyncError> {
        Ok(self
            .locks
            .acquire(&self.lock_file, &self.holder, self.lock_timeout)
            .await?)
    }

    async fn unlock(&self, handle: &LockHandle) {
        match self.locks.release(handle).await {
            Ok(true) => {}
            Ok(false) => warn!(lock = %self.lock_file, "remote lock was no longer ours"),
            Err(e) => warn!(lock = %self.lock_file, error = %e, "failed to release remote lock"),
        }
    }

    #[instrument(skip(self), fields(target = %self.shell().target()))]
    pub async fn sync(&mut self) -> Result<SyncResult, SyncError> {
        let handle = self.lock().await?;
        let result = self.sync_locked().await;
        self.unlock(&handle).await;
        result
    }

    pub async fn clear_remote(&mut self) -> Result<(), SyncError> {
        let handle = self.lock().await?;
        let result = self.write_remote(&HistorySet::new()).await;
        self.unlock(&handle).await;
        result
    }

    async fn sync_locked(&self) -> Result<SyncResult, SyncError> {
        let remote = self.read_remote().await?;
        let local = history::read_history_file(&self.local_history, &self.encodings)?;
        let (merged, stats) = history::merge_report(&local, &remote);

        let remote_changed = merged != remote;
        if remote_changed {
            self.write_remote(&merged).await?;
        } else {
            debug!("remote history already up to date");
        }

        let added_locally = write_back_local(&self.local_history, &self.encodings, &merged)?;
        Ok(SyncResult {
            merged_count: merged.len(),
            conflicts_resolved: stats.conflicts_resolved,
            added_locally,
            added_remotely: stats.only_local,
            remote_changed,
        })
    }

    async fn read_remote(&self) -> Result<HistorySet, SyncError> {
        let path = quote_remote_path(&self.remote_path);
        let script = format!("[ -e {path} ] || exit {EXIT_NO_FILE}\ncat {path}");
        let output = self.shell().run(&script, None).await?;
        match output.exit_code {
            0 => Ok(history::parse(&codec::decode(&output.stdout, &self.encodings))),
            EXIT_NO_FILE => {
                debug!(path = %self.remote_path, "remote history does not exist yet");
                Ok(HistorySet::new())
            }
            exit_code => Err(TransportError::CommandFailed {
                exit_code,
                stderr: output.stderr,
            }
            .into()),
        }
    }

    /// Replace the remote file via a temp file and `mv`.
    async fn write_remote(&self, history: &HistorySet) -> Result<(), SyncError> {
        let path = quote_remote_path(&self.remote_path);
        let tmp = quote_remote_path(&format!("{}.histsync.tmp", self.remote_path));
        let script = format!("mkdir -p \"$(dirname -- {path})\" && cat > {tmp} && mv -f {tmp} {path}");
        let text = history::serialize(history);
        self.shell().run_checked(&script, Some(text.as_bytes())).await?;
        debug!(path = %self.remote_path, records = history.len(), "remote history written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::config::{SshConfig, SyncType};
    use crate::lock::LockRecord;
    use crate::models::now_unix;
    use crate::transport::local::{LocalShell, UnreachableShell};

    fn config(dir: &Path) -> HistSyncConfig {
        let mut config = HistSyncConfig::default();
        config.settings.sync_type = SyncType::Ssh;
        config.paths.local_history = dir.join("local_history");
        config.ssh = Some(SshConfig {
            host: "localhost".into(),
            port: 22,
            username: "me".into(),
            remote_path: dir.join("remote").join("shared").to_str().unwrap().into(),
            lock_file: dir.join("remote").join("shared.lock").to_str().unwrap().into(),
            lock_timeout_secs: 1,
            lock_stale_secs: None,
            connect_timeout_secs: 5,
            command_timeout_secs: 60,
            identity_file: None,
        });
        config
    }

    fn remote_file(dir: &Path) -> PathBuf {
        dir.join("remote").join("shared")
    }

    fn lock_file(dir: &Path) -> PathBuf {
        dir.join("remote").join("shared.lock")
    }

    #[tokio::test]
    async fn test_sync_merges_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.paths.local_history, ": 100:0;ls\n: 200:0;cd /\n").unwrap();
        std::fs::create_dir_all(dir.path().join("remote")).unwrap();
        std::fs::write(remote_file(dir.path()), ": 50:0;ls\n: 300:0;pwd\n").unwrap();

        let mut strategy = SshStrategy::with_shell(LocalShell, &config).unwrap();
        let result = strategy.sync().await.unwrap();

        let expected = ": 50:0;ls\n: 200:0;cd /\n: 300:0;pwd\n";
        assert_eq!(std::fs::read_to_string(remote_file(dir.path())).unwrap(), expected);
        assert_eq!(
            std::fs::read_to_string(&config.paths.local_history).unwrap(),
            expected
        );
        assert_eq!(result.merged_count, 3);
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(result.added_remotely, 1);
        assert_eq!(result.added_locally, 1);
        assert!(result.remote_changed);

        assert!(!lock_file(dir.path()).exists());
        assert!(!dir.path().join("remote").join("shared.histsync.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_remote_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.paths.local_history, "legacy\n: 1:0;ls\n").unwrap();

        let mut strategy = SshStrategy::with_shell(LocalShell, &config).unwrap();
        let result = strategy.sync().await.unwrap();
        assert_eq!(result.added_remotely, 2);
        assert_eq!(
            std::fs::read_to_string(remote_file(dir.path())).unwrap(),
            "legacy\n: 1:0;ls\n"
        );

        let again = strategy.sync().await.unwrap();
        assert!(!again.remote_changed);
    }

    #[tokio::test]
    async fn test_held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(dir.path().join("remote")).unwrap();
        let other = LockRecord {
            holder: "4242@elsewhere".into(),
            acquired_at: now_unix(),
        };
        std::fs::write(lock_file(dir.path()), serde_json::to_string(&other).unwrap()).unwrap();

        let mut strategy = SshStrategy::with_shell(LocalShell, &config).unwrap();
        let err = strategy.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::LockTimeout { .. }));
        // The other holder's lock is untouched.
        assert!(lock_file(dir.path()).exists());
        assert!(!remote_file(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_shutdown_cuts_lock_wait_short() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        if let Some(ssh) = config.ssh.as_mut() {
            ssh.lock_timeout_secs = 30;
        }
        std::fs::create_dir_all(dir.path().join("remote")).unwrap();
        let other = LockRecord {
            holder: "4242@elsewhere".into(),
            acquired_at: now_unix(),
        };
        std::fs::write(lock_file(dir.path()), serde_json::to_string(&other).unwrap()).unwrap();

        let flag: ShutdownFlag = Arc::new(AtomicBool::new(false));
        let mut strategy = SshStrategy::with_shell(LocalShell, &config).unwrap();
        strategy.set_shutdown(flag.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let started = std::time::Instant::now();
        let err = strategy.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(5));
        let raw = std::fs::read_to_string(lock_file(dir.path())).unwrap();
        assert!(raw.contains("4242@elsewhere"));
        assert!(!remote_file(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_lock_released_when_cycle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        // A directory where the local history file should be makes the
        // local read fail after the lock is taken.
        std::fs::create_dir_all(&config.paths.local_history).unwrap();

        let mut strategy = SshStrategy::with_shell(LocalShell, &config).unwrap();
        let err = strategy.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
        assert!(!lock_file(dir.path()).exists());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut strategy = SshStrategy::with_shell(UnreachableShell, &config(dir.path())).unwrap();
        let err = strategy.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_clear_remote_truncates_under_lock() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(dir.path().join("remote")).unwrap();
        std::fs::write(remote_file(dir.path()), ": 1:0;ls\n").unwrap();
        std::fs::write(&config.paths.local_history, ": 1:0;ls\n").unwrap();

        let mut strategy = SshStrategy::with_shell(LocalShell, &config).unwrap();
        strategy.clear_remote().await.unwrap();
        assert_eq!(std::fs::read_to_string(remote_file(dir.path())).unwrap(), "");
        assert_eq!(
            std::fs::read_to_string(&config.paths.local_history).unwrap(),
            ": 1:0;ls\n"
        );
        assert!(!lock_file(dir.path()).exists());
    }
}
