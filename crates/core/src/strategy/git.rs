//! History shared through a git repository.

use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::write_back_local;
use crate::config::{GitConfig, HistSyncConfig};
use crate::errors::{ConfigError, GitError, SyncError};
use crate::git::GitClient;
use crate::history::{self, HistorySet, TextEncoding};
use crate::models::{hostname, shutdown_raised, ShutdownFlag, SyncResult};

const CLEAR_MESSAGE: &str = "histsync: clear remote history";

/// Commits the merged history to a working copy and pushes it.
///
/// Concurrent pushes from other machines are handled by fetching, resetting
/// to the new remote head and merging again, up to `max_push_attempts`.
///
/// git2 blocks, so each cycle runs on the blocking pool with its own clone
/// of the strategy.
#[derive(Clone)]
pub struct GitStrategy {
    repo_path: PathBuf,
    /// History file path relative to the working tree.
    history_file: PathBuf,
    local_history: PathBuf,
    encodings: Vec<TextEncoding>,
    git: GitConfig,
    hostname: String,
    shutdown: Option<ShutdownFlag>,
    /// Runs after each attempt's merge, right before publishing.
    #[cfg(test)]
    before_publish: Option<Arc<dyn Fn(u32) + Send + Sync>>,
}

/// Outcome of one commit+push attempt.
enum Attempt {
    /// Published; whether the remote moved.
    Done(bool),
    Rejected(String),
}

impl GitStrategy {
    pub fn from_config(config: &HistSyncConfig) -> Result<Self, ConfigError> {
        let repo_path = config.paths.git_repo.clone();
        let remote = &config.paths.remote_history;
        let history_file = if remote.is_relative() {
            remote.clone()
        } else {
            remote
                .strip_prefix(&repo_path)
                .map(Path::to_path_buf)
                .map_err(|_| ConfigError::InvalidValue {
                    field: "paths.remote_history".into(),
                    detail: format!(
                        "{} is not inside git_repo {}",
                        remote.display(),
                        repo_path.display()
                    ),
                })?
        };

        Ok(Self {
            repo_path,
            history_file,
            local_history: config.paths.local_history.clone(),
            encodings: config.settings.encodings.clone(),
            git: config.git.clone(),
            hostname: hostname(),
            shutdown: None,
            #[cfg(test)]
            before_publish: None,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Stop retrying once `flag` is raised.
    pub fn set_shutdown(&mut self, flag: ShutdownFlag) {
        self.shutdown = Some(flag);
    }

    fn check_shutdown(&self, attempt: u32) -> Result<(), SyncError> {
        if shutdown_raised(self.shutdown.as_ref()) {
            info!(attempt, "shutdown requested, abandoning git sync");
            return Err(SyncError::Interrupted);
        }
        Ok(())
    }

    fn run_before_publish(&self, attempt: u32) {
        #[cfg(test)]
        {
            if let Some(hook) = &self.before_publish {
                hook(attempt);
            }
        }
        #[cfg(not(test))]
        {
            let _ = attempt;
        }
    }

    fn open(&self) -> Result<GitClient, GitError> {
        let url = self.git.repository_url.as_deref();
        let client = GitClient::open_or_create(&self.repo_path, url, &self.git.remote_name)?;
        if let Some(url) = url {
            client.ensure_remote(&self.git.remote_name, url)?;
        }
        Ok(client)
    }

    fn has_remote(&self) -> bool {
        self.git.repository_url.is_some()
    }

    /// Fetch and reset the branch to the remote head. Returns the remote
    /// head's sha, if the remote branch exists.
    fn refresh(&self, client: &GitClient) -> Result<Option<String>, GitError> {
        if self.has_remote() {
            client.fetch(&self.git.remote_name)?;
        }
        let base = client.reset_to_remote(&self.git.remote_name, &self.git.branch)?;
        Ok(base.map(|oid| oid.to_string()))
    }

    /// Write `history` into the working copy, commit it if it changed and
    /// push whatever the remote is missing. Returns whether the remote moved.
    fn publish(
        &self,
        client: &GitClient,
        base: Option<String>,
        history: &HistorySet,
        message: &str,
    ) -> Result<Attempt, GitError> {
        history::write_history_file(&client.repo_path().join(&self.history_file), history)?;
        let committed = client.commit_file(
            &self.history_file,
            message,
            &self.git.author_name,
            &self.git.author_email,
        )?;

        if !self.has_remote() {
            return Ok(Attempt::Done(committed.is_some()));
        }

        // A previous cycle may have committed without managing to push.
        let head = client.head_sha()?;
        if head.is_none() || head == base {
            debug!("remote already up to date");
            return Ok(Attempt::Done(false));
        }

        match client.push(&self.git.remote_name, &self.git.branch) {
            Ok(()) => Ok(Attempt::Done(true)),
            Err(GitError::PushRejected { detail, .. }) => Ok(Attempt::Rejected(detail)),
            Err(e) => Err(e),
        }
    }

    pub async fn sync(&mut self) -> Result<SyncResult, SyncError> {
        let strategy = self.clone();
        tokio::task::spawn_blocking(move || strategy.sync_blocking())
            .await
            .map_err(|e| blocking_task_failed("git sync", e))?
    }

    pub async fn clear_remote(&mut self) -> Result<(), SyncError> {
        let strategy = self.clone();
        tokio::task::spawn_blocking(move || strategy.clear_remote_blocking())
            .await
            .map_err(|e| blocking_task_failed("git clear", e))?
    }

    fn sync_blocking(&self) -> Result<SyncResult, SyncError> {
        let client = self.open()?;
        let remote_file = self.repo_path.join(&self.history_file);
        let message = format!("histsync: merge history from {}", self.hostname);
        let mut rejections = 0u64;

        for attempt in 1..=self.git.max_push_attempts {
            self.check_shutdown(attempt)?;
            let base = self.refresh(&client)?;
            let remote_history = history::read_history_file(&remote_file, &self.encodings)?;
            let local_history = history::read_history_file(&self.local_history, &self.encodings)?;
            let (merged, stats) = history::merge_report(&local_history, &remote_history);

            self.run_before_publish(attempt);
            match self.publish(&client, base, &merged, &message)? {
                Attempt::Done(remote_changed) => {
                    let added_locally =
                        write_back_local(&self.local_history, &self.encodings, &merged)?;
                    return Ok(SyncResult {
                        merged_count: merged.len(),
                        conflicts_resolved: stats.conflicts_resolved + rejections,
                        added_locally,
                        added_remotely: stats.only_local,
                        remote_changed,
                    });
                }
                Attempt::Rejected(detail) => {
                    rejections += 1;
                    warn!(attempt, %detail, "push rejected, merging again");
                }
            }
        }

        Err(SyncError::Conflict {
            attempts: self.git.max_push_attempts,
        })
    }

    fn clear_remote_blocking(&self) -> Result<(), SyncError> {
        let client = self.open()?;
        for attempt in 1..=self.git.max_push_attempts {
            self.check_shutdown(attempt)?;
            let base = self.refresh(&client)?;
            match self.publish(&client, base, &HistorySet::new(), CLEAR_MESSAGE)? {
                Attempt::Done(_) => {
                    info!(repo = %self.repo_path.display(), "remote history cleared");
                    return Ok(());
                }
                Attempt::Rejected(detail) => {
                    warn!(attempt, %detail, "push rejected while clearing, retrying");
                }
            }
        }
        Err(SyncError::Conflict {
            attempts: self.git.max_push_attempts,
        })
    }
}

fn blocking_task_failed(what: &str, err: tokio::task::JoinError) -> SyncError {
    SyncError::Io(std::io::Error::other(format!("{what} task panicked: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use super::*;

    fn local_only_config(dir: &Path) -> HistSyncConfig {
        let mut config = HistSyncConfig::default();
        config.paths.local_history = dir.join("zsh_history");
        config.paths.git_repo = dir.join("repo");
        config.paths.remote_history = dir.join("repo").join("history.txt");
        config
    }

    #[test]
    fn test_history_file_must_live_in_repo() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = local_only_config(dir.path());
        assert_eq!(
            GitStrategy::from_config(&config).unwrap().history_file,
            PathBuf::from("history.txt")
        );

        config.paths.remote_history = dir.path().join("elsewhere.txt");
        assert!(GitStrategy::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_local_only_repository_commits_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_only_config(dir.path());
        std::fs::write(&config.paths.local_history, ": 1:0;ls\n: 2:0;pwd\n").unwrap();

        let mut strategy = GitStrategy::from_config(&config).unwrap();
        let result = strategy.sync().await.unwrap();
        assert_eq!(result.merged_count, 2);
        assert_eq!(result.added_remotely, 2);
        assert!(result.remote_changed);

        let committed = std::fs::read_to_string(dir.path().join("repo/history.txt")).unwrap();
        assert_eq!(committed, ": 1:0;ls\n: 2:0;pwd\n");

        // Nothing new: no second commit.
        let head = GitClient::new(dir.path().join("repo")).unwrap().head_sha().unwrap();
        let again = strategy.sync().await.unwrap();
        assert!(!again.remote_changed);
        let head_after = GitClient::new(dir.path().join("repo")).unwrap().head_sha().unwrap();
        assert_eq!(head, head_after);
    }

    fn machine_config(root: &Path, name: &str, remote_url: &str) -> HistSyncConfig {
        let home = root.join(name);
        std::fs::create_dir_all(&home).unwrap();
        let mut config = HistSyncConfig::default();
        config.paths.local_history = home.join(".zsh_history");
        config.paths.git_repo = home.join("history_repo");
        config.paths.remote_history = home.join("history_repo").join("history.txt");
        config.git.repository_url = Some(remote_url.to_string());
        config
    }

    fn remote_history(bare: &Path) -> String {
        let repo = git2::Repository::open_bare(bare).unwrap();
        let commit = repo
            .find_reference("refs/heads/main")
            .unwrap()
            .peel_to_commit()
            .unwrap();
        let entry = commit
            .tree()
            .unwrap()
            .get_path(Path::new("history.txt"))
            .unwrap();
        let blob = repo.find_blob(entry.id()).unwrap();
        String::from_utf8(blob.content().to_vec()).unwrap()
    }

    #[test]
    fn test_push_race_recovered_by_merging_again() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("remote.git");
        git2::Repository::init_bare(&bare).unwrap();
        let url = bare.to_str().unwrap();

        let laptop_config = machine_config(dir.path(), "laptop", url);
        std::fs::write(&laptop_config.paths.local_history, ": 100:0;a\n").unwrap();
        let laptop = GitStrategy::from_config(&laptop_config).unwrap();
        laptop.sync_blocking().unwrap();

        let desktop_config = machine_config(dir.path(), "desktop", url);
        std::fs::write(&desktop_config.paths.local_history, ": 200:0;b\n").unwrap();
        let mut desktop = GitStrategy::from_config(&desktop_config).unwrap();

        // The laptop pushes between the desktop's fetch and its push.
        let laptop_history = laptop_config.paths.local_history.clone();
        desktop.before_publish = Some(Arc::new(move |attempt| {
            if attempt == 1 {
                let mut text = std::fs::read_to_string(&laptop_history).unwrap();
                text.push_str(": 300:0;c\n");
                std::fs::write(&laptop_history, text).unwrap();
                laptop.sync_blocking().unwrap();
            }
        }));

        let result = desktop.sync_blocking().unwrap();
        assert!(result.remote_changed);
        assert!(result.conflicts_resolved >= 1);
        assert_eq!(result.merged_count, 3);

        let expected = ": 100:0;a\n: 200:0;b\n: 300:0;c\n";
        assert_eq!(remote_history(&bare), expected);
        assert_eq!(
            std::fs::read_to_string(&desktop_config.paths.local_history).unwrap(),
            expected
        );
    }

    #[tokio::test]
    async fn test_raised_shutdown_stops_before_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let config = local_only_config(dir.path());
        std::fs::write(&config.paths.local_history, ": 1:0;ls\n").unwrap();

        let mut strategy = GitStrategy::from_config(&config).unwrap();
        strategy.set_shutdown(Arc::new(AtomicBool::new(true)));
        let err = strategy.sync().await.unwrap_err();
        assert!(matches!(err, SyncError::Interrupted));
        assert!(!dir.path().join("repo/history.txt").exists());
    }
}
