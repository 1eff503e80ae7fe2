//! Sync strategies: how a history reaches the other machines.
//!
//! Every strategy runs the same cycle: read the remote copy, merge it with
//! the local history file, publish the merged set, then fold the merged set
//! back into a fresh read of the local file.

pub mod git;
pub mod memory;
pub mod ssh;

use std::path::Path;

use tracing::{debug, info, instrument};

use crate::config::{HistSyncConfig, SyncType};
use crate::errors::{ConfigError, SyncError};
use crate::history::{self, HistorySet, TextEncoding};
use crate::models::{ShutdownFlag, SyncResult};

pub use git::GitStrategy;
pub use memory::MemoryStrategy;
pub use ssh::SshStrategy;

/// The configured transport, chosen once at startup.
pub enum SyncStrategy {
    Git(GitStrategy),
    Ssh(SshStrategy),
    Memory(MemoryStrategy),
}

impl SyncStrategy {
    /// Build the strategy named by `settings.sync_type`.
    pub fn from_config(config: &HistSyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let strategy = match config.settings.sync_type {
            SyncType::Git => Self::Git(GitStrategy::from_config(config)?),
            SyncType::Ssh => Self::Ssh(SshStrategy::from_config(config)?),
            SyncType::Memory => Self::Memory(MemoryStrategy::from_config(config)),
        };
        info!(strategy = strategy.name(), "sync strategy ready");
        Ok(strategy)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Git(_) => "git",
            Self::Ssh(_) => "ssh",
            Self::Memory(_) => "memory",
        }
    }

    /// Let long waits inside a cycle (lock acquisition, push retries) give
    /// up with [`SyncError::Interrupted`] once `flag` is raised.
    pub fn attach_shutdown(&mut self, flag: ShutdownFlag) {
        match self {
            Self::Git(s) => s.set_shutdown(flag),
            Self::Ssh(s) => s.set_shutdown(flag),
            Self::Memory(s) => s.set_shutdown(flag),
        }
    }

    /// Run one full sync cycle.
    #[instrument(skip(self), fields(strategy = self.name()))]
    pub async fn sync(&mut self) -> Result<SyncResult, SyncError> {
        let result = match self {
            Self::Git(s) => s.sync().await,
            Self::Ssh(s) => s.sync().await,
            Self::Memory(s) => s.sync().await,
        }?;
        info!(%result, "sync complete");
        Ok(result)
    }

    /// Empty the shared remote history. Local history is left alone.
    #[instrument(skip(self), fields(strategy = self.name()))]
    pub async fn clear_remote(&mut self) -> Result<(), SyncError> {
        match self {
            Self::Git(s) => s.clear_remote().await,
            Self::Ssh(s) => s.clear_remote().await,
            Self::Memory(s) => s.clear_remote().await,
        }?;
        info!("remote history cleared");
        Ok(())
    }
}

impl From<GitStrategy> for SyncStrategy {
    fn from(s: GitStrategy) -> Self {
        Self::Git(s)
    }
}

impl From<SshStrategy> for SyncStrategy {
    fn from(s: SshStrategy) -> Self {
        Self::Ssh(s)
    }
}

impl From<MemoryStrategy> for SyncStrategy {
    fn from(s: MemoryStrategy) -> Self {
        Self::Memory(s)
    }
}

/// Fold `published` into a fresh read of the local history and write it.
///
/// The shell keeps appending while the remote is being read and written;
/// re-reading here keeps those commands. Returns how many records the local
/// file gained.
pub(crate) fn write_back_local(
    local_path: &Path,
    encodings: &[TextEncoding],
    published: &HistorySet,
) -> Result<u64, SyncError> {
    let current = history::read_history_file(local_path, encodings)?;
    let merged = history::merge(&current, published);
    history::write_history_file(local_path, &merged)?;
    let added = merged.len().saturating_sub(current.len()) as u64;
    debug!(path = %local_path.display(), added, "local history written");
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryRecord;

    #[test]
    fn test_from_config_picks_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HistSyncConfig::default();
        config.paths.local_history = dir.path().join("history");
        config.paths.git_repo = dir.path().join("repo");
        config.settings.sync_type = SyncType::Memory;
        assert_eq!(SyncStrategy::from_config(&config).unwrap().name(), "memory");

        config.settings.sync_type = SyncType::Git;
        assert_eq!(SyncStrategy::from_config(&config).unwrap().name(), "git");

        config.settings.sync_type = SyncType::Ssh;
        assert!(matches!(
            SyncStrategy::from_config(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_write_back_keeps_commands_typed_meanwhile() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("history");
        std::fs::write(&local, ": 10:0;ls\n: 40:0;typed during sync\n").unwrap();

        let published: HistorySet = [
            HistoryRecord::timestamped(10, "ls").unwrap(),
            HistoryRecord::timestamped(20, "from remote").unwrap(),
        ]
        .into_iter()
        .collect();

        let added = write_back_local(&local, &TextEncoding::defaults(), &published).unwrap();
        assert_eq!(added, 1);
        assert_eq!(
            std::fs::read_to_string(&local).unwrap(),
            ": 10:0;ls\n: 20:0;from remote\n: 40:0;typed during sync\n"
        );
    }
}
