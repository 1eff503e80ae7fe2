//! Configuration for histsync.
//!
//! Loaded from a TOML file (default `~/.config/histsync/config.toml`).
//! Paths may start with `~/`; [`HistSyncConfig::resolve_paths`] expands them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::history::TextEncoding;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level histsync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistSyncConfig {
    /// File-system locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// General sync settings.
    #[serde(default)]
    pub settings: SettingsConfig,

    /// Git strategy settings.
    #[serde(default)]
    pub git: GitConfig,

    /// SSH strategy settings. Required when `settings.sync_type = "ssh"`.
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// The shell's own history file.
    #[serde(default = "default_local_history")]
    pub local_history: PathBuf,

    /// History file inside the git working copy; relative paths are joined
    /// to `git_repo`.
    #[serde(default = "default_remote_history")]
    pub remote_history: PathBuf,

    /// Local working copy of the history repository.
    #[serde(default = "default_git_repo")]
    pub git_repo: PathBuf,

    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,

    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
}

fn default_local_history() -> PathBuf {
    PathBuf::from("~/.zsh_history")
}

fn default_remote_history() -> PathBuf {
    PathBuf::from("history.txt")
}

fn default_git_repo() -> PathBuf {
    PathBuf::from("~/.zsh_history_git")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("~/.history_syncer/history_syncer.log")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("~/.history_syncer/history_syncer.pid")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            local_history: default_local_history(),
            remote_history: default_remote_history(),
            git_repo: default_git_repo(),
            log_file: default_log_file(),
            pid_file: default_pid_file(),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Which transport carries history between machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Git,
    Ssh,
    Memory,
}

impl fmt::Display for SyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Ssh => write!(f, "ssh"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    /// Seconds between daemon sync cycles (default one hour).
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,

    #[serde(default = "default_sync_type")]
    pub sync_type: SyncType,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Encodings tried in order when reading history files.
    #[serde(default = "TextEncoding::defaults")]
    pub encodings: Vec<TextEncoding>,
}

fn default_sync_interval() -> u64 {
    3600
}

fn default_sync_type() -> SyncType {
    SyncType::Git
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            sync_interval_seconds: default_sync_interval(),
            sync_type: default_sync_type(),
            log_level: default_log_level(),
            encodings: TextEncoding::defaults(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Remote repository URL. Without one, history is only committed locally.
    #[serde(default)]
    pub repository_url: Option<String>,

    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_remote_name")]
    pub remote_name: String,

    /// Commit+push attempts before giving up on a concurrently advancing remote.
    #[serde(default = "default_max_push_attempts")]
    pub max_push_attempts: u32,

    #[serde(default = "default_author_name")]
    pub author_name: String,

    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_branch() -> String {
    "main".into()
}

fn default_remote_name() -> String {
    "origin".into()
}

fn default_max_push_attempts() -> u32 {
    3
}

fn default_author_name() -> String {
    "histsync".into()
}

fn default_author_email() -> String {
    "histsync@localhost".into()
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repository_url: None,
            branch: default_branch(),
            remote_name: default_remote_name(),
            max_push_attempts: default_max_push_attempts(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    pub username: String,

    /// History file on the remote host.
    #[serde(default = "default_ssh_remote_path")]
    pub remote_path: String,

    /// Lock file on the remote host guarding `remote_path`.
    #[serde(default = "default_ssh_lock_file")]
    pub lock_file: String,

    /// How long to wait for a held remote lock.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Age after which a remote lock is reclaimed. Defaults to twice the
    /// sync interval.
    #[serde(default)]
    pub lock_stale_secs: Option<u64>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Upper bound on a single remote command.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_remote_path() -> String {
    "~/.zsh_history_shared".into()
}

fn default_ssh_lock_file() -> String {
    "~/.histsync.lock".into()
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    60
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl Default for HistSyncConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            settings: SettingsConfig::default(),
            git: GitConfig::default(),
            ssh: None,
        }
    }
}

impl HistSyncConfig {
    /// Load a [`HistSyncConfig`] from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: HistSyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.sync_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "settings.sync_interval_seconds".into(),
                detail: "sync interval must be > 0".into(),
            });
        }
        if self.paths.local_history.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "paths.local_history".into(),
                detail: "local history path must not be empty".into(),
            });
        }

        match self.settings.sync_type {
            SyncType::Git => {
                if self.git.branch.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "git.branch".into(),
                        detail: "branch must not be empty".into(),
                    });
                }
                if self.git.remote_name.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "git.remote_name".into(),
                        detail: "remote name must not be empty".into(),
                    });
                }
                if self.git.max_push_attempts == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "git.max_push_attempts".into(),
                        detail: "at least one push attempt is required".into(),
                    });
                }
            }
            SyncType::Ssh => {
                let ssh = self.ssh.as_ref().ok_or_else(|| ConfigError::InvalidValue {
                    field: "ssh".into(),
                    detail: "sync_type = \"ssh\" requires an [ssh] section".into(),
                })?;
                if ssh.host.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "ssh.host".into(),
                        detail: "SSH host must not be empty".into(),
                    });
                }
                if ssh.username.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "ssh.username".into(),
                        detail: "SSH username must not be empty".into(),
                    });
                }
                if ssh.remote_path.is_empty() || ssh.lock_file.is_empty() {
                    return Err(ConfigError::InvalidValue {
                        field: "ssh.remote_path".into(),
                        detail: "remote path and lock file must not be empty".into(),
                    });
                }
            }
            SyncType::Memory => {}
        }

        Ok(())
    }

    /// Expand `~` in local paths and anchor `remote_history` in the
    /// git working copy.
    pub fn resolve_paths(&mut self) {
        self.paths.local_history = expand_tilde(&self.paths.local_history);
        self.paths.git_repo = expand_tilde(&self.paths.git_repo);
        self.paths.log_file = expand_tilde(&self.paths.log_file);
        self.paths.pid_file = expand_tilde(&self.paths.pid_file);

        let remote = expand_tilde(&self.paths.remote_history);
        self.paths.remote_history = if remote.is_relative() {
            self.paths.git_repo.join(remote)
        } else {
            remote
        };
        debug!(paths = ?self.paths, "resolved paths");
    }

    /// Convenience: load, validate, and resolve in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.validate()?;
        config.resolve_paths();
        Ok(config)
    }

    /// Write the default template to `path`, creating parent directories.
    /// Refuses to overwrite an existing file.
    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::InvalidValue {
                field: "config".into(),
                detail: format!("{} already exists", path.display()),
            });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::default_template())?;
        info!(path = %path.display(), "wrote default configuration");
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.settings.sync_interval_seconds)
    }

    /// Remote lock staleness threshold: explicit, or twice the sync interval.
    pub fn lock_stale_after(&self) -> Duration {
        let explicit = self.ssh.as_ref().and_then(|s| s.lock_stale_secs);
        Duration::from_secs(explicit.unwrap_or(self.settings.sync_interval_seconds.saturating_mul(2)))
    }

    /// Generate a default TOML config template string.
    pub fn default_template() -> &'static str {
        r#"# histsync configuration

[paths]
local_history = "~/.zsh_history"
remote_history = "history.txt"   # relative to git_repo
git_repo = "~/.zsh_history_git"
log_file = "~/.history_syncer/history_syncer.log"
pid_file = "~/.history_syncer/history_syncer.pid"

[settings]
sync_interval_seconds = 3600
sync_type = "git"                # git | ssh | memory
log_level = "info"
encodings = ["utf-8", "latin-1"]

[git]
# repository_url = "git@github.com:you/shell-history.git"
branch = "main"
remote_name = "origin"
max_push_attempts = 3
author_name = "histsync"
author_email = "histsync@localhost"

# [ssh]
# host = "example.com"
# port = 22
# username = "you"
# remote_path = "~/.zsh_history_shared"
# lock_file = "~/.histsync.lock"
# lock_timeout_secs = 30
# lock_stale_secs = 7200         # default: 2 x sync interval
# connect_timeout_secs = 5
# identity_file = "~/.ssh/id_ed25519"
"#
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
[paths]
local_history = "/tmp/hs/.zsh_history"
remote_history = "history.txt"
git_repo = "/tmp/hs/repo"
pid_file = "/tmp/hs/histsync.pid"

[settings]
sync_interval_seconds = 600
sync_type = "ssh"
log_level = "debug"
encodings = ["utf8"]

[git]
repository_url = "git@example.com:me/history.git"
branch = "trunk"

[ssh]
host = "box.example.com"
port = 2222
username = "me"
remote_path = "/srv/history/zsh"
lock_file = "/srv/history/zsh.lock"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: HistSyncConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.settings.sync_interval_seconds, 600);
        assert_eq!(config.settings.sync_type, SyncType::Ssh);
        assert_eq!(config.settings.encodings, vec![TextEncoding::Utf8]);
        assert_eq!(config.git.branch, "trunk");
        assert_eq!(config.git.remote_name, "origin");
        let ssh = config.ssh.as_ref().unwrap();
        assert_eq!(ssh.port, 2222);
        assert_eq!(ssh.lock_timeout_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config: HistSyncConfig = toml::from_str("").unwrap();
        assert_eq!(config.settings.sync_interval_seconds, 3600);
        assert_eq!(config.settings.sync_type, SyncType::Git);
        assert_eq!(config.git.max_push_attempts, 3);
        assert_eq!(config.paths.remote_history, PathBuf::from("history.txt"));
        assert!(config.ssh.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_sync_type_rejected() {
        let result: Result<HistSyncConfig, _> = toml::from_str("[settings]\nsync_type = \"ftp\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, sample_toml()).unwrap();

        let config = HistSyncConfig::load_from_file(&path).expect("load failed");
        assert_eq!(config.settings.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = HistSyncConfig::load_from_file("/nonexistent/histsync.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = HistSyncConfig::default();
        config.settings.sync_interval_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "settings.sync_interval_seconds"
        ));
    }

    #[test]
    fn test_validate_requires_ssh_section() {
        let mut config = HistSyncConfig::default();
        config.settings.sync_type = SyncType::Ssh;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "ssh"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_push_attempts() {
        let mut config = HistSyncConfig::default();
        config.git.max_push_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_paths_anchors_remote_history() {
        let mut config: HistSyncConfig = toml::from_str(sample_toml()).unwrap();
        config.resolve_paths();
        assert_eq!(
            config.paths.remote_history,
            PathBuf::from("/tmp/hs/repo/history.txt")
        );
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.zsh_history")), home.join(".zsh_history"));
        }
        assert_eq!(expand_tilde(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    }

    #[test]
    fn test_lock_stale_defaults_to_twice_interval() {
        let mut config: HistSyncConfig = toml::from_str(sample_toml()).unwrap();
        assert_eq!(config.lock_stale_after(), Duration::from_secs(1200));
        config.ssh.as_mut().unwrap().lock_stale_secs = Some(90);
        assert_eq!(config.lock_stale_after(), Duration::from_secs(90));
    }

    #[test]
    fn test_default_template_is_valid() {
        let config: HistSyncConfig = toml::from_str(HistSyncConfig::default_template())
            .expect("default template should be valid TOML");
        config.validate().unwrap();
    }

    #[test]
    fn test_write_default_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("config.toml");
        HistSyncConfig::write_default(&path).unwrap();
        assert!(path.exists());
        assert!(HistSyncConfig::write_default(&path).is_err());
    }
}
