//! Asynchronous SSH client driving the system `ssh` binary.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{quote, RemoteShell, ShellOutput};
use crate::config::SshConfig;
use crate::errors::TransportError;

/// ssh reserves exit status 255 for its own connection/auth failures.
const SSH_FAILURE_EXIT: i32 = 255;

/// Runs scripts on a remote host through `ssh` in batch mode.
#[derive(Debug, Clone)]
pub struct SshClient {
    host: String,
    port: u16,
    username: String,
    identity_file: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl SshClient {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            identity_file: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &SshConfig) -> Self {
        let mut client = Self::new(&config.host, config.port, &config.username);
        client.identity_file = config.identity_file.clone();
        client.connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        client.command_timeout = Duration::from_secs(config.command_timeout_secs);
        client
    }

    pub fn destination(&self) -> String {
        if self.username.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }

    /// Arguments passed to `ssh`, ending with the remote command.
    pub fn ssh_args(&self, script: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-p".to_string(),
            self.port.to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(self.destination());
        // The login shell may be zsh or fish; always hand the script to sh.
        args.push(format!("sh -c {}", quote(script)));
        args
    }
}

#[async_trait]
impl RemoteShell for SshClient {
    fn target(&self) -> String {
        self.destination()
    }

    #[instrument(skip(self, script, stdin), fields(target = %self.destination()))]
    async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<ShellOutput, TransportError> {
        debug!(script, "running remote script");
        let mut child = Command::new("ssh")
            .args(self.ssh_args(script))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    TransportError::BinaryNotFound("ssh".into())
                } else {
                    TransportError::IoError(e)
                }
            })?;

        if let Some(mut pipe) = child.stdin.take() {
            if let Some(bytes) = stdin {
                // The script may exit without reading stdin.
                if let Err(e) = pipe.write_all(bytes).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e.into());
                    }
                }
            }
        }

        let output = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| TransportError::Unreachable {
                target: self.destination(),
                stderr: format!("no response within {}s", self.command_timeout.as_secs()),
            })??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if exit_code == SSH_FAILURE_EXIT {
            warn!(%stderr, "ssh connection failed");
            return Err(TransportError::Unreachable {
                target: self.destination(),
                stderr,
            });
        }

        Ok(ShellOutput {
            exit_code,
            stdout: output.stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination() {
        assert_eq!(SshClient::new("box", 22, "me").destination(), "me@box");
        assert_eq!(SshClient::new("box", 22, "").destination(), "box");
    }

    #[test]
    fn test_ssh_args_batch_mode_and_quoting() {
        let mut client = SshClient::new("box", 2222, "me");
        client.identity_file = Some("/home/me/.ssh/id".into());
        let args = client.ssh_args("cat /tmp/h");
        assert_eq!(args[..2], ["-o".to_string(), "BatchMode=yes".to_string()]);
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/home/me/.ssh/id"]));
        assert_eq!(args[args.len() - 2], "me@box");
        assert_eq!(args[args.len() - 1], "sh -c 'cat /tmp/h'");
    }
}
