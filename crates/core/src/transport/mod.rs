//! Remote shell transport used by the SSH strategy and remote locks.

pub mod ssh;

use std::borrow::Cow;

use async_trait::async_trait;

use crate::errors::TransportError;

pub use ssh::SshClient;

/// Output of a remote script.
#[derive(Debug, Clone)]
pub struct ShellOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run a POSIX `sh` script against the remote side.
///
/// `run` only fails for transport-level problems (cannot connect, cannot
/// authenticate); a script that exits non-zero is reported through
/// [`ShellOutput::exit_code`].
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Display name of the remote, for logs and errors.
    fn target(&self) -> String;

    async fn run(&self, script: &str, stdin: Option<&[u8]>) -> Result<ShellOutput, TransportError>;

    /// Run a script and turn a non-zero exit into an error.
    async fn run_checked(
        &self,
        script: &str,
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>, TransportError> {
        let output = self.run(script, stdin).await?;
        if output.success() {
            return Ok(output.stdout);
        }
        if output.stderr.contains("Permission denied") {
            return Err(TransportError::PermissionDenied {
                target: self.target(),
                stderr: output.stderr,
            });
        }
        Err(TransportError::CommandFailed {
            exit_code: output.exit_code,
            stderr: output.stderr,
        })
    }
}

/// Quote a string for a POSIX shell.
pub fn quote(s: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(s)).into_owned()
}

/// Quote a remote path, keeping a leading `~/` expandable.
pub fn quote_remote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) if !rest.is_empty() => format!("\"$HOME\"/{}", quote(rest)),
        _ if path == "~" => "\"$HOME\"".to_string(),
        _ => quote(path),
    }
}


#[cfg(test)]
mod tests {
    use super::local::LocalShell;
    use super::*;

    #[test]
    fn test_quote_remote_path() {
        assert_eq!(quote_remote_path("/tmp/history"), "/tmp/history");
        assert_eq!(quote_remote_path("/tmp/my history"), "'/tmp/my history'");
        assert_eq!(quote_remote_path("~/.zsh_history"), "\"$HOME\"/.zsh_history");
        assert_eq!(quote_remote_path("~"), "\"$HOME\"");
    }

    #[tokio::test]
    async fn test_run_checked_reports_failures() {
        let shell = LocalShell;
        let out = shell.run_checked("printf hi", None).await.unwrap();
        assert_eq!(out, b"hi");

        let err = shell.run_checked("echo boom >&2; exit 3", None).await.unwrap_err();
        assert!(matches!(err, TransportError::CommandFailed { exit_code: 3, .. }));
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let out = LocalShell.run_checked("cat", Some(b"piped")).await.unwrap();
        assert_eq!(out, b"piped");
    }
}
