//! Local (control-node) execution transport (§4.6).
//!
//! Used for hosts with `connection-kind: local` — including the
//! implicit-local target of `Orchestrator::execute` (§4.8) and the local
//! test hosts of scenarios A/B (§8). Grounded in the teacher's
//! `tokio::process`-based command execution, generalized to also hand back
//! a raw stdin/stdout stream for launching the resident gate in-process
//! rather than over the network.

use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{CommandResult, GateLaunch, GateStream, Transport};
use crate::error::{Error, Result};

/// Executes commands and launches the gate as a local child process.
pub struct LocalConnection {
    host: String,
}

impl LocalConnection {
    /// A connection representing the control node itself.
    #[must_use]
    pub fn new() -> Self {
        Self {
            host: "localhost".to_string(),
        }
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for LocalConnection {
    fn host(&self) -> &str {
        &self.host
    }

    async fn execute(&self, command: &str) -> Result<CommandResult> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;

        Ok(CommandResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn open_gate_channel(&self, launch: GateLaunch) -> Result<GateStream> {
        let command_line = match launch {
            GateLaunch::Command(cmd) => cmd,
            GateLaunch::Subsystem(name) => {
                return Err(Error::ConnectionFailed {
                    host: self.host.clone(),
                    message: format!("local transport has no SSH subsystem support: {name}"),
                });
            }
        };

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        Ok(Box::pin(ChildIo {
            stdin,
            stdout,
            _child: child,
        }))
    }

    async fn upload(&self, content: &[u8], remote_path: &Path, executable: bool) -> Result<()> {
        if let Some(parent) = remote_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(remote_path, content).await?;
        if executable {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = tokio::fs::metadata(remote_path).await?.permissions();
                perms.set_mode(0o755);
                tokio::fs::set_permissions(remote_path, perms).await?;
            }
        }
        Ok(())
    }

    async fn path_exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Combines a child process's stdin/stdout into a single `AsyncRead +
/// AsyncWrite` stream; keeps the `Child` alive so it isn't reaped early.
struct ChildIo {
    stdin: ChildStdin,
    stdout: ChildStdout,
    _child: Child,
}

impl AsyncRead for ChildIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.stdin).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn execute_runs_a_shell_command() {
        let conn = LocalConnection::new();
        let result = conn.execute("echo hi").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hi\n");
    }

    #[tokio::test]
    async fn execute_reports_nonzero_exit() {
        let conn = LocalConnection::new();
        let result = conn.execute("exit 7").await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn open_gate_channel_streams_stdin_to_stdout_via_cat() {
        let conn = LocalConnection::new();
        let mut stream = conn
            .open_gate_channel(GateLaunch::Command("cat".to_string()))
            .await
            .unwrap();

        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn path_exists_reflects_filesystem_state() {
        let conn = LocalConnection::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marker");
        assert!(!conn.path_exists(&path).await.unwrap());
        conn.upload(b"hello", &path, false).await.unwrap();
        assert!(conn.path_exists(&path).await.unwrap());
    }
}
