//! Connection transport (§4.6).
//!
//! Generalizes the teacher's broad `Connection` trait (SSH/local/Docker,
//! pooling, batch execution) down to exactly the contract the gate
//! lifecycle needs: open an authenticated byte stream, run a one-shot
//! command, transfer a file, check for its existence. Two backends ship:
//! `local` (direct process execution) and `russh` (pure-Rust SSH, the
//! teacher's preferred backend).

pub mod local;
pub mod retry;
#[cfg(feature = "russh")]
pub mod russh;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use retry::{retry, BackoffStrategy, RetryPolicy, RetryStats};

use crate::error::Result;

/// Outcome of running a command to completion (§4.6(b)).
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandResult {
    /// `true` iff the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How to start the resident gate process (§4.6: "subsystem or command").
#[derive(Debug, Clone)]
pub enum GateLaunch {
    /// Run as an ordinary shell command, e.g. `<interpreter> <gate-path>`.
    Command(String),
    /// Request a registered SSH subsystem by name.
    Subsystem(String),
}

/// Marker trait tying `AsyncRead + AsyncWrite + Send` together so the gate
/// stream type can be named without repeating the bound everywhere.
pub trait GateIo: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> GateIo for T {}

/// A bidirectional byte stream to a launched gate process.
pub type GateStream = Pin<Box<dyn GateIo>>;

/// Credentials tried in precedence order (§4.6): explicit private key,
/// then explicit password, then the default key search locations.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Explicit path to a private key file.
    pub private_key_path: Option<std::path::PathBuf>,
    /// Passphrase protecting the private key, if any.
    pub private_key_passphrase: Option<String>,
    /// Explicit password, tried if no private key is configured or it fails.
    pub password: Option<String>,
}

/// The connection-layer contract every transport backend implements.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The host name or address this transport serves.
    fn host(&self) -> &str;

    /// Run a command to completion and capture its output.
    async fn execute(&self, command: &str) -> Result<CommandResult>;

    /// Launch the gate process and return a bidirectional stream to it.
    async fn open_gate_channel(&self, launch: GateLaunch) -> Result<GateStream>;

    /// Upload raw bytes to `remote_path`, optionally marking it executable.
    async fn upload(&self, content: &[u8], remote_path: &Path, executable: bool) -> Result<()>;

    /// Check whether `path` exists on the remote host.
    async fn path_exists(&self, path: &Path) -> Result<bool>;

    /// Close the underlying connection.
    async fn close(&self) -> Result<()>;
}
