//! Error types for the gate execution engine.
//!
//! One [`Error`] enum covers the full taxonomy of §7: protocol framing,
//! transport, authentication, handshake, module execution, policy, replay,
//! and state/audit persistence failures. Each variant carries the context
//! needed to produce a useful diagnostic without re-deriving it at the
//! call site.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Protocol errors (§4.1, §7)
    // ========================================================================
    /// Frame could not be parsed: bad length prefix, short read, malformed body.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection was closed mid-write (broken pipe) or mid-read.
    #[error("connection closed unexpectedly{}", host.as_ref().map(|h| format!(" for '{h}'")).unwrap_or_default())]
    ConnectionClosed {
        /// Host the connection served, if known.
        host: Option<String>,
    },

    // ========================================================================
    // Transport errors (§4.6, §7)
    // ========================================================================
    /// Failed to establish a connection after retries were exhausted.
    #[error("connection to '{host}' failed: {message}")]
    ConnectionFailed {
        /// Target host name.
        host: String,
        /// Underlying message.
        message: String,
    },

    /// A network read/write exceeded its configured timeout.
    #[error("connection to '{host}' timed out after {timeout_secs}s")]
    ConnectionTimeout {
        /// Target host name.
        host: String,
        /// Configured timeout, in seconds.
        timeout_secs: u64,
    },

    /// Authentication was rejected. Terminal: never retried.
    #[error("authentication failed for '{user}@{host}' using {method}: {message}")]
    AuthenticationFailed {
        /// Username attempted.
        user: String,
        /// Target host name.
        host: String,
        /// Auth method attempted (private-key | password | agent).
        method: String,
        /// Underlying message.
        message: String,
    },

    /// File transfer (stage/read) to or from a remote host failed.
    #[error("file transfer failed for '{host}': {message}")]
    FileTransfer {
        /// Target host name.
        host: String,
        /// Underlying message.
        message: String,
    },

    // ========================================================================
    // Gate handshake / lifecycle errors (§4.5, §4.7, §7)
    // ========================================================================
    /// The gate did not reply `Hello` to the initial handshake.
    #[error("gate handshake failed on '{host}': {message}{}", stderr.as_ref().map(|s| format!("\nstderr: {s}")).unwrap_or_default())]
    GateHandshake {
        /// Target host name.
        host: String,
        /// Diagnostic message.
        message: String,
        /// Drained stderr output, if any.
        stderr: Option<String>,
    },

    /// The remote interpreter is older than the required major version.
    #[error("remote interpreter on '{host}' is too old: found {found}, need >= {required}")]
    InterpreterTooOld {
        /// Target host name.
        host: String,
        /// Version string observed.
        found: String,
        /// Minimum required version string.
        required: String,
    },

    /// An unhandled exception surfaced inside the gate's dispatch loop.
    #[error("gate on '{host}' reported an internal error: {message}")]
    GateSystemError {
        /// Target host name.
        host: String,
        /// Error message.
        message: String,
        /// Traceback/backtrace text, if the gate supplied one.
        traceback: Option<String>,
    },

    // ========================================================================
    // Module errors (§4.8, §7)
    // ========================================================================
    /// No module with this name is registered or resolvable.
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// Module arguments failed validation before dispatch.
    #[error("invalid arguments for module '{module}': {message}")]
    ModuleArgs {
        /// Module name.
        module: String,
        /// Error message.
        message: String,
    },

    /// The module ran but reported failure (`failed: true` or non-zero exit).
    #[error("module '{module}' failed on '{host}': {message}")]
    ModuleExecution {
        /// Module name.
        module: String,
        /// Target host name.
        host: String,
        /// Error message.
        message: String,
    },

    // ========================================================================
    // Dependency / bundle / gate build errors (§4.2, §4.3, §4.4)
    // ========================================================================
    /// Dependency resolution aborted (not the same as an unresolved import,
    /// which is recorded rather than raised per §4.2).
    #[error("dependency resolution failed for '{}': {message}", module.display())]
    DependencyResolution {
        /// Module file path.
        module: PathBuf,
        /// Error message.
        message: String,
    },

    /// Bundle construction failed.
    #[error("bundle build failed for '{}': {message}", module.display())]
    BundleBuild {
        /// Module file path.
        module: PathBuf,
        /// Error message.
        message: String,
    },

    /// Gate construction failed.
    #[error("gate build failed: {0}")]
    GateBuild(String),

    // ========================================================================
    // Orchestration errors (§4.8, §4.11, §7)
    // ========================================================================
    /// A policy rule denied the invocation before any network activity.
    #[error("policy '{rule}' denied {module} on '{host}': {reason}")]
    PolicyDenied {
        /// Identifier of the rule that matched.
        rule: String,
        /// Module name.
        module: String,
        /// Target host name.
        host: String,
        /// Human-readable reason from the rule.
        reason: String,
    },

    /// `fail_fast` was set and a single-host invocation failed.
    #[error("automation failed: {0}")]
    AutomationFailed(String),

    /// An unknown host or group name was used as a target.
    #[error("unknown target: '{0}'")]
    UnknownTarget(String),

    // ========================================================================
    // Inventory errors (§6)
    // ========================================================================
    /// Failed to load or parse the inventory file.
    #[error("failed to load inventory from '{}': {message}", path.display())]
    InventoryLoad {
        /// Inventory file path.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Host not present in the inventory.
    #[error("host '{0}' not found in inventory")]
    HostNotFound(String),

    /// Group not present in the inventory.
    #[error("group '{0}' not found in inventory")]
    GroupNotFound(String),

    // ========================================================================
    // State / audit persistence errors (§4.10, §4.12, §7)
    // ========================================================================
    /// Disk I/O failure while reading or writing state/audit files. These
    /// are surfaced immediately rather than swallowed, per §7.
    #[error("persistence error at '{}': {message}", path.display())]
    Persistence {
        /// File path involved.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    // ========================================================================
    // Configuration errors
    // ========================================================================
    /// Configuration loading/merging failed.
    #[error("configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Passthrough errors
    // ========================================================================
    /// Wrapped I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wrapped YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// True for the error kinds that the retry policy of §4.6/§7 considers
    /// transient and therefore worth retrying with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. } | Error::ConnectionTimeout { .. }
        )
    }

    /// True for errors that must never be retried (§7: authentication is terminal).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::AuthenticationFailed { .. })
    }
}
