//! Engine configuration.
//!
//! Layered like the teacher's own `config` module: built-in defaults,
//! overridden by an optional `ftlgate.toml`, overridden by environment
//! variables prefixed `FTL_`. Unlike the teacher's hand-rolled loader this
//! crate threads everything through the `config` crate, since every field
//! here is a flat engine setting rather than the teacher's sprawling
//! playbook-execution defaults.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Local directory used to cache built gate archives.
    pub gate_cache_dir: PathBuf,
    /// Remote directory gates are staged into (default `/tmp`).
    pub remote_gate_dir: String,
    /// Remote directory bundles are staged into.
    pub remote_bundle_dir: String,
    /// Default interpreter path baked into built gates.
    pub remote_interpreter: String,
    /// Minimum required remote interpreter major version.
    pub min_interpreter_major: u32,
    /// Connection and dispatch settings.
    pub connection: ConnectionSettings,
    /// Path to a policy rule file (§4.11), if any.
    pub policy_file: Option<PathBuf>,
    /// Path to write the audit journal to on context close (§4.10).
    pub audit_record_file: Option<PathBuf>,
    /// Path to a prior journal to replay from (§4.10).
    pub audit_replay_file: Option<PathBuf>,
    /// Path to the dynamic-host state store (§4.12).
    pub state_file: Option<PathBuf>,
    /// Label identifying the deployment environment for policy predicates.
    pub environment: String,
    /// Raise on first failure for single-host invocations (§4.8, §7).
    pub fail_fast: bool,
}

/// Connection-layer settings (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Per-read/write timeout.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum connection attempts before giving up.
    pub max_retries: u32,
    /// Initial backoff delay (doubles each attempt, per §4.6).
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Host-key checking policy.
    pub host_key_policy: HostKeyPolicy,
}

/// Host-key verification strictness (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Require a match against known hosts.
    Strict,
    /// Accept and remember unknown keys.
    Lenient,
    /// Perform no verification at all (testing only).
    Disabled,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            host_key_policy: HostKeyPolicy::Lenient,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("ftlgate");
        Self {
            gate_cache_dir: cache_dir,
            remote_gate_dir: "/tmp".to_string(),
            remote_bundle_dir: "/tmp/ftl2_bundles".to_string(),
            remote_interpreter: "python3".to_string(),
            min_interpreter_major: 3,
            connection: ConnectionSettings::default(),
            policy_file: None,
            audit_record_file: None,
            audit_replay_file: None,
            state_file: None,
            environment: "default".to_string(),
            fail_fast: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from (in increasing precedence): built-in
    /// defaults, an optional config file, then `FTL_`-prefixed
    /// environment variables.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults).map_err(|e| Error::Config(e.to_string()))?,
        );

        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            builder = builder.add_source(config::File::with_name("ftlgate").required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FTL")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build().map_err(|e| Error::Config(e.to_string()))?;
        merged
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }
}
