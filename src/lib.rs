//! # ftlgate - gate-based distributed automation
//!
//! `ftlgate` drives automation against a fleet of hosts by shipping a
//! small self-contained executor ("gate") to each one over SSH and
//! talking to it over a length-prefixed JSON wire protocol, rather than
//! re-connecting and re-interpreting a playbook on every task the way
//! classic push-based tools do.
//!
//! ## Core concepts
//!
//! - **Inventory**: hosts and groups, loaded from YAML or built
//!   programmatically.
//! - **Gate**: a deterministic, content-addressed archive containing the
//!   resident dispatcher and whatever modules it needs, built once per
//!   configuration and cached by hash.
//! - **Orchestrator**: resolves targets, injects secret bindings,
//!   enforces policy, dispatches modules locally or through a gate, and
//!   records every invocation to an audit journal.
//! - **Modules**: units of work, either baked into the gate binary
//!   (`SyncModule`/`FastPathModule`) or shipped on demand as a bundled
//!   Python file.
//! - **Bundle/Depend**: deterministic ZIP packaging and dependency
//!   resolution for modules that aren't baked in.
//!
//! ## Architecture overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           CLI Interface                              │
//! │                    (clap-based command parsing)                      │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                           Orchestrator                               │
//! │   target resolution → secrets → policy → dispatch → audit → events   │
//! └─────────────────────────────────────────────────────────────────────┘
//!          │                         │                         │
//!          ▼                         ▼                         ▼
//! ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────────┐
//! │    Inventory     │   │   Module Registry    │   │    Gate Lifecycle   │
//! │  (hosts + groups)│   │  (baked-in modules)   │   │ (build/stage/launch)│
//! └─────────────────┘   └─────────────────────┘   └─────────────────────┘
//!                                                            │
//!                                                            ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                      Connection Layer                                │
//! │              (SSH via russh, or Local for testing)                   │
//! └─────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │              Remote Gate (resident dispatcher process)               │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick example
//!
//! ```rust,ignore
//! use ftlgate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let inventory = Inventory::load_file("inventory.yml")?;
//!     let config = OrchestratorConfig::new(
//!         inventory,
//!         ModuleRegistry::with_builtins(),
//!         SecretResolver::new(Default::default())?,
//!     );
//!     let (orchestrator, _events) = Orchestrator::new(config)?;
//!
//!     let result = orchestrator
//!         .target("web1")
//!         .module("ping")
//!         .run()
//!         .await?;
//!     println!("{:?}", result);
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.
    //!
    //! # Example
    //!
    //! ```rust,ignore
    //! use ftlgate::prelude::*;
    //!
    //! #[tokio::main]
    //! async fn main() -> Result<()> {
    //!     let inventory = Inventory::load_file("inventory.yml")?;
    //!     let (orchestrator, _events) = Orchestrator::new(OrchestratorConfig::new(
    //!         inventory,
    //!         ModuleRegistry::with_builtins(),
    //!         SecretResolver::new(Default::default())?,
    //!     ))?;
    //!     let result = orchestrator.target("web1").module("ping").run().await?;
    //!     Ok(())
    //! }
    //! ```

    // Connection types
    pub use crate::connection::local::LocalConnection;
    #[cfg(feature = "russh")]
    pub use crate::connection::russh::RusshConnection;
    pub use crate::connection::{AuthConfig, CommandResult, Transport};

    // Error handling
    pub use crate::error::{Error, Result};

    // Inventory
    pub use crate::inventory::{ConnectionKind, Group, HostSpec, Inventory, Target};

    // Module system
    pub use crate::modules::ModuleRegistry;

    // Gate build/lifecycle
    pub use crate::gate::{GateBuildConfig, GateBuilder, GateConnection, GateLifecycle};

    // Orchestrator
    pub use crate::orchestrator::{
        AuditAction, AuditRecorder, AuditReplayer, EventRouter, ModuleInvoker, ModuleRequest,
        ModuleResult, Orchestrator, OrchestratorConfig, PolicyEngine, StateStore,
    };

    // Secrets
    pub use crate::secrets::SecretResolver;

    // Bundling and dependency resolution
    pub use crate::bundle::{build_bundle, Bundle, BundleInfo};
    pub use crate::depend::{find_all_dependencies, ResolveOptions};

    // Configuration
    pub use crate::config::EngineConfig;
}

// ============================================================================
// Core infrastructure
// ============================================================================

/// Error types and result aliases for `ftlgate` operations.
///
/// Covers connection failures, gate handshake/build errors, module
/// dispatch failures, policy denials, and configuration problems in one
/// taxonomy so callers can match on a single enum.
pub mod error;

/// Wire protocol codec (§4.1): length-prefixed, two-element JSON frames
/// shared by every transport a gate connection can run over.
pub mod protocol;

/// Connection layer for remote host communication.
///
/// Provides the [`connection::Transport`] trait and implementations:
/// **Local** for control-node execution (used by tests and the implicit
/// `local` target) and **SSH** via `russh` behind the `russh` feature.
pub mod connection;

/// Host and group inventory management.
///
/// Loads the YAML inventory document (`hosts`/`vars`/`children`),
/// resolves host attributes, and answers target/group-membership
/// queries for the orchestrator.
pub mod inventory;

// ============================================================================
// Module dependency resolution and packaging
// ============================================================================

/// Module dependency discovery: following `module_utils` imports to
/// build the minimal file closure a bundle needs to run standalone.
pub mod depend;

/// Deterministic, content-addressed ZIP bundling for modules shipped to
/// a gate on demand rather than baked in at build time.
pub mod bundle;

// ============================================================================
// Gate build and lifecycle
// ============================================================================

/// Gate archive assembly, staging, and connection lifecycle.
///
/// A gate bundles the resident dispatcher with whatever modules and
/// dependencies a build needs into one deterministic, hash-cached
/// archive, then manages getting it onto a host, launching it, and
/// handshaking a connection.
pub mod gate;

// ============================================================================
// Modules (built-in task implementations)
// ============================================================================

/// Built-in module implementations and the local execution registry.
///
/// Modules run either as baked-in Rust implementations
/// ([`gate::resident::SyncModule`]/[`gate::resident::FastPathModule`])
/// or as on-demand Python bundles shipped through [`bundle`]. Real
/// module coverage beyond what's needed to exercise the pipeline
/// (`ping`, `command`, `file`) is out of scope.
pub mod modules;

// ============================================================================
// Secrets
// ============================================================================

/// Secret binding resolution: module-name glob patterns mapped to
/// `{param_name: env_var}` injections, resolved once and merged into
/// module arguments without ever overriding a caller-supplied value.
pub mod secrets;

// ============================================================================
// Orchestration
// ============================================================================

/// Target resolution, secret injection, policy enforcement, dispatch,
/// audit recording/replay, and async event routing.
///
/// This is the library's main entry point: construct an
/// [`orchestrator::Orchestrator`] from an [`inventory::Inventory`], a
/// [`modules::ModuleRegistry`], and a [`secrets::SecretResolver`], then
/// drive it through [`orchestrator::Orchestrator::target`],
/// [`orchestrator::Orchestrator::execute`], or
/// [`orchestrator::Orchestrator::run_on`].
pub mod orchestrator;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration management for `ftlgate` behavior.
///
/// Handles loading and merging configuration from environment
/// variables, a config file, and CLI flags.
pub mod config;

// ============================================================================
// Reporting and output
// ============================================================================

/// Output formatting for run summaries (§7: user-visible failure
/// behavior), gated by [`output::OutputMode`].
pub mod output;

// ============================================================================
// Version information
// ============================================================================

/// Returns the current version of `ftlgate`.
#[must_use]
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns detailed version information including build metadata.
#[must_use]
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        rust_version: option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown"),
        target: std::env::consts::ARCH,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Detailed version information for the `ftlgate` build.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Semantic version string
    pub version: &'static str,
    /// Minimum Rust version required
    pub rust_version: &'static str,
    /// Target triple for the build
    pub target: &'static str,
    /// Build profile (debug or release)
    pub profile: &'static str,
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ftlgate {} ({}, {})", self.version, self.target, self.profile)
    }
}
