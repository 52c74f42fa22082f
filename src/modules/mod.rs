//! Built-in modules and the local (control-node) execution registry (§4.8 step 5).
//!
//! A module baked into the gate (`gate::resident::ModuleTable`) and a
//! module run directly on the control node for the implicit local target
//! share the same contract: [`gate::resident::SyncModule`] for
//! subprocess-style modules, [`gate::resident::FastPathModule`] for
//! in-process async ones. Local execution skips the wire protocol
//! entirely and calls straight into the registered implementation.
//!
//! Real module implementations are explicitly out of scope (spec.md §1
//! non-goal: a library of built-in modules beyond what's needed to
//! exercise the pipeline); `ping`, `command`, and `file` exist to
//! exercise scenarios A/B/F end to end.

pub mod command;
pub mod file;
pub mod ping;

use serde_json::Value;

use crate::error::Result;
use crate::gate::resident::{FastPathModule, ModuleTable, SyncModule};

/// Which wire frame a module expects from a driver that dispatches it
/// remotely (§4.8 step 5: "the appropriate `Module` or `FTLModule`
/// frame"). Mirrors the split [`ModuleTable`] already tracks locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Subprocess-style: dispatched with a `Module` frame.
    Sync,
    /// In-process async: dispatched with an `FtlModule` frame.
    FastPath,
}

/// The set of modules runnable on the control node itself, keyed by name.
/// Built on the same [`ModuleTable`] the gate builder bakes into remote
/// archives, so a module registered here and baked into a gate behaves
/// identically whether it runs locally or over the wire.
pub struct ModuleRegistry {
    table: ModuleTable,
}

impl ModuleRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: ModuleTable::new(),
        }
    }

    /// A registry with `ping`, `command`, and `file` registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_sync("command", Box::new(command::Command));
        registry.register_sync("file", Box::new(file::File));
        registry.register_fast_path("ping", Box::new(ping::Ping));
        registry
    }

    /// Register a subprocess-style module.
    pub fn register_sync(&mut self, name: impl Into<String>, module: Box<dyn SyncModule>) {
        self.table.register_sync(name, module);
    }

    /// Register an in-process async module.
    pub fn register_fast_path(&mut self, name: impl Into<String>, module: Box<dyn FastPathModule>) {
        self.table.register_fast_path(name, module);
    }

    /// `true` if `name` is registered as either kind of module.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.table
            .listing()
            .iter()
            .any(|(registered, _)| registered == name)
    }

    /// `(name, kind)` pairs for every registered module.
    #[must_use]
    pub fn names(&self) -> Vec<(String, &'static str)> {
        self.table.listing()
    }

    /// The dispatch kind registered for `name`, or `None` if it isn't
    /// registered locally at all (e.g. a module only baked into a remote
    /// gate, or shipped ad hoc) — callers default such modules to `Sync`
    /// dispatch, since that's the common case for subprocess-style
    /// automation modules.
    #[must_use]
    pub fn kind_of(&self, name: &str) -> Option<ModuleKind> {
        if self.table.sync_module(name).is_some() {
            Some(ModuleKind::Sync)
        } else if self.table.fast_path_module(name).is_some() {
            Some(ModuleKind::FastPath)
        } else {
            None
        }
    }

    /// Run a non-async module directly, with no wire round trip.
    pub fn run_sync(&self, name: &str, args: &Value, check_mode: bool) -> Option<Result<Value>> {
        self.table.sync_module(name).map(|m| m.run(args, check_mode))
    }

    /// Run an in-process async module directly, with no wire round trip.
    pub async fn run_fast_path(&self, name: &str, args: &Value) -> Option<Result<Value>> {
        match self.table.fast_path_module(name) {
            Some(m) => Some(m.run(args).await),
            None => None,
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn builtins_are_registered_and_runnable() {
        let registry = ModuleRegistry::with_builtins();
        assert!(registry.contains("ping"));
        assert!(registry.contains("command"));
        assert!(registry.contains("file"));

        let result = registry.run_fast_path("ping", &json!({})).await.unwrap().unwrap();
        assert_eq!(result["ping"], "pong");
    }

    #[test]
    fn unregistered_module_returns_none() {
        let registry = ModuleRegistry::new();
        assert!(registry.run_sync("nonexistent", &json!({}), false).is_none());
    }
}
