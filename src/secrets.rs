//! Secret binding resolution (§4.8 step 2).
//!
//! A binding maps a module-name glob to a set of `{param_name: env_var}`
//! pairs. Before a module runs, every binding whose pattern matches the
//! module name contributes its resolved env-var values as parameter
//! injections — unless the caller already supplied that parameter, which
//! always wins.
//!
//! Grounded on `examples/original_source/src/ftl2/automation/context.py`'s
//! `_load_bound_secrets` / `_get_secret_bindings_for_module`: env vars
//! referenced by any binding are resolved once up front, then looked up
//! per module invocation by glob match instead of querying the
//! environment on every call.

use std::collections::{HashMap, HashSet};

use globset::Glob;
use tracing::warn;

use crate::error::Result;

/// A source of secret values, queried by environment-variable name. The
/// default is the process environment; a vault-backed store can be
/// plugged in without touching the resolution logic.
pub trait SecretSource: Send + Sync {
    /// Look up `env_var`, if this source has a value for it.
    fn get(&self, env_var: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Default)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get(&self, env_var: &str) -> Option<String> {
        std::env::var(env_var).ok()
    }
}

/// `{param_name: env_var}` pairs a single pattern injects.
pub type ParamBindings = HashMap<String, String>;

/// Resolves secret bindings for module invocations. Bindings are
/// registered once (typically from configuration); `load()` resolves
/// every referenced env var a single time, and `bindings_for_module`
/// is then a cheap glob match against already-loaded values.
pub struct SecretResolver {
    bindings: Vec<(Glob, ParamBindings)>,
    bound: HashMap<String, String>,
    source: Box<dyn SecretSource>,
}

impl SecretResolver {
    /// Build a resolver over `bindings` (module-name glob pattern to
    /// `{param_name: env_var}`), using the process environment as the
    /// secret source.
    pub fn new(bindings: HashMap<String, ParamBindings>) -> Result<Self> {
        Self::with_source(bindings, Box::new(EnvSecretSource))
    }

    /// Build a resolver with a caller-supplied [`SecretSource`].
    pub fn with_source(
        bindings: HashMap<String, ParamBindings>,
        source: Box<dyn SecretSource>,
    ) -> Result<Self> {
        let mut compiled = Vec::with_capacity(bindings.len());
        for (pattern, param_bindings) in bindings {
            let glob = Glob::new(&pattern)
                .map_err(|e| crate::error::Error::Config(format!("invalid secret binding pattern '{pattern}': {e}")))?;
            compiled.push((glob, param_bindings));
        }
        Ok(Self {
            bindings: compiled,
            bound: HashMap::new(),
            source,
        })
    }

    /// Resolve every env var referenced by any binding, once. Missing
    /// values are logged and simply absent from later lookups rather than
    /// treated as an error — a binding that references an unset secret
    /// contributes nothing instead of failing the run.
    pub fn load(&mut self) {
        let mut env_vars_needed: HashSet<&str> = HashSet::new();
        for (_, param_bindings) in &self.bindings {
            env_vars_needed.extend(param_bindings.values().map(String::as_str));
        }

        for env_var in env_vars_needed {
            match self.source.get(env_var) {
                Some(value) => {
                    self.bound.insert(env_var.to_string(), value);
                }
                None => warn!(env_var, "secret binding references an unset value"),
            }
        }
    }

    /// `{param_name: value}` injections for every binding whose pattern
    /// matches `module_name`. Caller-supplied parameters always override
    /// an injection; this only returns candidates, the caller decides
    /// precedence at merge time.
    #[must_use]
    pub fn bindings_for_module(&self, module_name: &str) -> ParamBindings {
        let mut injections = ParamBindings::new();
        for (glob, param_bindings) in &self.bindings {
            if !glob.compile_matcher().is_match(module_name) {
                continue;
            }
            for (param_name, env_var) in param_bindings {
                if let Some(value) = self.bound.get(env_var) {
                    injections.insert(param_name.clone(), value.clone());
                }
            }
        }
        injections
    }

    /// Merge secret injections into `params`, never overwriting a key the
    /// caller already set.
    pub fn inject(&self, module_name: &str, params: &mut serde_json::Map<String, serde_json::Value>) {
        for (param_name, value) in self.bindings_for_module(module_name) {
            params
                .entry(param_name)
                .or_insert_with(|| serde_json::Value::String(value));
        }
    }
}
