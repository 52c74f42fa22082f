//! Typed module-invocation combinator (§9 design note): a deliberate
//! replacement for the dotted-chain scripting sugar
//! (`ftl.host.module(args)`) the original exposed via `__getattr__`
//! proxies. Every step here is an explicit method call instead of
//! dynamic attribute resolution, so a typo in a module name is a
//! compile-time non-issue caught at `.run()` time rather than silently
//! building a bogus attribute chain.

use serde_json::{Map, Value};

use crate::error::Result;

use super::{ModuleRequest, ModuleResult, Orchestrator};

/// Accumulates a module name, arguments, and an optional check-mode
/// override for one or more hosts, then dispatches through the owning
/// [`Orchestrator`].
pub struct ModuleInvoker<'a> {
    orchestrator: &'a Orchestrator,
    target: String,
    module: Option<String>,
    params: Map<String, Value>,
    check_mode: Option<bool>,
}

impl<'a> ModuleInvoker<'a> {
    pub(super) fn new(orchestrator: &'a Orchestrator, target: String) -> Self {
        Self {
            orchestrator,
            target,
            module: None,
            params: Map::new(),
            check_mode: None,
        }
    }

    /// Select the module to run. Required before `.run()`/`.run_on_all()`.
    #[must_use]
    pub fn module(mut self, name: impl Into<String>) -> Self {
        self.module = Some(name.into());
        self
    }

    /// Set a single parameter, overwriting any prior value for `key`.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Merge a full parameter object in at once.
    #[must_use]
    pub fn params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params.extend(map);
        }
        self
    }

    /// Override the orchestrator-wide check-mode setting for this call.
    #[must_use]
    pub fn check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = Some(check_mode);
        self
    }

    fn build_request(&self) -> Result<ModuleRequest> {
        let module = self
            .module
            .clone()
            .ok_or_else(|| crate::error::Error::ModuleArgs {
                module: self.target.clone(),
                message: "no module selected; call .module(name) before running".to_string(),
            })?;
        let mut request = ModuleRequest::new(module, Value::Object(self.params.clone()));
        request.check_mode = self.check_mode;
        Ok(request)
    }

    /// Run against `target`, expecting it to resolve to exactly one
    /// host. Honors the orchestrator's `fail_fast` setting.
    pub async fn run(self) -> Result<ModuleResult> {
        let request = self.build_request()?;
        self.orchestrator.execute(&self.target, request).await
    }

    /// Run against every host `target` resolves to. Never honors
    /// `fail_fast` — inspect `.failed` on each returned result.
    pub async fn run_on_all(self) -> Result<Vec<ModuleResult>> {
        let request = self.build_request()?;
        self.orchestrator.run_on(&self.target, request).await
    }
}
