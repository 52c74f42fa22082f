//! Orchestrator (§4.8): resolves targets, injects secrets, enforces
//! policy, dispatches to the local registry or a remote gate, records the
//! audit journal, and fans async events out to registered handlers.
//!
//! Grounded on `automation/context.py`'s `AutomationContext`: `execute`
//! runs the eight-step pipeline for one host and honors `fail_fast`;
//! `run_on` fans the same pipeline out across every host a target
//! resolves to and never honors `fail_fast` (a fan-out that aborted on
//! the first straggler would defeat the point of running in parallel).

pub mod audit;
pub mod events;
pub mod invoker;
pub mod policy;
pub mod state;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bundle::build_bundle;
use crate::connection::{local::LocalConnection, Transport};
use crate::error::{Error, Result};
use crate::gate::{GateBuildConfig, GateBuilder, GateConnection, GateLifecycle};
use crate::inventory::{HostSpec, Inventory, Target};
use crate::modules::{ModuleKind, ModuleRegistry};
use crate::protocol::{Frame, MessageType};
use crate::secrets::SecretResolver;

pub use audit::{AuditAction, AuditRecorder, AuditReplayer};
pub use events::EventRouter;
pub use invoker::ModuleInvoker;
pub use policy::PolicyEngine;
pub use state::StateStore;

/// A module invocation request, independent of which host(s) it runs on.
#[derive(Debug, Clone)]
pub struct ModuleRequest {
    pub module: String,
    pub params: Value,
    /// Overrides the orchestrator-wide check-mode setting when set.
    pub check_mode: Option<bool>,
}

impl ModuleRequest {
    #[must_use]
    pub fn new(module: impl Into<String>, params: Value) -> Self {
        Self {
            module: module.into(),
            params,
            check_mode: None,
        }
    }
}

/// The outcome of running one [`ModuleRequest`] on one host.
#[derive(Debug, Clone)]
pub struct ModuleResult {
    pub host: String,
    pub module: String,
    pub changed: bool,
    pub failed: bool,
    pub msg: Option<String>,
    pub data: Value,
    pub duration_secs: f64,
}

impl ModuleResult {
    fn from_value(host: &str, module: &str, value: Value, duration_secs: f64) -> Self {
        let failed = value.get("failed").and_then(Value::as_bool).unwrap_or(false);
        let changed = value.get("changed").and_then(Value::as_bool).unwrap_or(false);
        let msg = value.get("msg").and_then(Value::as_str).map(str::to_string);
        Self {
            host: host.to_string(),
            module: module.to_string(),
            changed,
            failed,
            msg,
            data: value,
            duration_secs,
        }
    }

    fn error(host: &str, module: &str, message: String) -> Self {
        Self {
            host: host.to_string(),
            module: module.to_string(),
            changed: false,
            failed: true,
            msg: Some(message.clone()),
            data: json!({"failed": true, "msg": message}),
            duration_secs: 0.0,
        }
    }
}

/// Resolves a host to the transport that reaches it. The default (see
/// [`default_transport_provider`]) only knows how to reach `local` hosts;
/// callers that need SSH plug in their own, since picking credentials and
/// a host-key policy is a deployment concern this crate doesn't guess at.
pub type TransportProvider = Arc<dyn Fn(&HostSpec) -> Result<Arc<dyn Transport>> + Send + Sync>;

#[must_use]
pub fn default_transport_provider() -> TransportProvider {
    Arc::new(|host: &HostSpec| -> Result<Arc<dyn Transport>> {
        if host.connection.is_local() {
            Ok(Arc::new(LocalConnection::new()))
        } else {
            Err(Error::ConnectionFailed {
                host: host.name.clone(),
                message: "no transport provider configured for non-local hosts".to_string(),
            })
        }
    })
}

/// Dispatcher source embedded in the gate's content hash (§4.4): a
/// change to the resident dispatch logic must invalidate every cached
/// gate archive.
fn dispatcher_fingerprint() -> Vec<u8> {
    include_bytes!("../gate/resident.rs").to_vec()
}

/// Construction parameters for [`Orchestrator::new`].
pub struct OrchestratorConfig {
    pub inventory: Inventory,
    pub modules: ModuleRegistry,
    pub secrets: SecretResolver,
    pub policy: PolicyEngine,
    pub state_file: Option<PathBuf>,
    pub audit_record_file: Option<PathBuf>,
    pub audit_replay_file: Option<PathBuf>,
    pub gate_cache_dir: PathBuf,
    pub remote_staging_dir: String,
    pub remote_interpreter: String,
    pub min_interpreter_major: u32,
    pub transport_provider: TransportProvider,
    pub check_mode: bool,
    pub fail_fast: bool,
    pub environment: String,
    /// Local file paths for non-built-in modules the gate may need to
    /// bundle and ship on demand after a `ModuleNotFound` reply.
    pub module_sources: HashMap<String, PathBuf>,
}

impl OrchestratorConfig {
    #[must_use]
    pub fn new(inventory: Inventory, modules: ModuleRegistry, secrets: SecretResolver) -> Self {
        Self {
            inventory,
            modules,
            secrets,
            policy: PolicyEngine::empty(),
            state_file: None,
            audit_record_file: None,
            audit_replay_file: None,
            gate_cache_dir: std::env::temp_dir().join("ftlgate"),
            remote_staging_dir: "/tmp".to_string(),
            remote_interpreter: "python3".to_string(),
            min_interpreter_major: 3,
            transport_provider: default_transport_provider(),
            check_mode: false,
            fail_fast: false,
            environment: "default".to_string(),
            module_sources: HashMap::new(),
        }
    }
}

/// A lifecycle hook invoked around module execution (`module_start`,
/// `module_complete`), distinct from [`EventRouter`]'s wire-level
/// filesystem events.
pub type LifecycleHook = Arc<dyn Fn(&str, &str, &Value) + Send + Sync>;

/// Resolves targets, injects secrets, enforces policy, dispatches to the
/// local registry or a remote gate, and records the audit journal.
pub struct Orchestrator {
    inventory: Mutex<Inventory>,
    modules: ModuleRegistry,
    secrets: SecretResolver,
    policy: PolicyEngine,
    state: StateStore,
    recorder: AuditRecorder,
    replayer: Option<AuditReplayer>,
    audit_record_file: Option<PathBuf>,
    gate_lifecycle: GateLifecycle,
    gate_build_config: GateBuildConfig,
    transport_provider: TransportProvider,
    events_tx: tokio::sync::mpsc::UnboundedSender<(String, MessageType, Value)>,
    module_sources: HashMap<String, PathBuf>,
    check_mode: bool,
    fail_fast: bool,
    environment: String,
    results: Mutex<Vec<ModuleResult>>,
    errors: Mutex<Vec<String>>,
    lifecycle_hook: Option<LifecycleHook>,
}

impl Orchestrator {
    /// Build an orchestrator and the [`EventRouter`] that drains the
    /// events its gate connections forward.
    pub fn new(config: OrchestratorConfig) -> Result<(Self, EventRouter)> {
        let state = StateStore::new(config.state_file)?;
        let replayer = config
            .audit_replay_file
            .as_deref()
            .map(AuditReplayer::load)
            .transpose()?;
        let gate_builder = GateBuilder::new(config.gate_cache_dir)?;
        let gate_lifecycle = GateLifecycle::new(gate_builder, config.remote_staging_dir, config.min_interpreter_major);
        let gate_build_config = GateBuildConfig {
            modules: Vec::new(),
            module_dirs: Vec::new(),
            dependencies: Vec::new(),
            interpreter: config.remote_interpreter,
            dispatcher_source: dispatcher_fingerprint(),
            collection_paths: Vec::new(),
            builtin_modules_root: None,
            core_module_utils_root: None,
        };
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        let mut secrets = config.secrets;
        secrets.load();

        let mut inventory = config.inventory;
        for (name, value) in state.entries_with_prefix_sync("dynamic_host:") {
            match serde_json::from_value::<HostSpec>(value) {
                Ok(host) => inventory.add_host(host),
                Err(e) => warn!(host = %name, error = %e, "discarding unreadable persisted host"),
            }
        }

        let orchestrator = Self {
            inventory: Mutex::new(inventory),
            modules: config.modules,
            secrets,
            policy: config.policy,
            state,
            recorder: AuditRecorder::new(),
            replayer,
            audit_record_file: config.audit_record_file,
            gate_lifecycle,
            gate_build_config,
            transport_provider: config.transport_provider,
            events_tx,
            module_sources: config.module_sources,
            check_mode: config.check_mode,
            fail_fast: config.fail_fast,
            environment: config.environment,
            results: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            lifecycle_hook: None,
        };
        Ok((orchestrator, EventRouter::new(events_rx)))
    }

    /// Register a callback fired with `("module_start" | "module_complete", host, data)`.
    pub fn set_lifecycle_hook(&mut self, hook: LifecycleHook) {
        self.lifecycle_hook = Some(hook);
    }

    /// Insert or replace a host at runtime (§4.8's dynamic `add_host`),
    /// persisting it so [`Orchestrator::new`] can replay it into the
    /// inventory on the next invocation (§4.12).
    pub async fn add_host(&self, host: HostSpec) -> Result<()> {
        let name = host.name.clone();
        let serialized = serde_json::to_value(&host).map_err(|e| Error::Persistence {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        self.state.add(format!("dynamic_host:{name}"), serialized).await?;
        self.inventory.lock().await.add_host(host);
        Ok(())
    }

    /// A typed entry point for running modules against `target`: see
    /// [`ModuleInvoker`].
    #[must_use]
    pub fn target<'a>(&'a self, target: impl Into<String>) -> ModuleInvoker<'a> {
        ModuleInvoker::new(self, target.into())
    }

    /// Groups `host` belongs to, for event-router group-membership fan-out.
    pub async fn groups_containing(&self, host: &str) -> Vec<String> {
        let inventory = self.inventory.lock().await;
        inventory
            .groups_containing(host)
            .map(|g| g.name.clone())
            .collect()
    }

    /// Run `request` against the single host `target` names. Honors
    /// `fail_fast`: a failed invocation becomes an `Err` rather than
    /// a returned failed [`ModuleResult`].
    pub async fn execute(&self, target: &str, request: ModuleRequest) -> Result<ModuleResult> {
        let host = self.resolve_single_host(target).await?;
        let result = self.execute_on_host(&host, &request).await?;
        if result.failed && self.fail_fast {
            return Err(Error::AutomationFailed(format!(
                "module '{}' failed on '{}': {}",
                result.module,
                result.host,
                result.msg.clone().unwrap_or_default()
            )));
        }
        Ok(result)
    }

    /// Run `request` against every host `target` resolves to (a single
    /// host or every member of a group), concurrently. Never honors
    /// `fail_fast` — callers inspect `.failed` on each result. A
    /// per-host short-circuit (e.g. policy denial) is converted into a
    /// failed result rather than aborting the rest of the fan-out,
    /// mirroring the gather/return_exceptions pattern this pipeline is
    /// modeled on.
    pub async fn run_on(&self, target: &str, request: ModuleRequest) -> Result<Vec<ModuleResult>> {
        let hosts = self.resolve_hosts(target).await?;
        let futures = hosts.into_iter().map(|host| async move {
            match self.execute_on_host(&host, &request).await {
                Ok(result) => result,
                Err(e) => {
                    let result = ModuleResult::error(&host.name, &request.module, e.to_string());
                    self.record_denied(result.clone()).await;
                    result
                }
            }
        });
        Ok(join_all(futures).await)
    }

    async fn resolve_single_host(&self, target: &str) -> Result<HostSpec> {
        match self.resolve_hosts(target).await?.as_slice() {
            [host] => Ok(host.clone()),
            _ => Err(Error::UnknownTarget(format!("'{target}' must resolve to exactly one host"))),
        }
    }

    async fn resolve_hosts(&self, target: &str) -> Result<Vec<HostSpec>> {
        let inventory = self.inventory.lock().await;
        match inventory.resolve(target)? {
            Target::Host(host) => Ok(vec![host.clone()]),
            Target::Group(hosts) => Ok(hosts.into_iter().cloned().collect()),
        }
    }

    /// The eight-step pipeline of §4.8, run for exactly one host. A
    /// policy denial (step 3) short-circuits with `Err` before anything
    /// is recorded or executed, matching "raise a policy-denied error
    /// and do not execute" — no `ModuleResult` is appended and no
    /// transport activity happens. Every other failure mode becomes a
    /// failed `Ok(ModuleResult)` so `run_on`'s fan-out can collect a
    /// full picture even when some hosts fail.
    async fn execute_on_host(&self, host: &HostSpec, request: &ModuleRequest) -> Result<ModuleResult> {
        let start = std::time::Instant::now();
        let check_mode = request.check_mode.unwrap_or(self.check_mode);

        if let Some(action) = self.replayer.as_ref() {
            if let Some(replayed) = action.try_replay(&request.module, &host.name).await {
                debug!(host = %host.name, module = %request.module, "replayed from audit journal");
                let result = ModuleResult::from_value(
                    &host.name,
                    &request.module,
                    replayed.result.clone().unwrap_or(Value::Null),
                    replayed.duration_secs,
                );
                self.finish_result(host, request, result.clone(), start.elapsed().as_secs_f64(), true)
                    .await;
                return Ok(result);
            }
        }

        let mut params = match request.params.clone() {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("_raw_params".to_string(), other);
                map
            }
        };
        self.secrets.inject(&request.module, &mut params);
        let params = Value::Object(params);

        self.policy.evaluate(&request.module, &params, &host.name, &self.environment)?;

        self.emit_lifecycle("module_start", &host.name, &params);

        let outcome = if host.connection.is_local() {
            self.execute_local(&request.module, &params, check_mode).await
        } else {
            self.execute_remote(host, &request.module, &params, check_mode).await
        };

        let result = match outcome {
            Ok(value) => ModuleResult::from_value(&host.name, &request.module, value, start.elapsed().as_secs_f64()),
            Err(e) => ModuleResult::error(&host.name, &request.module, e.to_string()),
        };

        self.finish_result(host, request, result.clone(), start.elapsed().as_secs_f64(), false)
            .await;
        self.emit_lifecycle("module_complete", &host.name, &result.data);
        Ok(result)
    }

    async fn finish_result(
        &self,
        host: &HostSpec,
        request: &ModuleRequest,
        result: ModuleResult,
        duration_secs: f64,
        replayed: bool,
    ) {
        let redacted = audit::redact_params(&request.params);
        self.recorder
            .record(AuditAction {
                module: request.module.clone(),
                host: host.name.clone(),
                params: redacted,
                success: !result.failed,
                result: if result.failed { None } else { Some(result.data.clone()) },
                error: if result.failed { result.msg.clone() } else { None },
                started: chrono::Utc::now().to_rfc3339(),
                duration_secs,
                replayed,
            })
            .await;

        if result.failed {
            if let Some(msg) = &result.msg {
                self.recorder.record_error(msg.clone()).await;
                self.errors.lock().await.push(msg.clone());
            }
        }
        self.results.lock().await.push(result);
    }

    /// Records a per-host fan-out short-circuit (e.g. policy denial)
    /// into `results`/`errors` without writing an audit action — the
    /// invocation never executed, so there is nothing to replay.
    async fn record_denied(&self, result: ModuleResult) {
        if let Some(msg) = &result.msg {
            self.errors.lock().await.push(msg.clone());
        }
        self.results.lock().await.push(result);
    }

    fn emit_lifecycle(&self, event: &str, host: &str, data: &Value) {
        if let Some(hook) = &self.lifecycle_hook {
            hook(event, host, data);
        }
    }

    async fn execute_local(&self, module: &str, params: &Value, check_mode: bool) -> Result<Value> {
        if let Some(result) = self.modules.run_fast_path(module, params).await {
            return result;
        }
        match self.modules.run_sync(module, params, check_mode) {
            Some(result) => result,
            None => Err(Error::ModuleNotFound(module.to_string())),
        }
    }

    async fn execute_remote(&self, host: &HostSpec, module: &str, params: &Value, check_mode: bool) -> Result<Value> {
        let transport = (self.transport_provider)(host)?;
        let conn = self
            .gate_lifecycle
            .get_or_create(&host.name, transport, &self.gate_build_config, self.events_tx.clone())
            .await?;
        let kind = self.modules.kind_of(module);
        self.execute_remote_via_gate(&conn, module, params, check_mode, kind).await
    }

    /// Sends the appropriate `Module` or `FTLModule` frame for `module`'s
    /// kind (§4.8 step 5) rather than always trying both: a fast-path
    /// module gets `FTLModule` only, everything else (including modules
    /// this driver has no local registration for, the common case for a
    /// plain subprocess-style module) gets `Module`. Falls back to
    /// shipping an ad hoc bundle only after the gate reports
    /// `ModuleNotFound` for that single frame, matching the scenario F
    /// wire trace exactly (no spurious extra frame).
    async fn execute_remote_via_gate(
        &self,
        conn: &GateConnection,
        module: &str,
        params: &Value,
        check_mode: bool,
        kind: Option<ModuleKind>,
    ) -> Result<Value> {
        if kind == Some(ModuleKind::FastPath) {
            let ftl_reply = conn
                .send_request(MessageType::FtlModule, json!({"module_name": module, "module_args": params}))
                .await?;
            if let GateReply::Result(value) = interpret_reply(conn.host(), ftl_reply)? {
                return Ok(value);
            }
        }

        let module_reply = conn
            .send_request(
                MessageType::Module,
                json!({"module_name": module, "module_args": params, "check_mode": check_mode}),
            )
            .await?;
        if let GateReply::Result(value) = interpret_reply(conn.host(), module_reply)? {
            return Ok(value);
        }

        let Some(source_path) = self.module_sources.get(module) else {
            return Err(Error::ModuleNotFound(module.to_string()));
        };
        warn!(host = conn.host(), module, "module not baked into gate, shipping ad hoc bundle");
        let bundle = build_bundle(source_path, None, module, None)?;
        let encoded = BASE64.encode(&bundle.data);
        let retry_reply = conn
            .send_request(
                MessageType::Module,
                json!({
                    "module_name": module,
                    "module_args": params,
                    "check_mode": check_mode,
                    "module": encoded,
                }),
            )
            .await?;
        match interpret_reply(conn.host(), retry_reply)? {
            GateReply::Result(value) => Ok(value),
            GateReply::NotFound => Err(Error::ModuleNotFound(module.to_string())),
        }
    }

    #[must_use]
    pub async fn results(&self) -> Vec<ModuleResult> {
        self.results.lock().await.clone()
    }

    #[must_use]
    pub async fn failed(&self) -> bool {
        self.results.lock().await.iter().any(|r| r.failed)
    }

    #[must_use]
    pub async fn errors(&self) -> Vec<String> {
        self.errors.lock().await.clone()
    }

    /// Write the accumulated audit journal, if an output path was
    /// configured. Call once at the end of a run.
    pub async fn write_audit_journal(&self) -> Result<()> {
        let Some(path) = &self.audit_record_file else {
            return Ok(());
        };
        let check_mode = self.check_mode;
        let success = !self.failed().await;
        self.recorder.write(path, check_mode, success).await
    }
}

enum GateReply {
    Result(Value),
    NotFound,
}

fn interpret_reply(host: &str, frame: Frame) -> Result<GateReply> {
    match frame.message_type {
        MessageType::FtlModuleResult => Ok(GateReply::Result(frame.data)),
        MessageType::ModuleResult => Ok(GateReply::Result(parse_module_result(&frame.data))),
        MessageType::ModuleNotFound => Ok(GateReply::NotFound),
        MessageType::GateSystemError => Err(Error::GateSystemError {
            host: host.to_string(),
            message: frame
                .data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown gate error")
                .to_string(),
            traceback: frame.data.get("traceback").and_then(Value::as_str).map(str::to_string),
        }),
        other => Err(Error::Protocol(format!("unexpected reply from gate: {}", other.as_str()))),
    }
}

/// Parse a `ModuleResult` frame's `stdout` (a JSON-encoded string per
/// §6) into the module's result object, falling back to a synthesized
/// failure if it didn't parse, and marking failure if `stderr` carries a
/// traceback even when `stdout` looked clean.
fn parse_module_result(data: &Value) -> Value {
    let stdout = data.get("stdout").and_then(Value::as_str).unwrap_or("");
    let stderr = data.get("stderr").and_then(Value::as_str).unwrap_or("");
    let rc = data.get("rc").and_then(Value::as_i64).unwrap_or(0);

    let mut parsed: Value = serde_json::from_str(stdout).unwrap_or_else(|_| {
        json!({
            "failed": true,
            "msg": if stdout.is_empty() { stderr.to_string() } else { stdout.to_string() },
        })
    });

    if let Some(obj) = parsed.as_object_mut() {
        if stderr.contains("Traceback (most recent call last)") {
            obj.insert("failed".to_string(), Value::Bool(true));
            obj.entry("msg").or_insert_with(|| Value::String(stderr.to_string()));
        }
        if rc != 0 {
            obj.entry("failed").or_insert(Value::Bool(true));
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::HostSpec;
    use crate::modules::ModuleRegistry;
    use crate::secrets::SecretResolver;

    fn local_host(name: &str) -> HostSpec {
        let mut host = HostSpec::new(name);
        host.connection = crate::inventory::ConnectionKind::Local;
        host
    }

    fn test_inventory() -> Inventory {
        let mut inventory = Inventory::empty();
        inventory.add_host(local_host("local1"));
        inventory
    }

    fn orchestrator_with(inventory: Inventory) -> (Orchestrator, EventRouter) {
        let config = OrchestratorConfig::new(
            inventory,
            ModuleRegistry::with_builtins(),
            SecretResolver::new(HashMap::new()).unwrap(),
        );
        Orchestrator::new(config).unwrap()
    }

    #[tokio::test]
    async fn execute_runs_ping_on_the_local_host() {
        let (orchestrator, _router) = orchestrator_with(test_inventory());
        let result = orchestrator
            .execute("local1", ModuleRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert!(!result.failed);
        assert_eq!(result.data["ping"], "pong");
    }

    #[tokio::test]
    async fn execute_fails_fast_when_configured() {
        let mut config = OrchestratorConfig::new(
            test_inventory(),
            ModuleRegistry::with_builtins(),
            SecretResolver::new(HashMap::new()).unwrap(),
        );
        config.fail_fast = true;
        let (orchestrator, _router) = Orchestrator::new(config).unwrap();

        let err = orchestrator
            .execute("local1", ModuleRequest::new("ping", json!({"data": "crash"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AutomationFailed(_)));
    }

    #[tokio::test]
    async fn run_on_never_raises_even_when_a_host_fails() {
        let (orchestrator, _router) = orchestrator_with(test_inventory());
        let results = orchestrator
            .run_on("local1", ModuleRequest::new("ping", json!({"data": "crash"})))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].failed);
    }

    #[tokio::test]
    async fn unknown_target_is_an_error() {
        let (orchestrator, _router) = orchestrator_with(test_inventory());
        let err = orchestrator
            .execute("nope", ModuleRequest::new("ping", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn policy_denial_short_circuits_execution() {
        let mut config = OrchestratorConfig::new(
            test_inventory(),
            ModuleRegistry::with_builtins(),
            SecretResolver::new(HashMap::new()).unwrap(),
        );
        config.policy = PolicyEngine::from_docs(vec![policy::PolicyRuleDoc {
            id: "deny-ping".to_string(),
            module: Some("ping".to_string()),
            params: HashMap::new(),
            host: None,
            environment: None,
            action: policy::PolicyAction::Deny,
            reason: Some("not today".to_string()),
        }])
        .unwrap();
        let (orchestrator, _router) = Orchestrator::new(config).unwrap();

        let err = orchestrator
            .execute("local1", ModuleRequest::new("ping", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PolicyDenied { .. }));
        assert!(orchestrator.results().await.is_empty());
    }

    #[tokio::test]
    async fn run_on_converts_policy_denial_into_a_failed_result() {
        let mut config = OrchestratorConfig::new(
            test_inventory(),
            ModuleRegistry::with_builtins(),
            SecretResolver::new(HashMap::new()).unwrap(),
        );
        config.policy = PolicyEngine::from_docs(vec![policy::PolicyRuleDoc {
            id: "deny-ping".to_string(),
            module: Some("ping".to_string()),
            params: HashMap::new(),
            host: None,
            environment: None,
            action: policy::PolicyAction::Deny,
            reason: Some("not today".to_string()),
        }])
        .unwrap();
        let (orchestrator, _router) = Orchestrator::new(config).unwrap();

        let results = orchestrator
            .run_on("local1", ModuleRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].failed);
        assert!(results[0].msg.as_ref().unwrap().contains("not today"));
    }

    // Scenario F (module-not-found recovery): the gate's three possible
    // replies to a module request, decoded in isolation from any
    // transport.
    #[test]
    fn interpret_reply_recognizes_not_found() {
        let frame = Frame {
            message_type: MessageType::ModuleNotFound,
            data: json!({"name": "custom_thing"}),
        };
        assert!(matches!(interpret_reply("h1", frame).unwrap(), GateReply::NotFound));
    }

    #[test]
    fn interpret_reply_parses_module_result_stdout_as_json() {
        let frame = Frame {
            message_type: MessageType::ModuleResult,
            data: json!({"stdout": "{\"changed\": true}", "stderr": "", "rc": 0}),
        };
        let GateReply::Result(value) = interpret_reply("h1", frame).unwrap() else {
            panic!("expected a result");
        };
        assert_eq!(value["changed"], true);
    }

    #[test]
    fn interpret_reply_marks_nonzero_rc_as_failed_even_with_clean_stdout() {
        let frame = Frame {
            message_type: MessageType::ModuleResult,
            data: json!({"stdout": "{\"msg\": \"partial\"}", "stderr": "", "rc": 1}),
        };
        let GateReply::Result(value) = interpret_reply("h1", frame).unwrap() else {
            panic!("expected a result");
        };
        assert_eq!(value["failed"], true);
    }

    #[test]
    fn interpret_reply_surfaces_gate_system_errors() {
        let frame = Frame {
            message_type: MessageType::GateSystemError,
            data: json!({"message": "boom", "traceback": "Traceback (most recent call last):\n..."}),
        };
        let err = interpret_reply("h1", frame).unwrap_err();
        assert!(matches!(err, Error::GateSystemError { .. }));
    }

    #[tokio::test]
    async fn add_host_persists_and_replays_across_orchestrator_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("state.json");
        let gate_cache_dir = dir.path().join("gate_cache");

        let mut config = OrchestratorConfig::new(
            Inventory::empty(),
            ModuleRegistry::with_builtins(),
            SecretResolver::new(HashMap::new()).unwrap(),
        );
        config.state_file = Some(state_file.clone());
        config.gate_cache_dir = gate_cache_dir.clone();
        let (orchestrator, _router) = Orchestrator::new(config).unwrap();
        orchestrator.add_host(local_host("added")).await.unwrap();
        drop(orchestrator);

        let mut reloaded_config = OrchestratorConfig::new(
            Inventory::empty(),
            ModuleRegistry::with_builtins(),
            SecretResolver::new(HashMap::new()).unwrap(),
        );
        reloaded_config.state_file = Some(state_file);
        reloaded_config.gate_cache_dir = gate_cache_dir;
        let (reloaded, _router) = Orchestrator::new(reloaded_config).unwrap();

        let result = reloaded
            .execute("added", ModuleRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert!(!result.failed);
    }

    #[tokio::test]
    async fn add_host_makes_the_new_host_resolvable() {
        let (orchestrator, _router) = orchestrator_with(Inventory::empty());
        orchestrator.add_host(local_host("added")).await.unwrap();
        let result = orchestrator
            .execute("added", ModuleRequest::new("ping", json!({})))
            .await
            .unwrap();
        assert!(!result.failed);
    }
}
