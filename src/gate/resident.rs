//! Resident gate dispatch loop (§4.5).
//!
//! Transport-agnostic implementation of the gate side of the wire
//! protocol: it drives the request/reply loop over any
//! `AsyncRead + AsyncWrite` pair, so the same [`Dispatcher`] that serves a
//! real SSH session is exercised in tests over an in-memory
//! [`tokio::io::duplex`] pipe. This is distinct from `gate::builder`,
//! which assembles the `.pyz`-style archive staged to the remote host;
//! the dispatcher here is the logic that archive's `__main__.py` would
//! run, reimplemented directly in this crate's own idiom instead of
//! shelling out to a Python interpreter for every invocation.
//!
//! Grounded on `examples/original_source/src/ftl2/message.py` (frame
//! shapes) and `examples/original_source/src/ftl2/runners.py` (how the
//! driver side sequences `Hello`/`Module`/`Shutdown`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{read_message, write_message, MessageType};

/// A module baked into the gate at build time that runs to completion and
/// returns a single JSON result, the moral equivalent of a non-async
/// ansible-style module's parsed stdout.
pub trait SyncModule: Send + Sync {
    /// Execute with the given arguments and check-mode flag.
    fn run(&self, args: &Value, check_mode: bool) -> Result<Value>;
}

/// A baked-in fast-path module: runs in-process with no subprocess
/// round trip and returns its result directly.
#[async_trait::async_trait]
pub trait FastPathModule: Send + Sync {
    /// Execute with the given arguments.
    async fn run(&self, args: &Value) -> Result<Value>;
}

/// The set of modules a gate was built with, keyed by bare module name.
#[derive(Default)]
pub struct ModuleTable {
    sync: HashMap<String, Box<dyn SyncModule>>,
    fast_path: HashMap<String, Box<dyn FastPathModule>>,
}

impl ModuleTable {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a baked-in synchronous module.
    pub fn register_sync(&mut self, name: impl Into<String>, module: Box<dyn SyncModule>) {
        self.sync.insert(name.into(), module);
    }

    /// Register a baked-in fast-path module.
    pub fn register_fast_path(&mut self, name: impl Into<String>, module: Box<dyn FastPathModule>) {
        self.fast_path.insert(name.into(), module);
    }

    /// Look up a baked-in synchronous module by name.
    #[must_use]
    pub fn sync_module(&self, name: &str) -> Option<&dyn SyncModule> {
        self.sync.get(name).map(|m| m.as_ref())
    }

    /// Look up a baked-in fast-path module by name.
    #[must_use]
    pub fn fast_path_module(&self, name: &str) -> Option<&dyn FastPathModule> {
        self.fast_path.get(name).map(|m| m.as_ref())
    }

    /// `(name, kind)` pairs for every baked-in module, sorted by name.
    #[must_use]
    pub fn listing(&self) -> Vec<(String, &'static str)> {
        let mut out: Vec<(String, &'static str)> = self
            .sync
            .keys()
            .map(|n| (n.clone(), "module"))
            .chain(self.fast_path.keys().map(|n| (n.clone(), "ftl_module")))
            .collect();
        out.sort();
        out
    }
}

/// Immutable identity a gate reports in its `Info` reply.
#[derive(Debug, Clone)]
pub struct GateIdentity {
    /// Content hash of the gate build, per [`crate::gate::builder::GateBuildConfig::compute_hash`].
    pub gate_hash: String,
    /// Interpreter version string reported to the driver (not necessarily
    /// a real Python version; this crate has no interpreter of its own).
    pub interpreter_version: String,
}

/// Drives the gate-side wire protocol loop over a single connection.
pub struct Dispatcher {
    identity: GateIdentity,
    modules: ModuleTable,
    fallback_interpreter: String,
    started_at: Instant,
}

#[derive(Deserialize)]
struct ModuleRequest {
    module_name: String,
    #[serde(default)]
    module_args: Value,
    #[serde(default)]
    module: Option<String>,
    #[serde(default)]
    check_mode: bool,
}

#[derive(Deserialize)]
struct FtlModuleRequest {
    module_name: String,
    #[serde(default)]
    module_args: Value,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
struct PathRequest {
    path: String,
}

impl Dispatcher {
    /// Build a dispatcher over `modules`, reporting `identity` on `Info`.
    /// `fallback_interpreter` is the interpreter invoked for modules sent
    /// as an on-demand bundle or inline source rather than baked in.
    #[must_use]
    pub fn new(identity: GateIdentity, modules: ModuleTable, fallback_interpreter: impl Into<String>) -> Self {
        Self {
            identity,
            modules,
            fallback_interpreter: fallback_interpreter.into(),
            started_at: Instant::now(),
        }
    }

    /// Run the dispatch loop to completion: until the peer closes the
    /// connection, sends `Shutdown`, or a protocol error occurs.
    pub async fn run<S>(self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::unbounded_channel::<(MessageType, Value)>();

        let writer_task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some((message_type, data)) = rx.recv().await {
                if let Err(e) = write_message(&mut writer, message_type, &data).await {
                    warn!(error = %e, "gate writer task stopped");
                    break;
                }
            }
        });

        let mut watchers: HashMap<PathBuf, RecommendedWatcher> = HashMap::new();

        loop {
            let frame = match read_message(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("peer closed gate connection");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "protocol error on gate connection");
                    drop(tx);
                    let _ = writer_task.await;
                    return Err(e);
                }
            };

            let message_type = frame.message_type;
            if let Err(e) = self
                .handle_frame(message_type, frame.data, &tx, &mut watchers)
                .await
            {
                // The error was not already converted into a GateSystemError
                // reply inside handle_frame, so this is a bug in the
                // dispatcher itself rather than a module failure; surface it.
                drop(tx);
                let _ = writer_task.await;
                return Err(e);
            }

            if message_type == MessageType::Shutdown {
                break;
            }
        }

        watchers.clear();
        drop(tx);
        let _ = writer_task.await;
        Ok(())
    }

    async fn handle_frame(
        &self,
        message_type: MessageType,
        data: Value,
        tx: &mpsc::UnboundedSender<(MessageType, Value)>,
        watchers: &mut HashMap<PathBuf, RecommendedWatcher>,
    ) -> Result<()> {
        let outcome = match message_type {
            MessageType::Hello => {
                let _ = tx.send((MessageType::Hello, json!({})));
                Ok(())
            }
            MessageType::Info => {
                let _ = tx.send((
                    MessageType::InfoResult,
                    json!({
                        "interpreter_version": self.identity.interpreter_version,
                        "gate_hash": self.identity.gate_hash,
                        "uptime_seconds": self.started_at.elapsed().as_secs_f64(),
                    }),
                ));
                Ok(())
            }
            MessageType::ListModules => {
                let modules: Vec<Value> = self
                    .modules
                    .listing()
                    .into_iter()
                    .map(|(name, kind)| json!({"name": name, "type": kind}))
                    .collect();
                let _ = tx.send((MessageType::ListModulesResult, json!({"modules": modules})));
                Ok(())
            }
            MessageType::Module => self.handle_module(data, tx).await,
            MessageType::FtlModule => self.handle_ftl_module(data, tx).await,
            MessageType::Watch => {
                self.handle_watch(data, tx, watchers);
                Ok(())
            }
            MessageType::Unwatch => {
                if let Ok(req) = serde_json::from_value::<PathRequest>(data) {
                    watchers.remove(&PathBuf::from(req.path));
                }
                Ok(())
            }
            MessageType::Shutdown => {
                watchers.clear();
                let _ = tx.send((MessageType::Shutdown, json!({})));
                Ok(())
            }
            other => {
                let _ = tx.send((
                    MessageType::Error,
                    json!({"message": format!("unhandled message type: {}", other.as_str())}),
                ));
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(error = %e, "unhandled exception in gate dispatch");
            let _ = tx.send((
                MessageType::GateSystemError,
                json!({"message": e.to_string(), "traceback": Value::Null}),
            ));
        }
        Ok(())
    }

    async fn handle_module(
        &self,
        data: Value,
        tx: &mpsc::UnboundedSender<(MessageType, Value)>,
    ) -> Result<()> {
        let req: ModuleRequest = serde_json::from_value(data)?;

        if let Some(module) = self.modules.sync.get(&req.module_name) {
            let (stdout, rc) = match module.run(&req.module_args, req.check_mode) {
                Ok(value) => (serde_json::to_string(&value)?, 0),
                Err(e) => (json!({"failed": true, "msg": e.to_string()}).to_string(), 1),
            };
            let _ = tx.send((
                MessageType::ModuleResult,
                json!({"module_name": req.module_name, "stdout": stdout, "stderr": "", "rc": rc}),
            ));
            return Ok(());
        }

        let Some(bundle_b64) = req.module else {
            let _ = tx.send((
                MessageType::ModuleNotFound,
                json!({"module_name": req.module_name}),
            ));
            return Ok(());
        };

        let bundle_bytes = BASE64
            .decode(bundle_b64.as_bytes())
            .map_err(|e| crate::error::Error::ModuleArgs {
                module: req.module_name.clone(),
                message: format!("invalid base64 bundle payload: {e}"),
            })?;

        let mut payload = req.module_args.clone();
        if req.check_mode {
            if let Value::Object(map) = &mut payload {
                map.insert("_ansible_check_mode".to_string(), Value::Bool(true));
            }
        }

        let (rc, stdout, stderr) =
            run_archive(&self.fallback_interpreter, &bundle_bytes, "pyz", &payload).await?;

        let _ = tx.send((
            MessageType::ModuleResult,
            json!({"module_name": req.module_name, "stdout": stdout, "stderr": stderr, "rc": rc}),
        ));
        Ok(())
    }

    async fn handle_ftl_module(
        &self,
        data: Value,
        tx: &mpsc::UnboundedSender<(MessageType, Value)>,
    ) -> Result<()> {
        let req: FtlModuleRequest = serde_json::from_value(data)?;

        if let Some(module) = self.modules.fast_path.get(&req.module_name) {
            let result = module.run(&req.module_args).await?;
            let _ = tx.send((MessageType::FtlModuleResult, result));
            return Ok(());
        }

        let Some(source) = req.source else {
            let _ = tx.send((
                MessageType::ModuleNotFound,
                json!({"module_name": req.module_name}),
            ));
            return Ok(());
        };

        let (rc, stdout, stderr) = run_archive(
            &self.fallback_interpreter,
            source.as_bytes(),
            "py",
            &req.module_args,
        )
        .await?;

        if rc != 0 {
            let _ = tx.send((
                MessageType::FtlModuleResult,
                json!({"failed": true, "msg": stderr, "rc": rc}),
            ));
            return Ok(());
        }

        let result: Value = serde_json::from_str(&stdout).unwrap_or_else(|_| json!({"stdout": stdout}));
        let _ = tx.send((MessageType::FtlModuleResult, result));
        Ok(())
    }

    fn handle_watch(
        &self,
        data: Value,
        tx: &mpsc::UnboundedSender<(MessageType, Value)>,
        watchers: &mut HashMap<PathBuf, RecommendedWatcher>,
    ) {
        let Ok(req) = serde_json::from_value::<PathRequest>(data) else {
            return;
        };
        let path = PathBuf::from(&req.path);
        if watchers.contains_key(&path) {
            return;
        }

        let tx = tx.clone();
        let watch_path = path.clone();
        let handler = move |res: notify::Result<Event>| {
            let Ok(event) = res else { return };
            for p in &event.paths {
                let message_type = if p.is_dir() {
                    MessageType::DirectoryChanged
                } else {
                    MessageType::FileChanged
                };
                let _ = tx.send((message_type, json!({"path": p.to_string_lossy()})));
            }
        };

        match RecommendedWatcher::new(handler, notify::Config::default()) {
            Ok(mut watcher) => {
                if let Err(e) = watcher.watch(&watch_path, RecursiveMode::Recursive) {
                    warn!(path = %watch_path.display(), error = %e, "failed to install filesystem watcher");
                    return;
                }
                info!(path = %watch_path.display(), "installed filesystem watcher");
                watchers.insert(path, watcher);
            }
            Err(e) => warn!(error = %e, "failed to create filesystem watcher"),
        }
    }
}

/// Write `payload` to a temp file with the given extension, execute it
/// with `interpreter`, feeding `args` as `{"ANSIBLE_MODULE_ARGS": args}` on
/// stdin, and return `(exit_code, stdout, stderr)`. This is the
/// module-not-found recovery path (§8 scenario F): a baked-in module
/// registry miss falls back to running whatever bundle or source the
/// driver sent, the same way `bundle::MAIN_TEMPLATE` expects to be run.
async fn run_archive(
    interpreter: &str,
    payload: &[u8],
    extension: &str,
    args: &Value,
) -> Result<(i32, String, String)> {
    let file = tempfile::Builder::new()
        .suffix(&format!(".{extension}"))
        .tempfile()?;
    std::fs::write(file.path(), payload)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700))?;
    }

    let stdin_payload = serde_json::to_vec(&json!({"ANSIBLE_MODULE_ARGS": args}))?;

    let mut child = Command::new(interpreter)
        .arg(file.path())
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    {
        use tokio::io::AsyncWriteExt;
        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(&stdin_payload).await?;
    }

    let output = child.wait_with_output().await?;
    let rc = output.status.code().unwrap_or(-1);
    Ok((
        rc,
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    struct Ping;
    impl SyncModule for Ping {
        fn run(&self, _args: &Value, _check_mode: bool) -> Result<Value> {
            Ok(json!({"ping": "pong"}))
        }
    }

    struct AlwaysFails;
    impl SyncModule for AlwaysFails {
        fn run(&self, _args: &Value, _check_mode: bool) -> Result<Value> {
            Err(crate::error::Error::ModuleExecution {
                module: "boom".to_string(),
                host: "local".to_string(),
                message: "deliberate failure".to_string(),
            })
        }
    }

    fn test_identity() -> GateIdentity {
        GateIdentity {
            gate_hash: "testhash".to_string(),
            interpreter_version: "3.11.0".to_string(),
        }
    }

    #[tokio::test]
    async fn hello_handshake_round_trips() {
        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), ModuleTable::new(), "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(&mut client, MessageType::Hello, &json!({})).await.unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Hello);

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Shutdown);

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn info_reports_gate_identity() {
        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), ModuleTable::new(), "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(&mut client, MessageType::Info, &json!({})).await.unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::InfoResult);
        assert_eq!(reply.data["gate_hash"], "testhash");

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        read_message(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn list_modules_reports_baked_in_modules() {
        let mut modules = ModuleTable::new();
        modules.register_sync("ping", Box::new(Ping));

        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), modules, "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(&mut client, MessageType::ListModules, &json!({})).await.unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::ListModulesResult);
        assert_eq!(reply.data["modules"][0]["name"], "ping");

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        read_message(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn baked_in_module_executes_and_replies() {
        let mut modules = ModuleTable::new();
        modules.register_sync("ping", Box::new(Ping));

        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), modules, "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(
            &mut client,
            MessageType::Module,
            &json!({"module_name": "ping", "module_args": {}}),
        )
        .await
        .unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::ModuleResult);
        assert_eq!(reply.data["rc"], 0);
        let stdout: Value = serde_json::from_str(reply.data["stdout"].as_str().unwrap()).unwrap();
        assert_eq!(stdout["ping"], "pong");

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        read_message(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failing_baked_in_module_reports_failed_envelope() {
        let mut modules = ModuleTable::new();
        modules.register_sync("boom", Box::new(AlwaysFails));

        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), modules, "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(
            &mut client,
            MessageType::Module,
            &json!({"module_name": "boom", "module_args": {}}),
        )
        .await
        .unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.data["rc"], 1);
        let stdout: Value = serde_json::from_str(reply.data["stdout"].as_str().unwrap()).unwrap();
        assert_eq!(stdout["failed"], true);

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        read_message(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn module_not_found_when_not_baked_in_and_no_bundle() {
        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), ModuleTable::new(), "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(
            &mut client,
            MessageType::Module,
            &json!({"module_name": "file", "module_args": {}}),
        )
        .await
        .unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::ModuleNotFound);
        assert_eq!(reply.data["module_name"], "file");

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        read_message(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ftl_module_not_found_without_baked_in_or_source() {
        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), ModuleTable::new(), "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(
            &mut client,
            MessageType::FtlModule,
            &json!({"module_name": "http_get", "module_args": {}}),
        )
        .await
        .unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::ModuleNotFound);

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        read_message(&mut client).await.unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_message_type_gets_error_reply() {
        let (mut client, gate_side) = duplex(8192);
        let dispatcher = Dispatcher::new(test_identity(), ModuleTable::new(), "python3");
        let handle = tokio::spawn(dispatcher.run(gate_side));

        write_message(&mut client, MessageType::Watch, &json!({"path": "/nonexistent/path/for/test"}))
            .await
            .unwrap();

        write_message(&mut client, MessageType::Shutdown, &json!({})).await.unwrap();
        let reply = read_message(&mut client).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Shutdown);

        handle.await.unwrap().unwrap();
    }
}
