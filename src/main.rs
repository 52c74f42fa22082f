//! `ftlgate` - a gate-based distributed automation engine
//!
//! Thin CLI front-end exercising the library: `run` dispatches a module
//! against a target, `build-gate` and `build-bundle` expose the
//! content-addressed packaging steps standalone for inspection/caching
//! warm-up, and `gate-resident` is the process `GateLifecycle` stages and
//! starts on the remote end of a connection.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ftlgate::config::EngineConfig;
use ftlgate::connection::local::LocalConnection;
#[cfg(feature = "russh")]
use ftlgate::connection::russh::RusshConnection;
#[cfg(feature = "russh")]
use ftlgate::connection::AuthConfig;
use ftlgate::connection::Transport;
use ftlgate::error::{Error, Result};
use ftlgate::gate::{Dispatcher, GateBuildConfig, GateBuilder, GateIdentity, ModuleTable};
use ftlgate::inventory::{HostSpec, Inventory};
use ftlgate::modules::{command, file, ping, ModuleRegistry};
use ftlgate::orchestrator::{ModuleRequest, Orchestrator, OrchestratorConfig, PolicyEngine, TransportProvider};
use ftlgate::output::{self, OutputMode};
use ftlgate::secrets::SecretResolver;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "ftlgate", version, about = "Gate-based distributed automation")]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to an `ftlgate.toml` config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a module against an inventory target.
    Run {
        /// Path to the YAML inventory file.
        #[arg(long)]
        inventory: PathBuf,
        /// Host or group name to run against.
        #[arg(long)]
        target: String,
        /// Module name to invoke.
        #[arg(long)]
        module: String,
        /// Module arguments as a JSON object (default `{}`).
        #[arg(long, default_value = "{}")]
        args: String,
        /// Run without making changes.
        #[arg(long)]
        check_mode: bool,
        /// Raise on first failure instead of collecting every host's result.
        #[arg(long)]
        fail_fast: bool,
        /// Environment label for policy predicates.
        #[arg(long, default_value = "default")]
        environment: String,
        /// Path to a policy rule file.
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Write the audit journal here on completion.
        #[arg(long)]
        audit_record: Option<PathBuf>,
        /// Replay from a prior audit journal instead of executing.
        #[arg(long)]
        audit_replay: Option<PathBuf>,
        /// Output verbosity for the run summary.
        #[arg(long, value_enum, default_value = "normal")]
        output: OutputArg,
    },
    /// Build (or reuse a cached) gate archive and print its path and hash.
    BuildGate {
        /// Module names or FQCNs to bake into the gate.
        #[arg(long = "module")]
        modules: Vec<String>,
        /// Directories searched for bare-named modules.
        #[arg(long = "module-dir")]
        module_dirs: Vec<PathBuf>,
        /// Interpreter path baked into the gate's shebang.
        #[arg(long, default_value = "python3")]
        interpreter: String,
        /// Cache directory for built archives.
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Run as a resident gate dispatcher over stdio (§4.5). Not meant to
    /// be invoked by hand: `GateLifecycle` starts this remotely as the
    /// other end of a staged gate connection.
    GateResident {
        /// Content hash reported back on `Info`, matching the one the
        /// driver computed when it staged this gate's archive.
        #[arg(long)]
        hash: String,
        /// Interpreter used to run any ad hoc bundle shipped after a
        /// `ModuleNotFound` reply.
        #[arg(long, default_value = "python3")]
        interpreter: String,
    },
    /// Build a deterministic module bundle and print its metadata.
    BuildBundle {
        /// Path to the module's Python source file.
        #[arg(long)]
        module: PathBuf,
        /// Fully qualified collection name (defaults to the file stem).
        #[arg(long)]
        fqcn: Option<String>,
        /// Write the built ZIP archive to this path.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum OutputArg {
    Quiet,
    Normal,
    Verbose,
}

impl From<OutputArg> for OutputMode {
    fn from(value: OutputArg) -> Self {
        match value {
            OutputArg::Quiet => OutputMode::Quiet,
            OutputArg::Normal => OutputMode::Normal,
            OutputArg::Verbose => OutputMode::Verbose,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = EngineConfig::load(cli.config.as_ref()).unwrap_or_else(|e| {
        tracing::warn!("failed to load config, using defaults: {e}");
        EngineConfig::default()
    });

    match cli.command {
        Commands::Run {
            inventory,
            target,
            module,
            args,
            check_mode,
            fail_fast,
            environment,
            policy,
            audit_record,
            audit_replay,
            output,
        } => {
            run(
                RunArgs {
                    inventory,
                    target,
                    module,
                    args,
                    check_mode,
                    fail_fast,
                    environment,
                    policy,
                    audit_record,
                    audit_replay,
                    output: output.into(),
                },
                config,
            )
            .await?;
        }
        Commands::BuildGate {
            modules,
            module_dirs,
            interpreter,
            cache_dir,
        } => build_gate(modules, module_dirs, interpreter, cache_dir.unwrap_or(config.gate_cache_dir))?,
        Commands::GateResident { hash, interpreter } => gate_resident(hash, interpreter).await?,
        Commands::BuildBundle { module, fqcn, out } => build_bundle_cmd(module, fqcn, out)?,
    }

    Ok(())
}

struct RunArgs {
    inventory: PathBuf,
    target: String,
    module: String,
    args: String,
    check_mode: bool,
    fail_fast: bool,
    environment: String,
    policy: Option<PathBuf>,
    audit_record: Option<PathBuf>,
    audit_replay: Option<PathBuf>,
    output: OutputMode,
}

async fn run(args: RunArgs, engine_config: EngineConfig) -> anyhow::Result<()> {
    let inventory = Inventory::load_file(&args.inventory)?;
    let module_args: serde_json::Value = serde_json::from_str(&args.args)?;
    let policy = match &args.policy {
        Some(path) => PolicyEngine::load_file(path)?,
        None => PolicyEngine::empty(),
    };

    let transport_provider = build_transport_provider(&inventory, &engine_config).await?;

    let mut config = OrchestratorConfig::new(inventory, ModuleRegistry::with_builtins(), SecretResolver::new(HashMap::new())?);
    config.policy = policy;
    config.check_mode = args.check_mode;
    config.fail_fast = args.fail_fast;
    config.environment = args.environment;
    config.audit_record_file = args.audit_record;
    config.audit_replay_file = args.audit_replay;
    config.gate_cache_dir = engine_config.gate_cache_dir;
    config.remote_staging_dir = engine_config.remote_gate_dir;
    config.remote_interpreter = engine_config.remote_interpreter;
    config.min_interpreter_major = engine_config.min_interpreter_major;
    config.transport_provider = transport_provider;

    let (orchestrator, _events) = Orchestrator::new(config)?;

    let request = ModuleRequest::new(args.module, module_args);
    if args.fail_fast {
        let result = orchestrator.execute(&args.target, request).await?;
        if args.output != OutputMode::Quiet {
            output::result_line(&result);
        }
    } else {
        let results = orchestrator.run_on(&args.target, request).await?;
        if args.output == OutputMode::Verbose {
            for result in &results {
                output::result_line(result);
            }
        }
        output::print_summary(args.output, &results);
    }

    orchestrator.write_audit_journal().await?;

    if orchestrator.failed().await {
        std::process::exit(1);
    }
    Ok(())
}

/// Pre-establish transports for every non-local host up front, since
/// [`TransportProvider`] itself is a synchronous lookup and SSH
/// connection setup is not.
async fn build_transport_provider(inventory: &Inventory, config: &EngineConfig) -> Result<TransportProvider> {
    let mut connections: HashMap<String, Arc<dyn Transport>> = HashMap::new();

    for host in inventory.hosts() {
        if host.connection.is_local() {
            continue;
        }
        connections.insert(host.name.clone(), connect_remote(host, config).await?);
    }

    Ok(Arc::new(move |host: &HostSpec| -> Result<Arc<dyn Transport>> {
        if host.connection.is_local() {
            Ok(Arc::new(LocalConnection::new()))
        } else {
            connections.get(&host.name).cloned().ok_or_else(|| Error::ConnectionFailed {
                host: host.name.clone(),
                message: "no transport was pre-established for this host".to_string(),
            })
        }
    }))
}

#[cfg(feature = "russh")]
async fn connect_remote(host: &HostSpec, config: &EngineConfig) -> Result<Arc<dyn Transport>> {
    let conn = RusshConnection::connect(
        host.address(),
        host.port,
        host.user.as_deref().unwrap_or("root"),
        &AuthConfig::default(),
        config.connection.host_key_policy,
        config.connection.timeout,
    )
    .await?;
    Ok(Arc::new(conn))
}

#[cfg(not(feature = "russh"))]
async fn connect_remote(host: &HostSpec, _config: &EngineConfig) -> Result<Arc<dyn Transport>> {
    Err(Error::ConnectionFailed {
        host: host.name.clone(),
        message: "this build has no SSH backend (rebuild with the `russh` feature)".to_string(),
    })
}

fn build_gate(
    modules: Vec<String>,
    module_dirs: Vec<PathBuf>,
    interpreter: String,
    cache_dir: PathBuf,
) -> anyhow::Result<()> {
    let builder = GateBuilder::new(cache_dir)?;
    let build_config = GateBuildConfig {
        modules,
        module_dirs,
        dependencies: Vec::new(),
        interpreter,
        dispatcher_source: include_bytes!("gate/resident.rs").to_vec(),
        collection_paths: Vec::new(),
        builtin_modules_root: None,
        core_module_utils_root: None,
    };
    let (path, hash) = builder.build(&build_config)?;
    println!("gate hash: {hash}");
    println!("gate path: {}", path.display());
    Ok(())
}

/// The process a `GateLifecycle` stages and starts remotely: reconstructs
/// the same baked module table `ModuleRegistry::with_builtins` uses for
/// local execution and drives the dispatch loop over stdio, the transport
/// the SSH-launched command runs under.
async fn gate_resident(hash: String, interpreter: String) -> anyhow::Result<()> {
    let identity = GateIdentity {
        gate_hash: hash,
        interpreter_version: format!("ftlgate-resident {}", env!("CARGO_PKG_VERSION")),
    };
    let dispatcher = Dispatcher::new(identity, builtin_module_table(), interpreter);
    let stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
    dispatcher.run(stdio).await?;
    Ok(())
}

fn builtin_module_table() -> ModuleTable {
    let mut table = ModuleTable::new();
    table.register_sync("command", Box::new(command::Command));
    table.register_sync("file", Box::new(file::File));
    table.register_fast_path("ping", Box::new(ping::Ping));
    table
}

fn build_bundle_cmd(module: PathBuf, fqcn: Option<String>, out: Option<PathBuf>) -> anyhow::Result<()> {
    let fqcn = fqcn.unwrap_or_else(|| {
        module
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "module".to_string())
    });
    let bundle = ftlgate::bundle::build_bundle(&module, None, &fqcn, None)?;
    println!("{}", bundle.info);
    if let Some(out) = out {
        std::fs::write(&out, &bundle.data)?;
        println!("wrote {}", out.display());
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
