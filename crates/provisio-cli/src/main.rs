//! Provisio - provision machines and chains through driver plugins
//!
//! ## Commands
//!
//! - `machine create`: run the machine sequence against a driver plugin
//! - `chain create`: run the chain sequence against a driver plugin
//! - `drivers`: list the drivers known to this invocation
//! - `exec`: run one command through the bounded command runner
//!
//! Started by a supervisor with `PROVISIO_BUILTIN_PLUGIN=true`, the binary
//! skips argument parsing and serves the built-in driver named in its
//! handshake environment. External plugin wrappers use the hidden
//! `serve-plugin` subcommand for the same thing.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use provisio_core::builtin::{self, BUILTIN_DRIVERS};
use provisio_core::{
    init_tracing, ProcessLauncher, ProvisionOutcome, ProvisionRequest, ProvisioConfig,
    Sequencer,
};
use provisio_exec::CommandSpec;
use provisio_plugin::{is_builtin_invocation, serve_plugin, wait_for_shutdown_signal, PluginEnv};
use provisio_state::{DriverCategory, DriverRecord, MemoryRecordStore, RecordStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "provisio")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provision machines and chains through driver plugins", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and results
    #[arg(long, global = true)]
    json: bool,

    /// JSON configuration file
    #[arg(long, global = true, env = "PROVISIO_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding plugins/<name>/<version>/plugin
    #[arg(long, global = true)]
    plugin_root: Option<PathBuf>,

    /// Register an external driver as NAME:VERSION:CATEGORY (repeatable)
    #[arg(long = "register", global = true, value_parser = parse_registration)]
    registrations: Vec<Registration>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Machine provisioning
    Machine {
        #[command(subcommand)]
        action: MachineAction,
    },

    /// Chain provisioning
    Chain {
        #[command(subcommand)]
        action: ChainAction,
    },

    /// List registered drivers
    Drivers,

    /// Run a command with a deadline, retries and process-tree cleanup
    Exec {
        /// Seconds before the command is abandoned
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Total attempts
        #[arg(short, long, default_value = "1")]
        retries: u32,

        /// Seconds between attempts
        #[arg(long, default_value = "2")]
        retry_delay: u64,

        /// bash, sh or none (default: detected)
        #[arg(long)]
        shell: Option<String>,

        /// Leave the process tree running when the deadline passes
        #[arg(long)]
        no_force_kill: bool,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Serve a built-in driver over the plugin protocol
    #[command(hide = true)]
    ServePlugin {
        /// Driver to serve (default: from the handshake environment)
        #[arg(long)]
        driver: Option<String>,
    },
}

#[derive(Subcommand)]
enum MachineAction {
    /// Provision a machine
    Create(CreateArgs),
}

#[derive(Subcommand)]
enum ChainAction {
    /// Provision a chain
    Create(CreateArgs),
}

#[derive(Args)]
struct CreateArgs {
    /// Driver id or name
    #[arg(short, long)]
    driver: String,

    /// Resource name
    #[arg(short, long)]
    name: String,

    /// Driver parameter as KEY=VALUE (repeatable)
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Registration {
    name: String,
    version: String,
    category: DriverCategory,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn parse_registration(raw: &str) -> Result<Registration, String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [name, version, category] = parts.as_slice() else {
        return Err(format!("expected NAME:VERSION:CATEGORY, got '{raw}'"));
    };
    if name.is_empty() || version.is_empty() {
        return Err(format!("driver name and version must not be empty: '{raw}'"));
    }
    let category = category
        .parse::<DriverCategory>()
        .map_err(|err| err.to_string())?;
    Ok(Registration {
        name: name.to_string(),
        version: version.to_string(),
        category,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Re-invoked by our own supervisor: stdout belongs to the handshake.
    if is_builtin_invocation() {
        init_tracing(false, Level::INFO);
        let env = PluginEnv::from_env().context("Invalid plugin handshake environment")?;
        return cmd_serve_plugin(&env.identity.name).await;
    }

    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let mut config = ProvisioConfig::load(cli.config.as_deref())
        .context("Failed to load provisio configuration")?;
    if let Some(root) = &cli.plugin_root {
        config.plugin_root = root.clone();
    }

    let store = Arc::new(MemoryRecordStore::new());
    register_drivers(store.as_ref(), &config, &cli.registrations).await?;

    match cli.command {
        Commands::Machine {
            action: MachineAction::Create(args),
        } => cmd_create(store, &config, DriverCategory::Machine, args, cli.json).await,
        Commands::Chain {
            action: ChainAction::Create(args),
        } => cmd_create(store, &config, DriverCategory::Chain, args, cli.json).await,
        Commands::Drivers => cmd_drivers(store.as_ref(), cli.json).await,
        Commands::Exec {
            timeout,
            retries,
            retry_delay,
            shell,
            no_force_kill,
            command,
        } => {
            cmd_exec(
                &command,
                timeout,
                retries,
                retry_delay,
                shell.as_deref(),
                !no_force_kill,
            )
            .await
        }
        Commands::ServePlugin { driver } => {
            let name = match driver {
                Some(name) => name,
                None => {
                    PluginEnv::from_env()
                        .context("No --driver given and no plugin handshake environment")?
                        .identity
                        .name
                }
            };
            cmd_serve_plugin(&name).await
        }
    }
}

/// Serve the named built-in driver until `driver.exit` or a signal.
async fn cmd_serve_plugin(name: &str) -> Result<()> {
    let service = builtin::service_for(name)
        .ok_or_else(|| anyhow!("No built-in driver named '{}'", name))?;
    serve_plugin(service)
        .await
        .with_context(|| format!("Driver plugin '{}' failed", name))
}

/// Register the enabled built-in drivers, then any `--register` entries.
async fn register_drivers(
    store: &dyn RecordStore,
    config: &ProvisioConfig,
    registrations: &[Registration],
) -> Result<()> {
    for (name, category) in BUILTIN_DRIVERS {
        if config.builtin_drivers.iter().any(|enabled| enabled == name) {
            store
                .register_driver(name, env!("CARGO_PKG_VERSION"), *category)
                .await?;
        }
    }
    for reg in registrations {
        store
            .register_driver(&reg.name, &reg.version, reg.category)
            .await
            .with_context(|| format!("Failed to register driver '{}'", reg.name))?;
    }
    Ok(())
}

/// Look a driver up by numeric id, falling back to its name.
async fn resolve_driver(store: &dyn RecordStore, reference: &str) -> Result<DriverRecord> {
    if let Ok(id) = reference.parse::<i64>() {
        return store
            .get_driver(id)
            .await
            .with_context(|| format!("Driver {} is not registered", id));
    }

    let mut matches: Vec<DriverRecord> = store
        .list_drivers()
        .await?
        .into_iter()
        .filter(|driver| driver.name == reference)
        .collect();
    if matches.len() > 1 {
        bail!(
            "Driver name '{}' is ambiguous; use its id ({})",
            reference,
            matches
                .iter()
                .map(|d| d.id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    matches
        .pop()
        .ok_or_else(|| anyhow!("Driver '{}' is not registered", reference))
}

/// Run a machine or chain sequence and print the outcome.
async fn cmd_create(
    store: Arc<MemoryRecordStore>,
    config: &ProvisioConfig,
    category: DriverCategory,
    args: CreateArgs,
    json: bool,
) -> Result<()> {
    let driver = resolve_driver(store.as_ref(), &args.driver).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    let watcher = tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => {
                warn!("termination signal received; cancelling");
                on_signal.cancel();
            }
            Err(err) => warn!(error = %err, "cannot install signal handlers"),
        }
    });

    let launcher = Arc::new(ProcessLauncher::new(
        config.resolver(),
        config.controller_options(),
    ));
    let sequencer = Sequencer::new(
        store.clone(),
        launcher,
        config.sequencer_options(),
        cancel,
    );

    let mut request = ProvisionRequest::new(&args.name);
    request.params.extend(args.params);

    info!(driver = %driver.name, category = %category, name = %args.name, "provisioning");
    let result = match category {
        DriverCategory::Machine => sequencer.create_machine(driver.id, request).await,
        DriverCategory::Chain => sequencer.create_chain(driver.id, request).await,
    };
    watcher.abort();

    let outcome = result
        .with_context(|| format!("Failed to provision {} '{}'", category, args.name))?;
    print_outcome(store.as_ref(), category, &outcome, json).await
}

async fn print_outcome(
    store: &dyn RecordStore,
    category: DriverCategory,
    outcome: &ProvisionOutcome,
    json: bool,
) -> Result<()> {
    let record = match category {
        DriverCategory::Machine => {
            serde_json::to_value(store.get_machine(outcome.record_id).await?)?
        }
        DriverCategory::Chain => serde_json::to_value(store.get_chain(outcome.record_id).await?)?,
    };

    if json {
        let out = serde_json::json!({
            "record": record,
            "phases": outcome.phases,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("{} {} ready", category, outcome.record_id);
    println!(
        "  phases: {}",
        outcome
            .phases
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    if let Some(name) = record.get("name").and_then(|v| v.as_str()) {
        println!("  name:   {}", name);
    }
    if let Some(host) = record.get("host").and_then(|v| v.as_str()) {
        println!("  host:   {}", host);
    }
    Ok(())
}

async fn cmd_drivers(store: &dyn RecordStore, json: bool) -> Result<()> {
    let drivers = store.list_drivers().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&drivers)?);
        return Ok(());
    }

    if drivers.is_empty() {
        println!("No drivers registered.");
        return Ok(());
    }
    for driver in drivers {
        println!(
            "{:>4}  {:<8} {}@{}",
            driver.id, driver.category, driver.name, driver.version
        );
    }
    Ok(())
}

/// Run one bounded command and echo its combined output.
async fn cmd_exec(
    command: &[String],
    timeout: u64,
    retries: u32,
    retry_delay: u64,
    shell: Option<&str>,
    force_kill: bool,
) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("No command given"))?;

    let mut builder = CommandSpec::builder(program.as_str())
        .args(args.iter().cloned())
        .timeout_secs(timeout)
        .retries(retries)
        .retry_delay(Duration::from_secs(retry_delay))
        .force_kill(force_kill);
    if let Some(shell) = shell {
        builder = builder.shell_name(shell);
    }
    let spec = builder.build().context("Invalid command")?;

    let output = provisio_exec::run(&spec).await?;
    print!("{}", output);
    Ok(())
}
