//! Priority Living bridge worker
//!
//! `pl bridge start` connects this machine to the backend; the other
//! subcommands are thin local callers into the same components.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use priority_bridge::{
    bridge::{BridgeBackend, BridgeSession, ConnectionState, Dispatcher, HttpBackend, SessionSettings},
    command::{CommandId, CommandStatus, ModelOp},
    config::{self, BridgeConfig, ConfigStore, KeySource, CONFIG_KEYS},
    exec::{CommandExecutor, OutputChunk, OutputStream},
    models::ModelManager,
    status::{self, FactsConfig, StatusReporter},
    supervisor::{ConfiguredLauncher, ProcessKind, ProcessSupervisor, RestartPolicy},
};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "pl")]
#[command(version)]
#[command(about = "Priority Living bridge worker - run backend commands on this machine")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "PL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Bridge worker
    Bridge {
        #[command(subcommand)]
        action: BridgeAction,
    },

    /// Agents bound to this bridge
    Agents {
        #[command(subcommand)]
        action: AgentsAction,
    },

    /// Local models
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Show local status
    Status {
        /// Query a running bridge's status endpoint instead
        #[arg(long)]
        addr: Option<SocketAddr>,
    },

    /// Run diagnostics
    Diagnose,

    /// Read or change configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum BridgeAction {
    /// Connect to the backend and execute its commands until interrupted
    Start {
        /// Bridge key (pb_...)
        #[arg(long, env = "PL_BRIDGE_KEY", hide_env_values = true)]
        key: Option<String>,

        /// Machine name reported to the backend
        #[arg(long)]
        name: Option<String>,

        /// Seconds between polls
        #[arg(long)]
        poll_interval: Option<u64>,

        /// Restart supervised processes that exit
        #[arg(long)]
        auto_restart: Option<bool>,

        /// Serve GET /status and /healthz on this address
        #[arg(long)]
        status_addr: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
enum AgentsAction {
    /// List agents bound to the bridge key
    List,

    /// Run an agent in the foreground under supervision
    Start {
        agent_id: String,

        /// Extra arguments for the agent runner
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// Download a model into the models directory
    Download { model: String },

    /// Run a single inference
    Infer {
        model: String,

        #[arg(long)]
        prompt: String,

        #[arg(long, default_value_t = 256)]
        max_tokens: u32,
    },

    /// Serve a model in the foreground under supervision
    Serve {
        model: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one key
    Get { key: String },

    /// Set one key
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let store = match &cli.config {
        Some(path) => ConfigStore::new(path),
        None => ConfigStore::default_location(),
    };

    if let Commands::Config { action } = cli.command {
        return run_config(&store, action);
    }
    let config = store.load()?;

    match cli.command {
        Commands::Bridge {
            action:
                BridgeAction::Start {
                    key,
                    name,
                    poll_interval,
                    auto_restart,
                    status_addr,
                },
        } => {
            let mut config = config;
            if let Some(key) = &key {
                config.bridge_key = key.clone();
            }
            if let Some(name) = name {
                config.machine_name = name;
            }
            if let Some(secs) = poll_interval {
                config.poll_interval = secs;
            }
            if let Some(auto_restart) = auto_restart {
                config.auto_restart = auto_restart;
            }
            run_bridge(config, KeySource::store(store).with_override(key), status_addr).await?;
        }
        Commands::Agents { action } => run_agents(config, action).await?,
        Commands::Models { action } => run_models(config, action).await?,
        Commands::Status { addr } => run_status(config, addr).await?,
        Commands::Diagnose => run_diagnose(config).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("priority_bridge={0},pl={0},tower_http=info", log_level).into()
    });
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

/// Components shared by the bridge and the foreground subcommands
struct Runtime {
    supervisor: ProcessSupervisor,
    models: ModelManager,
    executor: Arc<CommandExecutor>,
}

impl Runtime {
    fn new(config: &BridgeConfig) -> Self {
        let launcher = Arc::new(ConfiguredLauncher::from_config(config));
        let policy = RestartPolicy::from_config(&config.supervisor, config.auto_restart);
        let supervisor = ProcessSupervisor::new(launcher, policy);
        let executor = Arc::new(CommandExecutor::from_config(&config.commands));
        let models = ModelManager::from_config(config, executor.clone(), supervisor.clone());
        Self {
            supervisor,
            models,
            executor,
        }
    }
}

/// A missing or refused bridge key does not stop the worker: the session
/// logs it and keeps retrying with whatever key the config file holds.
async fn run_bridge(config: BridgeConfig, key: KeySource, status_addr: Option<SocketAddr>) -> Result<()> {
    config.validate_backend_url()?;
    if let Err(e) = config::validate_bridge_key(&config.bridge_key) {
        tracing::warn!("{}; waiting for a valid key", e);
    }

    tracing::info!(
        version = priority_bridge::VERSION,
        backend = %config.backend_url,
        machine = %config.resolved_machine_name(),
        bridge_key = %config::mask_secret(&config.bridge_key),
        poll_interval_secs = config.poll_interval,
        auto_restart = config.auto_restart,
        "Starting bridge worker"
    );

    let runtime = Runtime::new(&config);
    let supervisor = runtime.supervisor.clone();
    let state = ConnectionState::shared();
    let reporter = StatusReporter::new(state.clone(), supervisor.clone(), FactsConfig::from_config(&config));
    let dispatcher = Arc::new(Dispatcher::new(runtime.executor, supervisor, runtime.models));
    let backend: Arc<dyn BridgeBackend> = Arc::new(HttpBackend::new(&config)?);

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutting down gracefully...");
            stop.cancel();
        }
    });

    let status_server = status_addr.map(|addr| {
        let reporter = reporter.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = status::http::serve(addr, reporter, stop).await {
                tracing::error!("Status endpoint failed: {}", e);
            }
        })
    });

    let mut settings = SessionSettings::from_config(&config);
    settings.key = key;
    let mut session = BridgeSession::new(
        settings,
        backend,
        dispatcher,
        reporter,
        state,
    );
    session.run(stop.clone()).await;

    stop.cancel();
    if let Some(server) = status_server {
        let _ = server.await;
    }
    Ok(())
}

async fn run_agents(config: BridgeConfig, action: AgentsAction) -> Result<()> {
    match action {
        AgentsAction::List => {
            config.validate_for_bridge()?;
            let backend = HttpBackend::new(&config)?;
            let token = backend.authenticate(&config.bridge_key).await?;
            let agents = backend.list_agents(&token).await?;
            if agents.is_empty() {
                println!("No agents bound to this bridge key.");
            }
            for agent in agents {
                let marker = if agent.is_active() { "●" } else { "○" };
                let name = if agent.name.is_empty() { &agent.id } else { &agent.name };
                println!("  {} {} ({}) {}", marker, name, agent.id, agent.status);
            }
        }
        AgentsAction::Start { agent_id, args } => {
            let runtime = Runtime::new(&config);
            let outcome = runtime
                .supervisor
                .start(&agent_id, ProcessKind::Agent, args)
                .await?;
            println!(
                "Agent {} running (pid {}). Press Ctrl+C to stop.",
                agent_id,
                outcome.process().pid.map(|p| p.to_string()).unwrap_or_default()
            );
            supervise_foreground(&runtime.supervisor, &config, &agent_id).await;
        }
    }
    Ok(())
}

async fn run_models(config: BridgeConfig, action: ModelsAction) -> Result<()> {
    let runtime = Runtime::new(&config);
    let id = CommandId::new(format!("local-{}", uuid::Uuid::new_v4()));

    let op = match action {
        ModelsAction::Download { model } => ModelOp::Download { model },
        ModelsAction::Infer {
            model,
            prompt,
            max_tokens,
        } => ModelOp::Infer {
            model,
            prompt,
            max_tokens,
        },
        ModelsAction::Serve { model, port } => {
            let result = runtime.models.serve(&id, &model, port, Instant::now()).await;
            if result.status != CommandStatus::Ok {
                bail!(result.message.unwrap_or_else(|| "model server failed to start".into()));
            }
            println!("{} Press Ctrl+C to stop.", result.stdout);
            supervise_foreground(&runtime.supervisor, &config, &priority_bridge::models::server_id(&model))
                .await;
            return Ok(());
        }
    };

    let (tx, mut rx) = mpsc::channel::<OutputChunk>(64);
    let printer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => {
                    print!("{}", chunk.text);
                    let _ = std::io::stdout().flush();
                }
                OutputStream::Stderr => eprint!("{}", chunk.text),
            }
        }
    });
    let result = runtime.models.execute(&id, &op, Some(tx)).await;
    let _ = printer.await;

    match result.status {
        CommandStatus::Ok => Ok(()),
        status => bail!(
            "{:?}: {}",
            status,
            result.message.unwrap_or_else(|| "model operation failed".into())
        ),
    }
}

/// Keep a supervised process running until Ctrl+C, then stop everything.
async fn supervise_foreground(supervisor: &ProcessSupervisor, config: &BridgeConfig, logical_id: &str) {
    let cancel = CancellationToken::new();
    let tick = Duration::from_millis(config.supervisor.tick_interval_ms.max(100));
    let watchdog = supervisor.start_watchdog(tick, cancel.clone());

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = wait_until_gone(supervisor, logical_id, tick) => {
            tracing::warn!(logical_id, "Process is no longer supervised");
        }
    }

    if let Some(lines) = supervisor.logs(logical_id, 20).await {
        for line in lines {
            println!("  | {}", line);
        }
    }
    cancel.cancel();
    let _ = watchdog.await;
    supervisor.shutdown().await;
}

async fn wait_until_gone(supervisor: &ProcessSupervisor, logical_id: &str, tick: Duration) {
    use priority_bridge::supervisor::ObservedState;
    loop {
        tokio::time::sleep(tick).await;
        match supervisor.status(logical_id).await {
            None => return,
            Some(p) if p.observed_state == ObservedState::Failed => return,
            Some(_) => {}
        }
    }
}

async fn run_status(config: BridgeConfig, addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = addr {
        let url = format!("http://{}/status", addr);
        let body: serde_json::Value = reqwest::get(&url)
            .await
            .with_context(|| format!("No bridge status endpoint at {}", url))?
            .json()
            .await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let runtime = Runtime::new(&config);
    let reporter = StatusReporter::new(
        ConnectionState::shared(),
        runtime.supervisor,
        FactsConfig::from_config(&config),
    );
    reporter.refresh_now().await;
    let snapshot = reporter.snapshot().await;

    println!("Priority Living bridge {}", priority_bridge::VERSION);
    println!("  bridge key:  {}", display_or_unset(&config::mask_secret(&config.bridge_key)));
    println!("  backend:     {}", display_or_unset(&config.backend_url));
    println!("  machine:     {}", snapshot.system.machine_name);
    println!("  os:          {}", snapshot.system.os_info);
    println!(
        "  gpu:         {}",
        snapshot.system.gpu_name.as_deref().unwrap_or("none")
    );
    if let Some(free) = snapshot.system.disk_free_gb {
        println!("  disk free:   {:.1} GB", free);
    }
    println!("  models dir:  {}", config.default_model_path.display());
    if snapshot.system.installed_models.is_empty() {
        println!("  models:      none installed");
    } else {
        println!("  models:      {}", snapshot.system.installed_models.join(", "));
    }
    Ok(())
}

fn display_or_unset(value: &str) -> &str {
    if value.is_empty() {
        "(not set)"
    } else {
        value
    }
}

async fn run_diagnose(config: BridgeConfig) -> Result<()> {
    println!("Priority Living diagnostics");
    println!();
    let report = status::diagnostics::diagnose(&config).await;
    print!("{}", report);
    if report.has_failures() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_config(store: &ConfigStore, action: Option<ConfigAction>) -> Result<()> {
    match action {
        Some(ConfigAction::Get { key }) => {
            let value = store.get(&key)?;
            if is_secret(&key) {
                println!("{}", config::mask_secret(&value));
            } else {
                println!("{}", value);
            }
        }
        Some(ConfigAction::Set { key, value }) => {
            store.set(&key, &value)?;
            let shown = if is_secret(&key) {
                config::mask_secret(&value)
            } else {
                value
            };
            println!("Set {} = {}", key, shown);
        }
        None => {
            let config = store.load()?;
            println!("Configuration: {}", store.path().display());
            for key in CONFIG_KEYS {
                let value = config::get_value(&config, key)?;
                let shown = if is_secret(key) {
                    config::mask_secret(&value)
                } else {
                    value
                };
                println!("  {:<20} {}", key, display_or_unset(&shown));
            }
        }
    }
    Ok(())
}

fn is_secret(key: &str) -> bool {
    matches!(key, "bridge_key" | "anon_key")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
