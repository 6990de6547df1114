use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use relaymesh_core::clock::SystemClock;
use relaymesh_core::core_exit::{
    DisconnectedAgentChannel, ExitNodePingResult, ExitNodeSelector, HttpExitNodeDispatcher, HttpOnlineProbe,
    OnlineProbe, RecordingAgentChannel, RecordingExitNodeDispatcher, RoutingExitNodeDispatcher,
};
use relaymesh_core::core_mesh::RecordingPeerDispatcher;
use relaymesh_core::core_ratelimit::InMemoryCounterStore;
use relaymesh_core::logging::{init_from_config, LogLevel};
use relaymesh_core::model::{ClientId, SiteResourceId};
use relaymesh_core::shutdown::wait_for_signal;
use relaymesh_core::storage::{InMemoryStore, MeshSnapshot};
use relaymesh_core::{Collaborators, Config, ControlPlane};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "relaymesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a mesh state file until SIGINT/SIGTERM
    ///
    /// Every site resource is reconciled at startup and exit node health is
    /// checked in the background. The state file is rewritten on exit.
    Run {
        /// Mesh state snapshot (JSON)
        #[arg(long)]
        state: PathBuf,

        /// Reconcile and check exit node health once, then exit
        #[arg(long)]
        once: bool,
    },
    /// Pick an exit node from recorded ping results (JSON array)
    Select {
        results: PathBuf,
    },
    /// Check whether an exit node answers on /ping
    Probe {
        /// host:port of the exit node
        endpoint: String,
    },
    /// Dry-run a reconcile against a state snapshot; RPCs are recorded, not sent
    Reconcile {
        #[arg(long)]
        state: PathBuf,

        /// Site resource whose grants changed
        #[arg(long, required_unless_present = "client", conflicts_with = "client")]
        resource: Option<u64>,

        /// Reconcile every site of one client instead
        #[arg(long)]
        client: Option<u64>,

        /// Write the resulting snapshot here
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Manage configuration files
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Parse and validate a configuration file
    Check {
        path: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn init_logging(args: &Args, config: &Config) -> Result<()> {
    let mut section = config.logging.clone();
    if let Some(level) = &args.log_level {
        match level.parse::<LogLevel>() {
            Ok(level) => section.level = level.as_str().to_string(),
            Err(_) => eprintln!("Invalid log level '{}', using '{}'", level, section.level),
        }
    }
    if args.json_logs {
        section.json_format = true;
    }
    init_from_config(&section)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // `config init` must work without a readable config file
    if let Command::Config { action: ConfigAction::Init { path, force } } = &args.command {
        return config_init(path, *force);
    }

    let config = load_config(args.config.as_deref())?;
    init_logging(&args, &config)?;

    match args.command {
        Command::Run { state, once } => run(config, &state, once).await,
        Command::Select { results } => select(&config, &results),
        Command::Probe { endpoint } => probe(&config, &endpoint).await,
        Command::Reconcile { state, resource, client, output } => {
            reconcile(config, &state, resource, client, output.as_deref()).await
        }
        Command::Config { action: ConfigAction::Check { path } } => config_check(&path),
        Command::Config { action: ConfigAction::Init { .. } } => Ok(()),
    }
}

async fn run(config: Config, state: &Path, once: bool) -> Result<()> {
    if config.metrics.enabled && !once {
        PrometheusBuilder::new()
            .with_http_listener(config.metrics.bind_address)
            .install()
            .context("installing Prometheus exporter")?;
        relaymesh_core::metrics::init_metrics();
        info!(address = %config.metrics.bind_address, "Metrics exporter listening");
    }

    let snapshot = MeshSnapshot::from_file(state)?;
    let resources: Vec<SiteResourceId> = snapshot.site_resources.iter().map(|r| r.id).collect();
    let store = InMemoryStore::from_snapshot(snapshot);
    let clock = Arc::new(SystemClock);

    warn!("No agent transport configured, peer commands are recorded only");
    let exit_node_rpc = RoutingExitNodeDispatcher::new(
        Arc::new(HttpExitNodeDispatcher::new(config.exit_nodes.rpc_timeout)?),
        Arc::new(DisconnectedAgentChannel),
    );
    let deps = Collaborators {
        exit_node_store: Arc::new(store.clone()),
        mesh_store: Arc::new(store.clone()),
        counter_store: Arc::new(InMemoryCounterStore::new(clock.clone())),
        peers: Arc::new(RecordingPeerDispatcher::new()),
        exit_node_rpc: Arc::new(exit_node_rpc),
        probe: Arc::new(HttpOnlineProbe::from_config(&config.exit_nodes)?),
        clock,
    };
    let plane = ControlPlane::build(config, deps)?;

    let mut changed = 0;
    for id in &resources {
        match plane.reconciler().reconcile(*id).await {
            Ok(report) if !report.is_noop() => changed += 1,
            Ok(_) => {}
            Err(e) => warn!(site_resource_id = %id, error = %e, "Startup reconcile failed"),
        }
    }
    info!(resources = resources.len(), changed, "Startup reconcile done");

    if once {
        let sweep = plane.directory().refresh_all().await?;
        println!(
            "reconciled {} site resources ({} changed); exit nodes online={} offline={} failed={}",
            resources.len(),
            changed,
            sweep.online,
            sweep.offline,
            sweep.failed,
        );
    } else {
        plane.start().await;
        info!("relaymesh control plane running");
        wait_for_signal().await;
        plane.stop().await;
    }

    write_snapshot(&store, state).await
}

async fn write_snapshot(store: &InMemoryStore, path: &Path) -> Result<()> {
    let json = store.snapshot().await.to_json_pretty()?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), "Wrote mesh state");
    Ok(())
}

fn select(config: &Config, path: &Path) -> Result<()> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let results: Vec<ExitNodePingResult> =
        serde_json::from_str(&contents).context("parsing ping results")?;

    let selector = ExitNodeSelector::from_config(&config.exit_nodes);
    match selector.select_with_reason(&results) {
        Some(selection) => {
            println!(
                "selected exit node {} ({}) reason={} latency_ms={} weight={}",
                selection.result.exit_node_id,
                selection.result.exit_node_name,
                selection.reason.as_str(),
                selection.result.latency_ms,
                selection.result.weight,
            );
        }
        None => println!("no exit node available"),
    }
    Ok(())
}

async fn probe(config: &Config, endpoint: &str) -> Result<()> {
    let probe = HttpOnlineProbe::from_config(&config.exit_nodes)?;
    if probe.is_online(endpoint).await {
        println!("{} is online", endpoint);
        Ok(())
    } else {
        bail!("{} is offline", endpoint)
    }
}

async fn reconcile(
    config: Config,
    state: &Path,
    resource: Option<u64>,
    client: Option<u64>,
    output: Option<&Path>,
) -> Result<()> {
    let store = InMemoryStore::from_snapshot(MeshSnapshot::from_file(state)?);
    let peers = Arc::new(RecordingPeerDispatcher::new());
    let exits = Arc::new(RecordingExitNodeDispatcher::new());
    let agents = Arc::new(RecordingAgentChannel::new());
    let clock = Arc::new(SystemClock);

    let deps = Collaborators {
        exit_node_store: Arc::new(store.clone()),
        mesh_store: Arc::new(store.clone()),
        counter_store: Arc::new(InMemoryCounterStore::new(clock.clone())),
        peers: peers.clone(),
        exit_node_rpc: Arc::new(RoutingExitNodeDispatcher::new(exits.clone(), agents.clone())),
        probe: Arc::new(HttpOnlineProbe::from_config(&config.exit_nodes)?),
        clock,
    };
    let plane = ControlPlane::build(config, deps)?;

    let report = match (resource, client) {
        (Some(resource), _) => plane.reconciler().reconcile(SiteResourceId(resource)).await?,
        (None, Some(client)) => plane.reconciler().reconcile_client(ClientId(client)).await?,
        (None, None) => bail!("either --resource or --client is required"),
    };

    println!("added: {:?}", report.added);
    println!("removed: {:?}", report.removed);
    if let Some(reason) = &report.unprovisioned {
        println!("unprovisioned: {}", reason);
    }
    if !report.skipped.is_empty() {
        println!("skipped: {:?}", report.skipped);
    }
    for call in peers.calls().await {
        match call.command.public_key() {
            Some(key) => println!("peer {} -> {} {}", call.command.method(), call.target, key),
            None => println!("peer {} -> {}", call.command.method(), call.target),
        }
    }
    for (target, request) in exits.calls().await {
        println!("exit node {} <- {}", target.exit_node_id, request.method());
    }
    for (exit_node_id, message) in agents.messages().await {
        println!("exit node {} agent <- {}", exit_node_id, message.message_type);
    }

    if let Some(output) = output {
        write_snapshot(&store, output).await?;
    }
    Ok(())
}

fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save_to_file(path)?;
    println!("wrote default configuration to {}", path.display());
    Ok(())
}

fn config_check(path: &Path) -> Result<()> {
    let config = Config::from_file(path)?;
    println!(
        "{} is valid (rate_limit.max_requests={}, reconciler.relay_strategy={})",
        path.display(),
        config.rate_limit.max_requests,
        config.reconciler.relay_strategy.as_str(),
    );
    Ok(())
}
