//! nodefleetd — the NodeFleet daemon.
//!
//! Assembles the state store, Prometheus collector, lifecycle manager and
//! notification sinks, then drives [`Orchestrator::run_cycle`] on an
//! (optionally adaptive) interval.
//!
//! # Usage
//!
//! ```text
//! nodefleetd init --cluster prod
//! nodefleetd --config nodefleet.toml --simulate run
//! nodefleetd status
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use nodefleet_core::{FleetConfig, epoch_secs};
use nodefleet_lifecycle::{LifecycleClass, NodeLifecycleManager, SimulatedFleet};
use nodefleet_metrics::{MetricsCollector, PrometheusSource};
use nodefleet_orchestrator::{
    CycleOutcome, CycleResult, LogSink, Orchestrator, WebhookSink, assess_activity, next_interval,
};
use nodefleet_state::StateStore;

#[derive(Parser)]
#[command(name = "nodefleetd", about = "NodeFleet cluster autoscaler", version)]
struct Cli {
    /// Path to nodefleet.toml.
    #[arg(long, global = true, default_value = "nodefleet.toml")]
    config: PathBuf,

    /// Override `cluster.id` from the config file.
    #[arg(long, global = true)]
    cluster: Option<String>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Execute against an in-process simulated fleet instead of a cloud provider.
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scaling cycle on the configured interval until Ctrl-C.
    Run,
    /// Run a single cycle and print its result as JSON.
    Once,
    /// Print the persisted cluster state as JSON.
    Status,
    /// Clear the cluster lock.
    ///
    /// Without --force only a lock older than the configured TTL is cleared.
    ReleaseLock {
        #[arg(long)]
        force: bool,
    },
    /// Print recent scaling events, newest first.
    History {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Write a starter nodefleet.toml to --config.
    Init {
        #[arg(long, default_value = "http://localhost:9090")]
        prometheus_url: String,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match &cli.command {
        Command::Init {
            prometheus_url,
            force,
        } => init_config(&cli.config, cli.cluster.as_deref(), prometheus_url, *force),
        Command::Run => {
            let config = load_config(&cli)?;
            let orchestrator = build_orchestrator(&config, cli.simulate)?;
            run_loop(orchestrator, &config).await;
            Ok(())
        }
        Command::Once => {
            let config = load_config(&cli)?;
            let orchestrator = build_orchestrator(&config, cli.simulate)?;
            let result = orchestrator.run_cycle(epoch_secs()).await;
            log_result(&result);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Status => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;
            let state = store.read_state(&config.cluster.id)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            Ok(())
        }
        Command::ReleaseLock { force } => {
            let config = load_config(&cli)?;
            release_lock(&config, *force)
        }
        Command::History { limit } => {
            let config = load_config(&cli)?;
            let store = open_store(&config)?;
            for event in store.list_events(&config.cluster.id, *limit)? {
                println!(
                    "{}  {:<20} {:>2}  {}",
                    format_ts(event.timestamp),
                    event.kind.as_str(),
                    event.delta,
                    event.reason
                );
            }
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,nodefleetd=debug,nodefleet=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<FleetConfig> {
    let mut config = FleetConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(cluster) = &cli.cluster {
        config.cluster.id = cluster.clone();
    }
    Ok(config)
}

fn open_store(config: &FleetConfig) -> anyhow::Result<StateStore> {
    let path = Path::new(&config.cluster.state_path);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory {}", parent.display()))?;
        }
    }
    let store = StateStore::open(path).with_context(|| format!("opening state store {}", path.display()))?;
    debug!(path = %path.display(), "state store opened");
    Ok(store)
}

fn build_orchestrator(config: &FleetConfig, simulate: bool) -> anyhow::Result<Orchestrator> {
    if !simulate {
        bail!(
            "no compute provider is linked into this build; \
             pass --simulate to run the cycle against an in-process fleet"
        );
    }

    let store = open_store(config)?;

    let source = Arc::new(PrometheusSource::new(&config.metrics.prometheus_url)?);
    let collector = MetricsCollector::from_config(source, &config.metrics);
    info!(url = %config.metrics.prometheus_url, "metrics source configured");

    let fleet = simulated_fleet(config, &store)?;
    let lifecycle = NodeLifecycleManager::from_config(fleet.clone(), fleet, config);

    let mut orchestrator =
        Orchestrator::from_config(config, store, collector, lifecycle).with_sink(Arc::new(LogSink));
    if let Some(url) = &config.notify.webhook_url {
        orchestrator = orchestrator.with_sink(Arc::new(WebhookSink::new(url)?));
        info!(%url, "webhook notifications enabled");
    }
    Ok(orchestrator)
}

/// In-process fleet standing in for the compute platform, sized to the
/// recorded node count so the first cycle sees the fleet it left behind.
fn simulated_fleet(config: &FleetConfig, store: &StateStore) -> anyhow::Result<Arc<SimulatedFleet>> {
    let state = store
        .read_state(&config.cluster.id)
        .with_context(|| format!("reading state for {}", config.cluster.id))?;
    let nodes = if state.initialized {
        state.node_count
    } else {
        config.cluster.min_nodes
    };

    let fleet = Arc::new(SimulatedFleet::new());
    let zones = &config.placement.zones;
    for i in 0..nodes as usize {
        let class = if i % 2 == 0 {
            LifecycleClass::Spot
        } else {
            LifecycleClass::OnDemand
        };
        fleet.seed_node(&zones[i % zones.len()], class);
    }
    info!(nodes, recorded = state.initialized, "simulated fleet seeded");
    Ok(fleet)
}

async fn run_loop(orchestrator: Orchestrator, config: &FleetConfig) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
        }
        let _ = shutdown_tx.send(true);
    });

    info!(
        cluster = %config.cluster.id,
        interval_secs = config.schedule.interval_duration().as_secs(),
        adaptive = config.schedule.adaptive,
        "nodefleetd started"
    );

    let mut delay = Duration::ZERO;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let now = epoch_secs();
                let result = orchestrator.run_cycle(now).await;
                log_result(&result);
                delay = schedule_next(&orchestrator, config, now);
                debug!(next_in_secs = delay.as_secs(), "next cycle scheduled");
            }
            _ = shutdown_rx.changed() => {
                info!("nodefleetd shutting down");
                break;
            }
        }
    }
}

/// Pick the delay before the next cycle from recent activity.
fn schedule_next(orchestrator: &Orchestrator, config: &FleetConfig, now: u64) -> Duration {
    if !config.schedule.adaptive {
        return config.schedule.interval_duration();
    }
    let store = orchestrator.store();
    let cluster_id = &orchestrator.settings().cluster_id;
    let assessed = store
        .list_events(cluster_id, 50)
        .and_then(|events| store.read_state(cluster_id).map(|state| (events, state)));
    match assessed {
        Ok((events, state)) => {
            let level = assess_activity(&events, &state.metrics_history, now);
            next_interval(level, &config.schedule)
        }
        Err(e) => {
            warn!(error = %e, "activity assessment failed, using base interval");
            config.schedule.interval_duration()
        }
    }
}

fn log_result(result: &CycleResult) {
    match &result.outcome {
        CycleOutcome::Failed { error } => {
            error!(cluster = %result.cluster_id, phase = %result.phase, %error, "cycle failed")
        }
        CycleOutcome::LockHeld => debug!(cluster = %result.cluster_id, "lock held elsewhere"),
        outcome => info!(
            cluster = %result.cluster_id,
            node_count = result.node_count,
            cached = result.used_cached_metrics,
            ?outcome,
            "cycle finished"
        ),
    }
}

fn release_lock(config: &FleetConfig, force: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let cluster_id = &config.cluster.id;
    let state = store.read_state(cluster_id)?;
    let Some(holder) = state.lock_holder.as_deref() else {
        println!("{cluster_id}: not locked");
        return Ok(());
    };

    if force {
        store.release_lock(cluster_id)?;
        warn!(cluster = %cluster_id, %holder, "lock force-released");
        println!("{cluster_id}: released lock held by {holder}");
        return Ok(());
    }

    let ttl = config.lock.ttl_duration().as_secs();
    if !state.lock_expired(epoch_secs(), ttl) {
        bail!("{cluster_id}: lock held by {holder} is still live (ttl {ttl}s); use --force to override");
    }
    if store.force_clear_stale_lock(cluster_id, holder, state.lock_acquired_at)? {
        println!("{cluster_id}: cleared stale lock held by {holder}");
    } else {
        println!("{cluster_id}: lock changed hands, nothing cleared");
    }
    Ok(())
}

fn init_config(path: &Path, cluster: Option<&str>, prometheus_url: &str, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists; use --force to overwrite", path.display());
    }
    let config = FleetConfig::scaffold(cluster.unwrap_or("node-fleet-cluster"), prometheus_url);
    config.validate()?;
    std::fs::write(path, config.to_toml_string()?)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

fn format_ts(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}
