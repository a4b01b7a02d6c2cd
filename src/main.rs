use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tableload::config::LoadConfig;
use tableload::counters::FleetCounters;
use tableload::flood::{resolve_target, run_flood, HttpProbe, Probe, ProbeOutcome};
use tableload::harness::run_fleet;
use tableload::transport::Connection;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to tableload.toml configuration file
    #[arg(short, long, default_value = "./tableload.toml")]
    config: PathBuf,

    /// Override log level (trace|debug|info|warn|error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register players, join games and play all-in then fold
    Play(FleetArgs),
    /// Register players and disconnect
    Register(FleetArgs),
    /// Send GET requests to one URL from many workers for a fixed duration
    Flood(FloodArgs),
}

#[derive(ClapArgs, Debug)]
struct FleetArgs {
    /// Game server address (host:port)
    #[arg(short, long)]
    server: Option<String>,

    /// Number of player sessions to launch
    #[arg(short, long)]
    players: Option<u64>,

    /// Maximum simultaneously active sessions
    #[arg(short = 'n', long)]
    concurrency: Option<usize>,

    /// Id of the first player
    #[arg(long)]
    first_id: Option<u64>,
}

#[derive(ClapArgs, Debug)]
struct FloodArgs {
    /// Target URL (plain http)
    #[arg(short, long)]
    url: Option<String>,

    /// Number of concurrent workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run length in seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Flood the game this player sits in, found through the game listing at the URL
    #[arg(short, long)]
    player: Option<String>,
}

fn apply_fleet_args(config: &mut LoadConfig, args: &FleetArgs) {
    if let Some(server) = &args.server {
        config.target.tcp_address = server.clone();
    }
    if let Some(players) = args.players {
        config.fleet.players = players;
    }
    if let Some(concurrency) = args.concurrency {
        config.fleet.max_concurrency = concurrency;
    }
    if let Some(first_id) = args.first_id {
        config.fleet.first_id = first_id;
    }
}

fn apply_flood_args(config: &mut LoadConfig, args: &FloodArgs) {
    if let Some(url) = &args.url {
        config.target.http_url = url.clone();
    }
    if let Some(workers) = args.workers {
        config.flood.workers = workers;
    }
    if let Some(duration) = args.duration {
        config.flood.duration_secs = duration;
    }
    if let Some(player) = &args.player {
        config.flood.target_player = Some(player.clone());
    }
}

/// Console output plus an optional JSON log file. The returned guard flushes
/// the file writer when dropped.
fn init_tracing(level: &str, file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match file {
        Some(path) => {
            let name = path
                .file_name()
                .with_context(|| format!("Log file path {} has no file name", path.display()))?;
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::NEVER)
                .filename_prefix(name.to_string_lossy().into_owned())
                .build(dir)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Stop signal flipped by Ctrl-C.
fn stop_on_ctrl_c() -> watch::Receiver<bool> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work before reporting");
            let _ = stop_tx.send(true);
        }
    });
    stop_rx
}

/// The run cannot start if the game server is unreachable.
async fn preflight_tcp(config: &LoadConfig) -> Result<()> {
    let address = &config.target.tcp_address;
    let timeout = config.connect_timeout();
    let mut conn = Connection::open(address, timeout, timeout)
        .await
        .with_context(|| format!("Cannot reach game server at {}", address))?;
    conn.close().await;
    info!("Game server at {} is reachable", address);
    Ok(())
}

async fn run_fleet_mode(config: LoadConfig) -> Result<()> {
    preflight_tcp(&config).await?;

    let settings = config.fleet_settings();
    info!(
        "Mode: {}, players {} from id {}, concurrency {}",
        if settings.session.register_only { "register" } else { "play" },
        settings.players,
        settings.first_id,
        settings.max_concurrency
    );

    let counters = Arc::new(FleetCounters::new());
    let report = run_fleet(settings, counters.clone(), stop_on_ctrl_c()).await;

    println!("\n--- Load Test Summary ---");
    println!("{}", report);
    println!("{}", counters.snapshot());
    Ok(())
}

async fn run_flood_mode(config: LoadConfig) -> Result<()> {
    let discovery = config.discovery_settings();
    if let Some(settings) = &discovery {
        info!(
            "Looking for player {} in {} ({} attempts)",
            settings.player_id, config.target.http_url, settings.attempts
        );
    }
    let target = resolve_target(
        &config.target.http_url,
        discovery.as_ref(),
        config.request_timeout(),
    )
    .await
    .context("Failed to find a target game")?;

    let probe = HttpProbe::new(&target, config.request_timeout()).context("Invalid flood target")?;

    match probe
        .probe()
        .await
        .with_context(|| format!("Cannot reach {}", target))?
    {
        ProbeOutcome::Success => info!("Target {} answered 200", probe.uri()),
        ProbeOutcome::Rejected(status) => {
            warn!("Target {} answered {} before the run", probe.uri(), status)
        }
    }

    let counters = Arc::new(FleetCounters::new());
    let report = run_flood(
        Arc::new(probe),
        config.flood_settings(),
        counters.clone(),
        stop_on_ctrl_c(),
    )
    .await;

    let snapshot = counters.snapshot();
    println!("\n--- Flood Summary ---");
    println!("{}", report);
    println!("Requests sent: {}", snapshot.requests_sent);
    println!("Requests succeeded (200 OK): {}", snapshot.requests_succeeded);
    println!("Requests failed: {}", snapshot.requests_failed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        LoadConfig::load(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        LoadConfig::default()
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    let _log_guard = init_tracing(&log_level, config.logging.file.as_deref())?;

    info!("Starting tableload v{}", env!("CARGO_PKG_VERSION"));
    if config_found {
        info!("Configuration loaded from: {}", args.config.display());
    } else {
        info!("No config at {}, using defaults", args.config.display());
    }

    match &args.command {
        Command::Play(fleet) => apply_fleet_args(&mut config, fleet),
        Command::Register(fleet) => {
            apply_fleet_args(&mut config, fleet);
            config.fleet.register_only = true;
        }
        Command::Flood(flood) => apply_flood_args(&mut config, flood),
    }
    match args.command {
        Command::Play(_) | Command::Register(_) => {
            config.validate_fleet().context("Invalid configuration")?;
            run_fleet_mode(config).await
        }
        Command::Flood(_) => {
            config.validate_flood().context("Invalid configuration")?;
            run_flood_mode(config).await
        }
    }
}
