// src/main.rs - fleet host: HTTP API over the slicing queue and print jobs

use clap::Parser;
use fleet_shared::config::{FleetConfig, load_config};
use fleet_shared::{SystemClock, channel_bus};
use fleet_simulator::{SimFleet, SimOptions};
use printfleet::gcode_source::FileGcodeSource;
use printfleet::notify::TracingNotifier;
use printfleet::repository::InMemoryQueueRepository;
use printfleet::runtime::{FleetHost, HostPorts};
use printfleet::scheduler::engine::{ProcessSlicingEngine, SlicingEngine, UnconfiguredSlicingEngine};
use printfleet::stream_tracker::{InMemoryOffsetStore, JsonFileOffsetStore, OffsetStore};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Parser, Debug)]
#[command(name = "fleet-host", about = "Slicing queue and print job host for a printer fleet.")]
struct Args {
    /// Path to the TOML configuration file; defaults apply when omitted
    config: Option<PathBuf>,

    /// Address to serve the HTTP API on (overrides server.bind)
    #[arg(long)]
    bind: Option<String>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Attach this many simulated driver agents (sim-0, sim-1, ...)
    #[arg(long, default_value_t = 0)]
    sim_drivers: usize,

    /// Persist stream offsets to this JSON file instead of memory
    #[arg(long)]
    offsets: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    let level = tracing::Level::from_str(&args.log_level)
        .map_err(|e| format!("invalid --log-level '{}': {}", args.log_level, e))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    tracing::info!("Starting printfleet host");

    let config = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            load_config(path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path.display(), e);
                Box::new(e) as BoxError
            })?
        }
        None => {
            tracing::info!("No configuration file given, using defaults");
            FleetConfig::default()
        }
    };

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let engine: Arc<dyn SlicingEngine> = match ProcessSlicingEngine::from_config(&config.slicer) {
        Some(engine) => Arc::new(engine),
        None => {
            tracing::warn!("No slicer program configured; slicing requests will fail");
            Arc::new(UnconfiguredSlicingEngine)
        }
    };
    let offsets: Arc<dyn OffsetStore> = match &args.offsets {
        Some(path) => Arc::new(JsonFileOffsetStore::open(path).await?),
        None => Arc::new(InMemoryOffsetStore::default()),
    };

    let bus = channel_bus();
    let drivers = SimFleet::numbered(args.sim_drivers);
    let fleet = SimFleet::spawn(bus.agent, drivers, SimOptions::default());
    if args.sim_drivers == 0 {
        tracing::warn!("No driver agents attached; every printer will report unavailable");
    }

    let host = FleetHost::start(
        &config,
        HostPorts {
            transport: Arc::new(bus.transport),
            inbound: bus.inbound,
            gcode: Arc::new(FileGcodeSource::new(config.gcode.root.clone())),
            offsets,
            repository: Arc::new(InMemoryQueueRepository::new()),
            engine,
            converter: None,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        },
    );

    let app = host.router();
    let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Web API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown requested");
        })
        .await?;

    host.shutdown().await;
    fleet.shutdown().await;
    Ok(())
}
