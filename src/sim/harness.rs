//! Simulation harness: runs print jobs and slicing requests against a fleet
//! of simulated drivers and reports how they ended.

use async_trait::async_trait;
use clap::Parser;
use fleet_shared::api_models::{StartJobRequest, SubmitSlicingRequest};
use fleet_shared::config::{FleetConfig, load_config};
use fleet_shared::{JobStatus, QueueStatus, SystemClock, channel_bus};
use fleet_simulator::{SimFleet, SimOptions};
use printfleet::gcode_source::InMemoryGcodeSource;
use printfleet::notify::TracingNotifier;
use printfleet::repository::InMemoryQueueRepository;
use printfleet::runtime::{FleetHost, HostPorts};
use printfleet::scheduler::engine::{
    SliceContext, SliceJob, SlicingEngine, SlicingEngineError, SlicingOutput,
};
use printfleet::stream_tracker::InMemoryOffsetStore;
use serde::Serialize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const PROGRAM_REF: &str = "harness.gcode";

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(
    name = "sim-harness",
    about = "Drives simulated printers through print jobs and slicing requests."
)]
struct Cli {
    /// Path to a TOML config file (overrides defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of simulated drivers; each gets one print job
    #[arg(long, default_value_t = 3)]
    drivers: usize,

    /// G-code lines per print job
    #[arg(long, default_value_t = 200)]
    lines: usize,

    /// Slicing requests to submit
    #[arg(long, default_value_t = 4)]
    slices: usize,

    /// Simulated slicing time per request, in milliseconds
    #[arg(long, default_value_t = 500)]
    slice_ms: u64,

    /// Base delay before each driver response, in milliseconds
    #[arg(long, default_value_t = 2)]
    response_delay_ms: u64,

    /// Random extra response delay, up to this many milliseconds
    #[arg(long, default_value_t = 3)]
    jitter_ms: u64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120)]
    timeout_secs: u64,

    /// Write a JSON report here
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Log level: error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Slicer stand-in that sleeps and reports progress in fifths.
struct TimedSlicer {
    duration: Duration,
}

#[async_trait]
impl SlicingEngine for TimedSlicer {
    async fn slice(
        &self,
        job: SliceJob,
        ctx: SliceContext,
    ) -> Result<SlicingOutput, SlicingEngineError> {
        let step = self.duration / 5;
        for pct in [20u8, 40, 60, 80, 100] {
            tokio::select! {
                _ = tokio::time::sleep(step) => ctx.progress.report(pct).await,
                _ = ctx.cancel.cancelled() => return Err(SlicingEngineError::Cancelled),
            }
        }
        Ok(SlicingOutput {
            result_ref: format!("sim://{}-{}.gcode", job.entry_id, job.attempt),
        })
    }
}

#[derive(Serialize, Debug)]
struct JobSummary {
    id: String,
    printer: String,
    status: JobStatus,
    progress_lines: u64,
    total_lines: u64,
    executed_lines: u64,
}

#[derive(Serialize, Debug)]
struct SliceSummary {
    id: String,
    status: QueueStatus,
    attempt: u32,
    result_ref: Option<String>,
    error_message: Option<String>,
}

#[derive(Serialize, Debug)]
struct Report {
    elapsed_ms: u128,
    timed_out: bool,
    jobs: Vec<JobSummary>,
    slices: Vec<SliceSummary>,
}

fn program(lines: usize) -> String {
    let mut gcode = String::from("; generated by sim-harness\nG28\nM104 S210\nM140 S60\n");
    for i in 0..lines.saturating_sub(3) {
        let z = 0.2 * (1 + i / 50) as f64;
        let (x, y, e) = (i % 200, (i * 7) % 200, i as f64 * 0.05);
        gcode.push_str(&format!("G1 X{x} Y{y} Z{z:.1} E{e:.2} F3000\n"));
    }
    gcode
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let level = tracing::Level::from_str(&cli.log_level)
        .map_err(|e| format!("invalid --log-level '{}': {}", cli.log_level, e))?;
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => FleetConfig::default(),
    };

    let gcode = Arc::new(InMemoryGcodeSource::new());
    gcode.insert(PROGRAM_REF, &program(cli.lines)).await;

    let bus = channel_bus();
    let options = SimOptions {
        heartbeat_interval: Duration::from_millis(500),
        response_delay: Duration::from_millis(cli.response_delay_ms),
        response_jitter: Duration::from_millis(cli.jitter_ms),
    };
    let fleet = SimFleet::spawn(bus.agent, SimFleet::numbered(cli.drivers), options);

    let host = FleetHost::start(
        &config,
        HostPorts {
            transport: Arc::new(bus.transport),
            inbound: bus.inbound,
            gcode,
            offsets: Arc::new(InMemoryOffsetStore::default()),
            repository: Arc::new(InMemoryQueueRepository::new()),
            engine: Arc::new(TimedSlicer {
                duration: Duration::from_millis(cli.slice_ms),
            }),
            converter: None,
            notifier: Arc::new(TracingNotifier),
            clock: Arc::new(SystemClock),
        },
    );

    // Drivers are only dispatchable once their first heartbeat is in.
    for driver in fleet.drivers() {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !host.registry.is_alive(&driver).await {
            if Instant::now() > deadline {
                return Err(format!("driver {driver} never came online").into());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    let started = Instant::now();
    for i in 0..cli.slices {
        host.scheduler
            .enqueue(SubmitSlicingRequest {
                model_ref: format!("model-{i}.stl"),
                slicing_property_ref: "pla-0.2mm".to_string(),
                submitter_id: "sim-harness".to_string(),
                priority: Some((i % 10) as u8 + 1),
            })
            .await?;
    }
    for driver in host.registry.drivers().await {
        host.lifecycle
            .start_job(StartJobRequest {
                printer_ref: driver,
                gcode_ref: PROGRAM_REF.to_string(),
                start_offset_line: None,
            })
            .await?;
    }

    let deadline = started + Duration::from_secs(cli.timeout_secs);
    let timed_out = loop {
        let jobs_done = host.lifecycle.list().await.iter().all(|j| j.status.is_terminal());
        let slices_done = host.scheduler.list().await?.iter().all(|e| e.status.is_terminal());
        if jobs_done && slices_done {
            break false;
        }
        if Instant::now() > deadline {
            tracing::warn!("Harness timed out before every job finished");
            break true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    let mut jobs = Vec::new();
    for job in host.lifecycle.list().await {
        let executed_lines = fleet
            .driver(&job.printer_ref)
            .map(|d| d.executed_lines())
            .unwrap_or(0);
        jobs.push(JobSummary {
            id: job.id.to_string(),
            printer: job.printer_ref.to_string(),
            status: job.status,
            progress_lines: job.progress_lines,
            total_lines: job.total_lines,
            executed_lines,
        });
    }
    let slices = host
        .scheduler
        .list()
        .await?
        .into_iter()
        .map(|e| SliceSummary {
            id: e.id.to_string(),
            status: e.status,
            attempt: e.attempt,
            result_ref: e.result_ref,
            error_message: e.error_message,
        })
        .collect();
    let report = Report {
        elapsed_ms: started.elapsed().as_millis(),
        timed_out,
        jobs,
        slices,
    };

    for job in &report.jobs {
        println!(
            "job {} on {}: {} ({}/{} lines, {} executed)",
            job.id, job.printer, job.status, job.progress_lines, job.total_lines, job.executed_lines
        );
    }
    for slice in &report.slices {
        println!("slice {}: {} (attempt {})", slice.id, slice.status, slice.attempt);
    }
    println!("finished in {} ms", report.elapsed_ms);

    if let Some(path) = &cli.report {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        tracing::info!("Report written to {}", path.display());
    }

    host.shutdown().await;
    fleet.shutdown().await;
    if timed_out {
        return Err("simulation did not finish in time".into());
    }
    Ok(())
}
