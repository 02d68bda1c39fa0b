// Shared rig for the cross-component tests: a FleetHost wired to a simulated
// fleet over the in-process bus, with a manual wall clock.
#![allow(dead_code)]

use async_trait::async_trait;
use fleet_shared::api_models::JobView;
use fleet_shared::config::FleetConfig;
use fleet_shared::{DriverRef, JobId, JobStatus, ManualClock, channel_bus};
use fleet_simulator::{SimFleet, SimOptions};
use printfleet::gcode_source::InMemoryGcodeSource;
use printfleet::notify::{Alert, AlertNotifier};
use printfleet::repository::InMemoryQueueRepository;
use printfleet::runtime::{FleetHost, HostPorts};
use printfleet::scheduler::engine::{
    SliceContext, SliceJob, SlicingEngine, SlicingEngineError, SlicingOutput,
};
use printfleet::stream_tracker::InMemoryOffsetStore;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Rig {
    pub host: FleetHost,
    pub fleet: SimFleet,
    pub clock: Arc<ManualClock>,
    pub gcode: Arc<InMemoryGcodeSource>,
    pub alerts: Arc<RecordingNotifier>,
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn alert(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Finishes immediately with a predictable result reference.
pub struct InstantEngine;

#[async_trait]
impl SlicingEngine for InstantEngine {
    async fn slice(
        &self,
        job: SliceJob,
        _ctx: SliceContext,
    ) -> Result<SlicingOutput, SlicingEngineError> {
        Ok(SlicingOutput {
            result_ref: format!("sliced/{}.gcode", job.model_ref),
        })
    }
}

/// Never finishes on its own; only cancellation ends a run.
pub struct HangingEngine;

#[async_trait]
impl SlicingEngine for HangingEngine {
    async fn slice(
        &self,
        _job: SliceJob,
        ctx: SliceContext,
    ) -> Result<SlicingOutput, SlicingEngineError> {
        ctx.cancel.cancelled().await;
        Err(SlicingEngineError::Cancelled)
    }
}

/// Fast timers, checks off, stale sweeps only when a test calls them.
pub fn test_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.dispatcher.command_timeout_ms = 200;
    config.dispatcher.max_retries = 1;
    config.dispatcher.backoff_base_ms = 50;
    config.dispatcher.backoff_max_ms = 200;
    config.dispatcher.liveness_window_secs = 5;
    config.dispatcher.liveness_poll_ms = 20;
    config.check.every_commands = None;
    config.check.every_secs = None;
    config.scheduler.max_concurrent = 2;
    config.scheduler.poll_interval_ms = 20;
    config.scheduler.stale_threshold_secs = 60;
    config.scheduler.sweep_interval_secs = 3600;
    config.scheduler.max_retries = 2;
    config
}

pub fn printer(index: usize) -> DriverRef {
    DriverRef::new(format!("sim-{index}"))
}

/// `lines` distinct moves, one per line.
pub fn program(lines: usize) -> String {
    (0..lines).map(|i| format!("G1 X{i} F1200\n")).collect()
}

pub async fn rig(config: FleetConfig, drivers: usize, engine: Arc<dyn SlicingEngine>) -> Rig {
    let bus = channel_bus();
    let clock = Arc::new(ManualClock::default());
    let gcode = Arc::new(InMemoryGcodeSource::new());
    let alerts = Arc::new(RecordingNotifier::default());
    let options = SimOptions {
        heartbeat_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let fleet = SimFleet::spawn(bus.agent, SimFleet::numbered(drivers), options);
    let host = FleetHost::start(
        &config,
        HostPorts {
            transport: Arc::new(bus.transport),
            inbound: bus.inbound,
            gcode: gcode.clone(),
            offsets: Arc::new(InMemoryOffsetStore::default()),
            repository: Arc::new(InMemoryQueueRepository::new()),
            engine,
            converter: None,
            notifier: alerts.clone(),
            clock: clock.clone(),
        },
    );
    for driver in fleet.drivers() {
        let registry = host.registry.clone();
        wait_until("driver online", || {
            let registry = registry.clone();
            let driver = driver.clone();
            async move { registry.is_alive(&driver).await }
        })
        .await;
    }
    Rig {
        host,
        fleet,
        clock,
        gcode,
        alerts,
    }
}

/// Polls `condition` every 10ms for up to ten seconds.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn wait_for_job<P>(rig: &Rig, id: JobId, what: &str, predicate: P) -> JobView
where
    P: Fn(&JobView) -> bool,
{
    for _ in 0..1000 {
        let view = rig.host.lifecycle.get(id).await.unwrap();
        if predicate(&view) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let view = rig.host.lifecycle.get(id).await.unwrap();
    panic!(
        "timed out waiting for {what}; job is {} at {}/{}",
        view.status, view.progress_lines, view.total_lines
    );
}

pub async fn wait_for_status(rig: &Rig, id: JobId, status: JobStatus) -> JobView {
    wait_for_job(rig, id, &format!("job {status}"), |v| v.status == status).await
}
