//! Wires the fleet components together and owns their background loops.

use chrono::{DateTime, Utc};
use fleet_shared::config::FleetConfig;
use fleet_shared::protocol::Inbound;
use fleet_shared::{AgentTransport, Clock};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatcher::PrinterCommandDispatcher;
use crate::gcode_source::GcodeSource;
use crate::lifecycle::JobLifecycleManager;
use crate::notify::AlertNotifier;
use crate::registry::DriverLinkRegistry;
use crate::repository::QueueRepository;
use crate::scheduler::converter::ModelConverter;
use crate::scheduler::engine::SlicingEngine;
use crate::scheduler::{SchedulerDeps, SlicingQueueScheduler};
use crate::stream_tracker::{OffsetStore, ResumableStreamTracker};
use crate::web::{AppState, create_router};

/// Adapters the host is built from.
pub struct HostPorts {
    pub transport: Arc<dyn AgentTransport>,
    pub inbound: UnboundedReceiver<Inbound>,
    pub gcode: Arc<dyn GcodeSource>,
    pub offsets: Arc<dyn OffsetStore>,
    pub repository: Arc<dyn QueueRepository>,
    pub engine: Arc<dyn SlicingEngine>,
    pub converter: Option<Arc<dyn ModelConverter>>,
    pub notifier: Arc<dyn AlertNotifier>,
    pub clock: Arc<dyn Clock>,
}

/// A running fleet: dispatcher, job lifecycle and slicing queue plus the
/// tasks that feed them.
pub struct FleetHost {
    pub registry: Arc<DriverLinkRegistry>,
    pub dispatcher: PrinterCommandDispatcher,
    pub tracker: Arc<ResumableStreamTracker>,
    pub lifecycle: JobLifecycleManager,
    pub scheduler: SlicingQueueScheduler,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl FleetHost {
    /// Builds every component and spawns the background loops. Must be
    /// called from inside a tokio runtime.
    pub fn start(config: &FleetConfig, ports: HostPorts) -> Self {
        let clock = ports.clock.clone();
        let registry = Arc::new(DriverLinkRegistry::new(
            ports.clock.clone(),
            config.dispatcher.liveness_window(),
            config.check.criteria(),
        ));
        let (dispatcher, events) = PrinterCommandDispatcher::new(
            &config.dispatcher,
            ports.transport,
            registry.clone(),
            ports.clock.clone(),
        );
        let tracker = Arc::new(ResumableStreamTracker::new(ports.offsets));
        let lifecycle = JobLifecycleManager::new(
            config.lifecycle.clone(),
            dispatcher.clone(),
            ports.gcode,
            tracker.clone(),
            ports.notifier,
            ports.clock.clone(),
        );
        let scheduler = SlicingQueueScheduler::new(
            config.scheduler.clone(),
            std::time::Duration::from_secs(config.converter.timeout_secs),
            SchedulerDeps {
                repository: ports.repository,
                engine: ports.engine,
                converter: ports.converter,
                clock: ports.clock,
            },
        );

        let (shutdown, _) = broadcast::channel(4);
        let mut tasks = Vec::new();

        let router = dispatcher.clone();
        let mut inbound = ports.inbound;
        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = inbound.recv() => match message {
                        Some(message) => router.handle_inbound(message).await,
                        None => {
                            tracing::warn!("inbound bus closed");
                            break;
                        }
                    },
                    _ = stop.recv() => break,
                }
            }
        }));

        let watcher = dispatcher.clone();
        let poll = config.dispatcher.liveness_poll();
        let mut stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        watcher.sweep_liveness().await;
                        watcher.poll_checks();
                    }
                    _ = stop.recv() => break,
                }
            }
        }));

        let signals = lifecycle.clone();
        let stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move { signals.run_signals(events, stop).await }));

        let queue = scheduler.clone();
        let stop = shutdown.subscribe();
        tasks.push(tokio::spawn(async move { queue.run(stop).await }));

        if let Some(max_age) = config.retention.max_age() {
            let scheduler = scheduler.clone();
            let lifecycle = lifecycle.clone();
            let every = config.retention.sweep_interval();
            let mut stop = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(every);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            let cutoff = clock.now() - max_age;
                            purge_expired(&scheduler, &lifecycle, cutoff).await;
                        }
                        _ = stop.recv() => break,
                    }
                }
            }));
        }

        tracing::info!("fleet host started");
        Self {
            registry,
            dispatcher,
            tracker,
            lifecycle,
            scheduler,
            shutdown,
            tasks,
        }
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.scheduler.clone(), self.lifecycle.clone())
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.app_state())
    }

    /// Drops queue entries and print jobs that finished before `older_than`.
    pub async fn purge_finished(&self, older_than: DateTime<Utc>) -> usize {
        purge_expired(&self.scheduler, &self.lifecycle, older_than).await
    }

    /// Receiver that fires when [`shutdown`](Self::shutdown) is called.
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        self.dispatcher.shutdown();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {}", e);
            }
        }
        tracing::info!("fleet host stopped");
    }
}

async fn purge_expired(
    scheduler: &SlicingQueueScheduler,
    lifecycle: &JobLifecycleManager,
    older_than: DateTime<Utc>,
) -> usize {
    let entries = match scheduler.purge_terminal(older_than).await {
        Ok(purged) => purged,
        Err(e) => {
            tracing::warn!("queue retention sweep failed: {}", e);
            0
        }
    };
    entries + lifecycle.purge_finished(older_than).await
}
