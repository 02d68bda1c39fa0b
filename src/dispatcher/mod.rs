//! Printer command dispatcher.
//!
//! Every driver gets its own worker task (see [`worker`]) holding a
//! priority-then-FIFO queue and at most one command on the wire. Submitters
//! get a [`CommandReceipt`] back immediately and await the outcome when they
//! care about it. Everything the lifecycle manager needs to react to (failed
//! commands, liveness changes, telemetry, agent faults) is published on the
//! [`DispatcherEvent`] channel returned by [`PrinterCommandDispatcher::new`].

pub mod backoff;
pub mod check;
mod queue;
mod worker;

use fleet_shared::config::DispatcherConfig;
use fleet_shared::protocol::{
    AgentException, AgentStatus, CheckCriteria, CheckResponse, CommandPayload, CommandResponse,
    Heartbeat, Inbound, Telemetry,
};
use fleet_shared::{AgentTransport, Clock, DriverRef, JobId, RequestId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::oneshot;

pub use backoff::RetryPolicy;
pub use check::CheckTrigger;
pub use queue::{CommandAck, InFlightCommand};
pub use worker::{DriverQueueSnapshot, InFlightView};

use crate::error::FleetError;
use crate::registry::{DriverLinkRegistry, LivenessChange};
use queue::QueuedCommand;
use worker::{WorkerDeps, WorkerMsg};

/// Signals consumed by the job lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatcherEvent {
    CommandFailed {
        driver: DriverRef,
        request_id: RequestId,
        job: Option<JobId>,
        reason: String,
        timed_out: bool,
    },
    LivenessLost {
        driver: DriverRef,
        job: Option<JobId>,
    },
    LivenessRestored {
        driver: DriverRef,
        job: Option<JobId>,
    },
    Telemetry {
        driver: DriverRef,
        job: Option<JobId>,
        telemetry: Telemetry,
    },
    Fault {
        driver: DriverRef,
        job: Option<JobId>,
        fatal: bool,
        exceptions: Vec<AgentException>,
    },
}

/// Handed back by [`PrinterCommandDispatcher::send_command`].
#[derive(Debug)]
pub struct CommandReceipt {
    pub request_id: RequestId,
    pub driver: DriverRef,
    rx: oneshot::Receiver<Result<CommandAck, FleetError>>,
}

impl CommandReceipt {
    /// Waits for the command to be acknowledged, rejected, or to run out of
    /// retries.
    pub async fn outcome(self) -> Result<CommandAck, FleetError> {
        self.rx.await.unwrap_or(Err(FleetError::Shutdown))
    }
}

struct WorkerHandle {
    tx: UnboundedSender<WorkerMsg>,
    last_request_id: Mutex<u64>,
}

struct Inner {
    transport: Arc<dyn AgentTransport>,
    registry: Arc<DriverLinkRegistry>,
    clock: Arc<dyn Clock>,
    events: UnboundedSender<DispatcherEvent>,
    policy: RetryPolicy,
    workers: Mutex<HashMap<DriverRef, Arc<WorkerHandle>>>,
}

#[derive(Clone)]
pub struct PrinterCommandDispatcher {
    inner: Arc<Inner>,
}

impl PrinterCommandDispatcher {
    pub fn new(
        config: &DispatcherConfig,
        transport: Arc<dyn AgentTransport>,
        registry: Arc<DriverLinkRegistry>,
        clock: Arc<dyn Clock>,
    ) -> (Self, UnboundedReceiver<DispatcherEvent>) {
        let (events, events_rx) = unbounded_channel();
        let dispatcher = Self {
            inner: Arc::new(Inner {
                transport,
                registry,
                clock,
                events,
                policy: RetryPolicy::from_config(config),
                workers: Mutex::new(HashMap::new()),
            }),
        };
        (dispatcher, events_rx)
    }

    pub fn registry(&self) -> &Arc<DriverLinkRegistry> {
        &self.inner.registry
    }

    /// Queues a command for `driver`. Returns as soon as the command is
    /// queued; delivery happens on the driver's worker.
    pub async fn send_command(
        &self,
        driver: &DriverRef,
        payload: CommandPayload,
        priority: u8,
        job: Option<JobId>,
    ) -> Result<CommandReceipt, FleetError> {
        if !self.inner.registry.is_alive(driver).await {
            return Err(FleetError::DriverUnavailable(driver.clone()));
        }
        let handle = self.worker_for(driver);
        let (completion, rx) = oneshot::channel();

        // Id assignment and the hand-off share one lock so ids reach the
        // worker in increasing order.
        let request_id = {
            let mut last = handle.last_request_id.lock().unwrap_or_else(|e| e.into_inner());
            *last += 1;
            let request_id = RequestId(*last);
            let command = QueuedCommand {
                request_id,
                payload,
                priority,
                job,
                submitted_at: self.inner.clock.now(),
                completion,
            };
            handle
                .tx
                .send(WorkerMsg::Submit(command))
                .map_err(|_| FleetError::Shutdown)?;
            request_id
        };

        tracing::debug!(%driver, %request_id, priority, "command queued");
        Ok(CommandReceipt {
            request_id,
            driver: driver.clone(),
            rx,
        })
    }

    /// Routes one message from the bus.
    pub async fn handle_inbound(&self, message: Inbound) {
        match message {
            Inbound::Heartbeat(heartbeat) => self.on_heartbeat(heartbeat).await,
            Inbound::CommandResponse(response) => self.on_command_response(response),
            Inbound::CheckResponse(response) => self.on_check_response(response).await,
        }
    }

    pub fn on_command_response(&self, response: CommandResponse) {
        let Some(handle) = self.existing_worker(&response.driver) else {
            tracing::debug!(
                driver = %response.driver,
                request_id = %response.request_id,
                "response from driver without a worker, discarded"
            );
            return;
        };
        let _ = handle.tx.send(WorkerMsg::Response(response));
    }

    pub async fn on_heartbeat(&self, heartbeat: Heartbeat) {
        if heartbeat.status == AgentStatus::Error {
            tracing::warn!(driver = %heartbeat.driver, "driver reports error status");
        }
        self.record_contact(&heartbeat.driver).await;
        self.worker_for(&heartbeat.driver);
    }

    /// A check response counts as contact, then fans out telemetry and any
    /// reported exceptions. Fatal exceptions take precedence.
    pub async fn on_check_response(&self, response: CheckResponse) {
        let driver = response.driver;
        self.record_contact(&driver).await;
        let job = match response.job_ref {
            Some(job) => Some(job),
            None => self.inner.registry.active_job(&driver).await,
        };

        let fatal: Vec<AgentException> = response.telemetry.fatal_exceptions().cloned().collect();
        let recoverable: Vec<AgentException> =
            response.telemetry.recoverable_exceptions().cloned().collect();

        self.emit(DispatcherEvent::Telemetry {
            driver: driver.clone(),
            job,
            telemetry: response.telemetry,
        });
        if !fatal.is_empty() {
            tracing::error!(%driver, count = fatal.len(), "fatal exceptions reported");
            self.emit(DispatcherEvent::Fault {
                driver,
                job,
                fatal: true,
                exceptions: fatal,
            });
        } else if !recoverable.is_empty() {
            tracing::warn!(%driver, count = recoverable.len(), "recoverable exceptions reported");
            self.emit(DispatcherEvent::Fault {
                driver,
                job,
                fatal: false,
                exceptions: recoverable,
            });
        }
    }

    /// Asks every worker whether its time-based check is due.
    pub fn poll_checks(&self) {
        for handle in self.all_workers() {
            let _ = handle.tx.send(WorkerMsg::PollCheck);
        }
    }

    /// Emits `LivenessLost` for drivers that went quiet.
    pub async fn sweep_liveness(&self) {
        for change in self.inner.registry.sweep().await {
            self.emit_liveness(change);
        }
    }

    pub async fn attach_job(&self, driver: &DriverRef, job: JobId) -> Result<(), FleetError> {
        self.inner.registry.set_active_job(driver, Some(job)).await
    }

    /// Clears the binding only if `job` is still the bound one.
    pub async fn detach_job(&self, driver: &DriverRef, job: JobId) -> Result<(), FleetError> {
        if self.inner.registry.active_job(driver).await == Some(job) {
            self.inner.registry.set_active_job(driver, None).await?;
        }
        Ok(())
    }

    pub async fn set_check_criteria(
        &self,
        driver: &DriverRef,
        criteria: CheckCriteria,
    ) -> Result<(), FleetError> {
        self.inner.registry.set_check_criteria(driver, criteria).await
    }

    /// Drops the driver's link and stops its worker. Pending commands resolve
    /// with [`FleetError::Shutdown`].
    pub async fn forget_driver(&self, driver: &DriverRef) -> Result<bool, FleetError> {
        let removed = self.inner.registry.forget(driver).await?;
        let handle = self.lock_workers().remove(driver);
        if let Some(handle) = handle {
            let _ = handle.tx.send(WorkerMsg::Shutdown);
        }
        Ok(removed)
    }

    pub async fn snapshot(&self, driver: &DriverRef) -> Option<DriverQueueSnapshot> {
        let handle = self.existing_worker(driver)?;
        let (tx, rx) = oneshot::channel();
        handle.tx.send(WorkerMsg::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let workers: Vec<Arc<WorkerHandle>> = self.lock_workers().drain().map(|(_, h)| h).collect();
        tracing::info!(workers = workers.len(), "stopping driver workers");
        for handle in workers {
            let _ = handle.tx.send(WorkerMsg::Shutdown);
        }
    }

    async fn record_contact(&self, driver: &DriverRef) {
        if let Some(change) = self.inner.registry.record_heartbeat(driver).await {
            self.emit_liveness(change);
        }
    }

    fn emit_liveness(&self, change: LivenessChange) {
        let event = match change {
            LivenessChange::Lost { driver, active_job } => {
                tracing::warn!(%driver, job = ?active_job, "driver liveness lost");
                DispatcherEvent::LivenessLost { driver, job: active_job }
            }
            LivenessChange::Restored { driver, active_job } => {
                tracing::info!(%driver, job = ?active_job, "driver liveness restored");
                DispatcherEvent::LivenessRestored { driver, job: active_job }
            }
        };
        self.emit(event);
    }

    fn emit(&self, event: DispatcherEvent) {
        if self.inner.events.send(event).is_err() {
            tracing::trace!("no dispatcher event listener");
        }
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<DriverRef, Arc<WorkerHandle>>> {
        self.inner.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn existing_worker(&self, driver: &DriverRef) -> Option<Arc<WorkerHandle>> {
        self.lock_workers().get(driver).cloned()
    }

    fn all_workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.lock_workers().values().cloned().collect()
    }

    fn worker_for(&self, driver: &DriverRef) -> Arc<WorkerHandle> {
        let mut workers = self.lock_workers();
        if let Some(handle) = workers.get(driver) {
            return handle.clone();
        }
        let deps = WorkerDeps {
            transport: self.inner.transport.clone(),
            registry: self.inner.registry.clone(),
            clock: self.inner.clock.clone(),
            events: self.inner.events.clone(),
            policy: self.inner.policy,
        };
        let handle = Arc::new(WorkerHandle {
            tx: worker::spawn(driver.clone(), deps),
            last_request_id: Mutex::new(0),
        });
        workers.insert(driver.clone(), handle.clone());
        handle
    }
}
