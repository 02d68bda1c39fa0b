//! Print job state machine.
//!
//! Each job lives behind its own `tokio::sync::Mutex`; every transition takes
//! that lock, so there is exactly one writer per job at a time. A per-job
//! epoch is bumped whenever streaming must stop (pause, cancel, failure) and
//! the streamer task checks it between lines.

mod streamer;

use chrono::{DateTime, Utc};
use fleet_shared::api_models::{JobView, StartJobRequest};
use fleet_shared::config::LifecycleConfig;
use fleet_shared::protocol::{
    AgentException, CommandPayload, ControlRequest, PRIORITY_CONTROL, PRIORITY_STOP,
};
use fleet_shared::{Clock, DriverRef, JobId, JobStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::dispatcher::{DispatcherEvent, PrinterCommandDispatcher};
use crate::error::FleetError;
use crate::gcode_source::GcodeSource;
use crate::model::{Job, ProgressOutcome};
use crate::notify::{Alert, AlertNotifier};
use crate::stream_tracker::ResumableStreamTracker;

struct JobSlot {
    job: Job,
    epoch: u64,
    lines: Arc<Vec<String>>,
    resume_pending: bool,
    /// Task streaming the current epoch. It may still be waiting on the
    /// outcome of one line after the job has been halted.
    streamer: Option<JoinHandle<()>>,
}

impl JobSlot {
    fn halt(&mut self) {
        self.epoch += 1;
    }
}

struct Inner {
    config: LifecycleConfig,
    dispatcher: PrinterCommandDispatcher,
    gcode: Arc<dyn GcodeSource>,
    tracker: Arc<ResumableStreamTracker>,
    notifier: Arc<dyn AlertNotifier>,
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<JobId, Arc<Mutex<JobSlot>>>>,
    /// Non-terminal job per printer.
    printers: std::sync::Mutex<HashMap<DriverRef, JobId>>,
}

#[derive(Clone)]
pub struct JobLifecycleManager {
    inner: Arc<Inner>,
}

impl JobLifecycleManager {
    pub fn new(
        config: LifecycleConfig,
        dispatcher: PrinterCommandDispatcher,
        gcode: Arc<dyn GcodeSource>,
        tracker: Arc<ResumableStreamTracker>,
        notifier: Arc<dyn AlertNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                dispatcher,
                gcode,
                tracker,
                notifier,
                clock,
                jobs: RwLock::new(HashMap::new()),
                printers: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Creates a job and asks the printer to start it. Returns once the start
    /// request is queued with the dispatcher; the job turns RUNNING when the
    /// printer acknowledges it.
    pub async fn start_job(&self, request: StartJobRequest) -> Result<JobView, FleetError> {
        let printer = request.printer_ref;
        if let Some(existing) = self.active_job_for(&printer) {
            return Err(FleetError::Conflict(format!(
                "printer {printer} already runs job {existing}"
            )));
        }

        let lines = self.inner.gcode.load(&request.gcode_ref).await?;
        let offset = request.start_offset_line.unwrap_or(0);
        let mut job = Job::new(
            printer.clone(),
            request.gcode_ref.clone(),
            lines.len() as u64,
            offset,
            self.inner.clock.now(),
        )?;
        let id = job.id;
        self.reserve_printer(&printer, id)?;

        let start = CommandPayload::Control(ControlRequest::start(id, request.gcode_ref, offset));
        let receipt = match self
            .inner
            .dispatcher
            .send_command(&printer, start, PRIORITY_CONTROL, Some(id))
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                self.release_printer(&printer, id);
                tracing::warn!(%printer, job = %id, "start request refused, job discarded: {}", e);
                return Err(e);
            }
        };

        job.transition(JobStatus::Queued, self.inner.clock.now())?;
        let view = job.view();
        let slot = Arc::new(Mutex::new(JobSlot {
            job,
            epoch: 0,
            lines,
            resume_pending: false,
            streamer: None,
        }));
        self.inner.jobs.write().await.insert(id, slot.clone());

        if let Err(e) = self.inner.dispatcher.attach_job(&printer, id).await {
            tracing::warn!(%printer, job = %id, "could not bind job to driver link: {}", e);
        }
        tracing::info!(%printer, job = %id, total_lines = view.total_lines, offset, "job queued");
        slot.lock().await.streamer = Some(self.spawn_stream(id, 0, Some(receipt)));
        Ok(view)
    }

    /// Applies an acknowledged line count and persists it.
    pub async fn on_progress(
        &self,
        id: JobId,
        lines_sent: u64,
    ) -> Result<ProgressOutcome, FleetError> {
        let slot = self.slot(id).await?;
        let mut slot = slot.lock().await;
        let outcome = slot.job.apply_progress(lines_sent);
        match outcome {
            ProgressOutcome::Applied(line) => {
                self.inner.tracker.persist_offset(id, line).await?;
            }
            ProgressOutcome::Regressed => {
                tracing::warn!(
                    job = %id,
                    reported = lines_sent,
                    current = slot.job.progress_lines,
                    "ignoring progress regression"
                );
            }
            ProgressOutcome::Terminal => {
                tracing::debug!(job = %id, "progress for finished job ignored");
            }
        }
        Ok(outcome)
    }

    /// RUNNING → PAUSED. The printer is asked to pause on a best-effort basis.
    pub async fn pause(&self, id: JobId) -> Result<JobView, FleetError> {
        let slot = self.slot(id).await?;
        let (view, printer) = {
            let mut slot = slot.lock().await;
            if slot.job.status != JobStatus::Running {
                let status = slot.job.status;
                return Err(FleetError::invalid_transition("job", status, JobStatus::Paused));
            }
            slot.job.transition(JobStatus::Paused, self.inner.clock.now())?;
            slot.halt();
            (slot.job.view(), slot.job.printer_ref.clone())
        };
        tracing::info!(job = %id, offset = view.start_offset_line, "job paused");
        self.send_best_effort(&printer, ControlRequest::pause(id), PRIORITY_CONTROL).await;
        Ok(view)
    }

    /// PAUSED → RUNNING once the printer acknowledges a start at the resume
    /// offset. On any failure the job stays PAUSED.
    ///
    /// The offset is fixed only after the previous streamer has settled its
    /// last line, and it is announced again if progress still moves before
    /// the start is acknowledged.
    pub async fn resume(&self, id: JobId) -> Result<JobView, FleetError> {
        let slot_ref = self.slot(id).await?;
        let (printer, gcode_ref, epoch, previous) = {
            let mut slot = slot_ref.lock().await;
            if slot.job.status != JobStatus::Paused {
                let status = slot.job.status;
                return Err(FleetError::invalid_transition("job", status, JobStatus::Running));
            }
            if slot.resume_pending {
                return Err(FleetError::Conflict(format!("job {id} is already resuming")));
            }
            slot.resume_pending = true;
            (
                slot.job.printer_ref.clone(),
                slot.job.gcode_ref.clone(),
                slot.epoch,
                slot.streamer.take(),
            )
        };

        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                tracing::warn!(job = %id, "previous streamer ended abnormally: {}", e);
            }
        }

        let mut offset = match self.resume_point(id, &slot_ref, epoch).await {
            Ok(offset) => offset,
            Err(e) => {
                slot_ref.lock().await.resume_pending = false;
                return Err(e);
            }
        };

        loop {
            let start =
                CommandPayload::Control(ControlRequest::start(id, gcode_ref.clone(), offset));
            let outcome = match self
                .inner
                .dispatcher
                .send_command(&printer, start, PRIORITY_CONTROL, Some(id))
                .await
            {
                Ok(receipt) => receipt.outcome().await.map(|_| ()),
                Err(e) => Err(e),
            };

            let mut slot = slot_ref.lock().await;
            if let Err(e) = outcome {
                slot.resume_pending = false;
                tracing::warn!(job = %id, %printer, "resume failed, job stays paused: {}", e);
                return Err(e);
            }
            if slot.epoch != epoch || slot.job.status != JobStatus::Paused {
                slot.resume_pending = false;
                return Err(FleetError::Conflict(format!(
                    "job {id} changed to {} while resuming",
                    slot.job.status
                )));
            }
            if slot.job.progress_lines != offset {
                tracing::info!(
                    job = %id,
                    announced = offset,
                    progress = slot.job.progress_lines,
                    "progress moved during restart, announcing again"
                );
                offset = slot.job.progress_lines;
                slot.job.start_offset_line = offset;
                continue;
            }

            slot.resume_pending = false;
            slot.job.transition(JobStatus::Running, self.inner.clock.now())?;
            slot.halt();
            let epoch = slot.epoch;
            slot.streamer = Some(self.spawn_stream(id, epoch, None));
            let view = slot.job.view();
            drop(slot);

            tracing::info!(job = %id, %printer, offset, "job resumed");
            return Ok(view);
        }
    }

    /// Line the printer restarts from: the stored offset, never past the
    /// acknowledged progress.
    async fn resume_point(
        &self,
        id: JobId,
        slot_ref: &Mutex<JobSlot>,
        epoch: u64,
    ) -> Result<u64, FleetError> {
        let mut slot = slot_ref.lock().await;
        if slot.epoch != epoch || slot.job.status != JobStatus::Paused {
            return Err(FleetError::Conflict(format!(
                "job {id} changed to {} while resuming",
                slot.job.status
            )));
        }
        let tracked = self.inner.tracker.offset_for(id).await?.unwrap_or(0);
        let offset = slot.job.start_offset_line.max(tracked).min(slot.job.progress_lines);
        slot.job.start_offset_line = offset;
        Ok(offset)
    }

    /// Any non-terminal state → CANCELLED. A stop request overtakes whatever
    /// the printer still has queued.
    pub async fn cancel(&self, id: JobId) -> Result<JobView, FleetError> {
        let slot = self.slot(id).await?;
        let (view, printer) = {
            let mut slot = slot.lock().await;
            slot.job.transition(JobStatus::Cancelled, self.inner.clock.now())?;
            slot.halt();
            (slot.job.view(), slot.job.printer_ref.clone())
        };
        tracing::info!(job = %id, %printer, "job cancelled");
        self.send_best_effort(&printer, ControlRequest::stop(id), PRIORITY_STOP).await;
        self.finish(&printer, id).await;
        Ok(view)
    }

    pub async fn get(&self, id: JobId) -> Result<JobView, FleetError> {
        let slot = self.slot(id).await?;
        let view = slot.lock().await.job.view();
        Ok(view)
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<JobView> {
        let slots = self.snapshot().await;
        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            views.push(slot.lock().await.job.view());
        }
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    /// Drops jobs that reached a terminal state before `older_than`.
    pub async fn purge_finished(&self, older_than: DateTime<Utc>) -> usize {
        let mut expired = Vec::new();
        for slot in self.snapshot().await {
            let slot = slot.lock().await;
            let job = &slot.job;
            if job.status.is_terminal() && job.finished_at.is_some_and(|at| at < older_than) {
                expired.push(job.id);
            }
        }
        if expired.is_empty() {
            return 0;
        }

        let mut jobs = self.inner.jobs.write().await;
        let purged = expired.iter().filter(|id| jobs.remove(id).is_some()).count();
        drop(jobs);
        tracing::info!(purged, "finished print jobs purged");
        purged
    }

    pub fn active_job_for(&self, printer: &DriverRef) -> Option<JobId> {
        self.lock_printers().get(printer).copied()
    }

    /// Consumes dispatcher signals until shutdown.
    pub async fn run_signals(
        &self,
        mut events: UnboundedReceiver<DispatcherEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("lifecycle signal loop stopped");
    }

    pub async fn handle_event(&self, event: DispatcherEvent) {
        match event {
            DispatcherEvent::CommandFailed {
                driver,
                request_id,
                job,
                reason,
                ..
            } => {
                // The streamer that owns the command pauses the job itself,
                // guarded by its epoch.
                tracing::warn!(%driver, %request_id, job = ?job, "command failed: {}", reason);
            }
            DispatcherEvent::LivenessLost { driver, job } => {
                if let Some(job) = self.resolve_job(&driver, job) {
                    self.pause_on_signal(job, None, "driver stopped sending heartbeats").await;
                }
            }
            DispatcherEvent::LivenessRestored { driver, job } => {
                let Some(job) = self.resolve_job(&driver, job) else {
                    return;
                };
                if !self.inner.config.auto_resume_on_reconnect {
                    tracing::info!(%driver, %job, "driver back online, job left paused");
                    return;
                }
                let manager = self.clone();
                tokio::spawn(async move {
                    match manager.resume(job).await {
                        Ok(_) => tracing::info!(%driver, %job, "job resumed after reconnect"),
                        Err(e) => tracing::warn!(%driver, %job, "auto-resume skipped: {}", e),
                    }
                });
            }
            DispatcherEvent::Telemetry { driver, job, telemetry } => {
                let Some(job) = self.resolve_job(&driver, job) else {
                    return;
                };
                if let Ok(slot) = self.slot(job).await {
                    slot.lock().await.job.telemetry = Some(telemetry);
                }
            }
            DispatcherEvent::Fault {
                driver,
                job,
                fatal,
                exceptions,
            } => {
                let job = self.resolve_job(&driver, job);
                if let Some(job) = job {
                    if fatal {
                        self.fail_on_signal(job, &exceptions).await;
                    } else {
                        self.pause_on_signal(job, None, "recoverable printer fault").await;
                    }
                }
                self.inner.notifier.alert(Alert { driver, job, exceptions }).await;
            }
        }
    }

    /// Pauses a RUNNING or QUEUED job. With `epoch` set, only if streaming
    /// has not been halted since.
    async fn pause_on_signal(&self, id: JobId, epoch: Option<u64>, reason: &str) {
        let Ok(slot) = self.slot(id).await else {
            return;
        };
        let printer = {
            let mut slot = slot.lock().await;
            if epoch.is_some_and(|epoch| epoch != slot.epoch) {
                return;
            }
            if !matches!(slot.job.status, JobStatus::Running | JobStatus::Queued) {
                return;
            }
            if let Err(e) = slot.job.transition(JobStatus::Paused, self.inner.clock.now()) {
                tracing::error!(job = %id, "pause refused: {}", e);
                return;
            }
            slot.halt();
            let offset = slot.job.start_offset_line;
            tracing::warn!(job = %id, offset, "job paused: {}", reason);
            slot.job.printer_ref.clone()
        };
        self.send_best_effort(&printer, ControlRequest::pause(id), PRIORITY_CONTROL).await;
    }

    async fn fail_on_signal(&self, id: JobId, exceptions: &[AgentException]) {
        let Ok(slot) = self.slot(id).await else {
            return;
        };
        let printer = {
            let mut slot = slot.lock().await;
            if slot.job.status.is_terminal() || slot.job.status == JobStatus::Created {
                return;
            }
            let message = exceptions
                .iter()
                .map(|e| format!("{}: {}", e.code, e.message))
                .collect::<Vec<_>>()
                .join("; ");
            if let Err(e) = slot.job.transition(JobStatus::Failed, self.inner.clock.now()) {
                tracing::error!(job = %id, "failure transition refused: {}", e);
                return;
            }
            slot.halt();
            tracing::error!(job = %id, "job failed: {}", message);
            slot.job.error_message = Some(message);
            slot.job.printer_ref.clone()
        };
        self.finish(&printer, id).await;
    }

    /// Releases everything a terminal job held.
    async fn finish(&self, printer: &DriverRef, id: JobId) {
        self.release_printer(printer, id);
        if let Err(e) = self.inner.dispatcher.detach_job(printer, id).await {
            tracing::debug!(%printer, job = %id, "detach skipped: {}", e);
        }
        if let Err(e) = self.inner.tracker.forget(id).await {
            tracing::warn!(job = %id, "could not drop stored offset: {}", e);
        }
    }

    async fn send_best_effort(&self, printer: &DriverRef, request: ControlRequest, priority: u8) {
        let job = request.job_ref;
        let action = request.action;
        if let Err(e) = self
            .inner
            .dispatcher
            .send_command(printer, CommandPayload::Control(request), priority, job)
            .await
        {
            tracing::debug!(%printer, ?action, "control request not sent: {}", e);
        }
    }

    fn resolve_job(&self, driver: &DriverRef, job: Option<JobId>) -> Option<JobId> {
        job.or_else(|| self.active_job_for(driver))
    }

    async fn snapshot(&self) -> Vec<Arc<Mutex<JobSlot>>> {
        self.inner.jobs.read().await.values().cloned().collect()
    }

    async fn slot(&self, id: JobId) -> Result<Arc<Mutex<JobSlot>>, FleetError> {
        self.inner
            .jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| FleetError::not_found("job", id))
    }

    fn lock_printers(&self) -> std::sync::MutexGuard<'_, HashMap<DriverRef, JobId>> {
        self.inner.printers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reserve_printer(&self, printer: &DriverRef, id: JobId) -> Result<(), FleetError> {
        let mut printers = self.lock_printers();
        if let Some(existing) = printers.get(printer) {
            return Err(FleetError::Conflict(format!(
                "printer {printer} already runs job {existing}"
            )));
        }
        printers.insert(printer.clone(), id);
        Ok(())
    }

    fn release_printer(&self, printer: &DriverRef, id: JobId) {
        let mut printers = self.lock_printers();
        if printers.get(printer) == Some(&id) {
            printers.remove(printer);
        }
    }
}
