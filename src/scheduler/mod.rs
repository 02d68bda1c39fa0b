//! Slicing queue scheduler.
//!
//! Admission is poll-driven: [`SlicingQueueScheduler::run`] ticks
//! [`admit_all`](SlicingQueueScheduler::admit_all) and
//! [`sweep_stale`](SlicingQueueScheduler::sweep_stale) on their own
//! intervals. The number of PROCESSING entries never exceeds the semaphore
//! size; each running engine invocation holds one permit until its entry
//! leaves PROCESSING.

pub mod converter;
pub mod engine;

use chrono::{DateTime, Utc};
use fleet_shared::api_models::{QueueEntryView, SubmitSlicingRequest};
use fleet_shared::config::SchedulerConfig;
use fleet_shared::{Clock, QueueEntryId, QueueStatus};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::time::MissedTickBehavior;

use crate::error::FleetError;
use crate::model::{QueueEntry, STALE_TIMEOUT};
use crate::repository::QueueRepository;
use converter::{ModelConverter, convert_with_timeout};
use engine::{CancelFlag, SliceContext, SliceJob, SlicingEngine, SlicingEngineError, SlicingOutput};

/// Published on every terminal transition and on stale requeues.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Completed { id: QueueEntryId, result_ref: String },
    Failed { id: QueueEntryId, error: String },
    Cancelled { id: QueueEntryId },
    Requeued { id: QueueEntryId, attempt: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: Vec<QueueEntryId>,
    pub failed: Vec<QueueEntryId>,
}

/// Collaborators the scheduler drives.
pub struct SchedulerDeps {
    pub repository: Arc<dyn QueueRepository>,
    pub engine: Arc<dyn SlicingEngine>,
    pub converter: Option<Arc<dyn ModelConverter>>,
    pub clock: Arc<dyn Clock>,
}

struct RunningSlice {
    attempt: u32,
    cancel: CancelFlag,
    _permit: OwnedSemaphorePermit,
}

struct Inner {
    config: SchedulerConfig,
    converter_timeout: Duration,
    repository: Arc<dyn QueueRepository>,
    engine: Arc<dyn SlicingEngine>,
    converter: Option<Arc<dyn ModelConverter>>,
    clock: Arc<dyn Clock>,
    permits: Arc<Semaphore>,
    running: std::sync::Mutex<HashMap<QueueEntryId, RunningSlice>>,
    /// Serializes read-modify-write cycles on entries.
    transitions: Mutex<()>,
    events: broadcast::Sender<QueueEvent>,
}

impl Inner {
    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<QueueEntryId, RunningSlice>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops the run's permit, but only if `attempt` is still the tracked run.
    fn release(&self, id: QueueEntryId, attempt: u32) {
        let mut running = self.lock_running();
        if running.get(&id).is_some_and(|run| run.attempt == attempt) {
            running.remove(&id);
        }
    }

    /// Signals the tracked run to stop and frees its slot.
    fn abandon(&self, id: QueueEntryId) {
        if let Some(run) = self.lock_running().remove(&id) {
            run.cancel.cancel();
        }
    }

    fn publish(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

/// Handed to the engine so it can report how far along a run is.
#[derive(Clone)]
pub struct ProgressReporter {
    scheduler: Weak<Inner>,
    entry_id: QueueEntryId,
    attempt: u32,
}

impl ProgressReporter {
    /// A reporter that goes nowhere.
    pub fn detached() -> Self {
        Self {
            scheduler: Weak::new(),
            entry_id: QueueEntryId::new(),
            attempt: 0,
        }
    }

    /// Records `percentage` (clamped to 100). Ignored once the run is no
    /// longer the entry's current attempt.
    pub async fn report(&self, percentage: u8) {
        let Some(inner) = self.scheduler.upgrade() else {
            return;
        };
        let _guard = inner.transitions.lock().await;
        match inner.repository.get(self.entry_id).await {
            Ok(Some(mut entry))
                if entry.status == QueueStatus::Processing && entry.attempt == self.attempt =>
            {
                entry.record_progress(percentage, inner.clock.now());
                if let Err(e) = inner.repository.update(entry).await {
                    tracing::warn!(entry = %self.entry_id, "could not record progress: {}", e);
                }
            }
            Ok(_) => {
                tracing::debug!(
                    entry = %self.entry_id,
                    attempt = self.attempt,
                    "progress from outdated run ignored"
                );
            }
            Err(e) => {
                tracing::warn!(entry = %self.entry_id, "could not load entry for progress: {}", e);
            }
        }
    }
}

#[derive(Clone)]
pub struct SlicingQueueScheduler {
    inner: Arc<Inner>,
}

impl SlicingQueueScheduler {
    pub fn new(config: SchedulerConfig, converter_timeout: Duration, deps: SchedulerDeps) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                converter_timeout,
                repository: deps.repository,
                engine: deps.engine,
                converter: deps.converter,
                clock: deps.clock,
                running: std::sync::Mutex::new(HashMap::new()),
                transitions: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub async fn enqueue(
        &self,
        request: SubmitSlicingRequest,
    ) -> Result<QueueEntryView, FleetError> {
        let entry = QueueEntry::new(request, self.inner.clock.now())?;
        let view = entry.view();
        self.inner.repository.insert(entry).await?;
        tracing::info!(
            entry = %view.id,
            priority = view.priority,
            model = %view.model_ref,
            "slicing request queued"
        );
        Ok(view)
    }

    /// Head of the queue without admitting it.
    pub async fn select_next(&self) -> Result<Option<QueueEntryView>, FleetError> {
        Ok(self.inner.repository.next_queued().await?.map(|e| e.view()))
    }

    /// Admits the head of the queue if a slot is free.
    pub async fn admit(&self) -> Result<Option<QueueEntryId>, FleetError> {
        let _guard = self.inner.transitions.lock().await;
        let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
            return Ok(None);
        };
        let Some(mut entry) = self.inner.repository.next_queued().await? else {
            return Ok(None);
        };
        entry.transition(QueueStatus::Processing, self.inner.clock.now())?;
        self.inner.repository.update(entry.clone()).await?;

        let cancel = CancelFlag::default();
        self.inner.lock_running().insert(
            entry.id,
            RunningSlice {
                attempt: entry.attempt,
                cancel: cancel.clone(),
                _permit: permit,
            },
        );
        tracing::info!(entry = %entry.id, attempt = entry.attempt, "slicing admitted");

        let job = SliceJob {
            entry_id: entry.id,
            attempt: entry.attempt,
            model_ref: entry.model_ref,
            slicing_property_ref: entry.slicing_property_ref,
        };
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run_engine(job, cancel).await });
        Ok(Some(entry.id))
    }

    /// Admits until the cap is reached or the queue is empty.
    pub async fn admit_all(&self) -> Result<Vec<QueueEntryId>, FleetError> {
        let mut admitted = Vec::new();
        while let Some(id) = self.admit().await? {
            admitted.push(id);
        }
        Ok(admitted)
    }

    pub async fn cancel(&self, id: QueueEntryId) -> Result<QueueEntryView, FleetError> {
        let _guard = self.inner.transitions.lock().await;
        let mut entry = self
            .inner
            .repository
            .get(id)
            .await?
            .ok_or_else(|| FleetError::not_found("queue entry", id))?;
        let was_processing = entry.status == QueueStatus::Processing;
        entry.transition(QueueStatus::Cancelled, self.inner.clock.now())?;
        self.inner.repository.update(entry.clone()).await?;
        if was_processing {
            self.inner.abandon(id);
        }
        tracing::info!(entry = %id, was_processing, "slicing request cancelled");
        self.inner.publish(QueueEvent::Cancelled { id });
        Ok(entry.view())
    }

    /// Recovers PROCESSING entries that made no progress within the stale
    /// threshold: requeued while retries remain, failed afterwards.
    pub async fn sweep_stale(&self) -> Result<SweepReport, FleetError> {
        let _guard = self.inner.transitions.lock().await;
        let now = self.inner.clock.now();
        let threshold = self.inner.config.stale_threshold();
        let mut report = SweepReport::default();

        for mut entry in self.inner.repository.list_by_status(QueueStatus::Processing).await? {
            let Some(reference) = entry.staleness_reference() else {
                continue;
            };
            if now - reference <= threshold {
                continue;
            }
            self.inner.abandon(entry.id);
            if entry.attempt < self.inner.config.max_retries {
                entry.transition(QueueStatus::Queued, now)?;
                tracing::warn!(
                    entry = %entry.id,
                    attempt = entry.attempt,
                    "stale slicing run requeued"
                );
                report.requeued.push(entry.id);
                self.inner.publish(QueueEvent::Requeued {
                    id: entry.id,
                    attempt: entry.attempt,
                });
            } else {
                entry.fail(STALE_TIMEOUT, now)?;
                tracing::error!(
                    entry = %entry.id,
                    attempts = entry.attempt + 1,
                    "stale slicing run failed"
                );
                report.failed.push(entry.id);
                self.inner.publish(QueueEvent::Failed {
                    id: entry.id,
                    error: STALE_TIMEOUT.to_string(),
                });
            }
            self.inner.repository.update(entry).await?;
        }
        Ok(report)
    }

    /// Removes terminal entries completed before `older_than`.
    pub async fn purge_terminal(&self, older_than: DateTime<Utc>) -> Result<usize, FleetError> {
        let _guard = self.inner.transitions.lock().await;
        let mut purged = 0;
        for entry in self.inner.repository.list().await? {
            let expired = entry.status.is_terminal()
                && entry.completed_at.is_some_and(|at| at < older_than);
            if expired && self.inner.repository.remove(entry.id).await?.is_some() {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!(purged, "archived queue entries purged");
        }
        Ok(purged)
    }

    pub async fn get(&self, id: QueueEntryId) -> Result<QueueEntryView, FleetError> {
        self.inner
            .repository
            .get(id)
            .await?
            .map(|e| e.view())
            .ok_or_else(|| FleetError::not_found("queue entry", id))
    }

    pub async fn list(&self) -> Result<Vec<QueueEntryView>, FleetError> {
        Ok(self.inner.repository.list().await?.iter().map(QueueEntry::view).collect())
    }

    /// Engine runs currently holding a slot.
    pub fn running_count(&self) -> usize {
        self.inner.lock_running().len()
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut admit_tick = tokio::time::interval(self.inner.config.poll_interval());
        admit_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval(self.inner.config.sweep_interval());
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            max_concurrent = self.inner.config.max_concurrent,
            "slicing scheduler started"
        );

        loop {
            tokio::select! {
                _ = admit_tick.tick() => {
                    if let Err(e) = self.admit_all().await {
                        tracing::error!("admission failed: {}", e);
                    }
                }
                _ = sweep_tick.tick() => {
                    match self.sweep_stale().await {
                        Ok(report) if report != SweepReport::default() => tracing::info!(
                            requeued = report.requeued.len(),
                            failed = report.failed.len(),
                            "stale sweep finished"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!("stale sweep failed: {}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        let running: Vec<RunningSlice> =
            self.inner.lock_running().drain().map(|(_, run)| run).collect();
        for run in &running {
            run.cancel.cancel();
        }
        tracing::info!(abandoned = running.len(), "slicing scheduler stopped");
    }

    async fn run_engine(&self, job: SliceJob, cancel: CancelFlag) {
        let id = job.entry_id;
        let attempt = job.attempt;
        let model_ref = job.model_ref.clone();
        let ctx = SliceContext {
            cancel,
            progress: ProgressReporter {
                scheduler: Arc::downgrade(&self.inner),
                entry_id: id,
                attempt,
            },
        };
        let result = self.inner.engine.slice(job, ctx).await;
        if self.finish(id, attempt, result).await {
            self.attach_preview(id, model_ref).await;
        }
    }

    /// Applies an engine result. Returns true when the entry completed.
    async fn finish(
        &self,
        id: QueueEntryId,
        attempt: u32,
        result: Result<SlicingOutput, SlicingEngineError>,
    ) -> bool {
        let _guard = self.inner.transitions.lock().await;
        let mut entry = match self.inner.repository.get(id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.inner.release(id, attempt);
                tracing::debug!(entry = %id, "result for purged entry discarded");
                return false;
            }
            Err(e) => {
                self.inner.release(id, attempt);
                tracing::error!(entry = %id, "could not load entry for result: {}", e);
                return false;
            }
        };
        if entry.status != QueueStatus::Processing || entry.attempt != attempt {
            self.inner.release(id, attempt);
            tracing::debug!(
                entry = %id,
                attempt,
                status = %entry.status,
                "discarding result: {}",
                FleetError::StaleJob(id)
            );
            return false;
        }
        // Admission waits on the same guard, so freeing the slot here cannot
        // let the cap be exceeded.
        self.inner.release(id, attempt);

        let now = self.inner.clock.now();
        let (completed, event) = match result {
            Ok(output) => {
                entry.result_ref = Some(output.result_ref.clone());
                if let Err(e) = entry.transition(QueueStatus::Completed, now) {
                    tracing::error!(entry = %id, "{}", e);
                    return false;
                }
                tracing::info!(entry = %id, result = %output.result_ref, "slicing completed");
                (
                    true,
                    QueueEvent::Completed {
                        id,
                        result_ref: output.result_ref,
                    },
                )
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(e) = entry.fail(message.clone(), now) {
                    tracing::error!(entry = %id, "{}", e);
                    return false;
                }
                tracing::warn!(entry = %id, "slicing failed: {}", message);
                (false, QueueEvent::Failed { id, error: message })
            }
        };
        if let Err(e) = self.inner.repository.update(entry).await {
            tracing::error!(entry = %id, "could not store slicing result: {}", e);
        }
        self.inner.publish(event);
        completed
    }

    /// Best-effort preview generation; failures leave `preview_ref` empty.
    async fn attach_preview(&self, id: QueueEntryId, model_ref: String) {
        let Some(converter) = self.inner.converter.clone() else {
            return;
        };
        let timeout = self.inner.converter_timeout;
        let preview = match convert_with_timeout(converter, model_ref, timeout).await {
            Ok(preview) => preview,
            Err(e) => {
                tracing::warn!(entry = %id, "preview conversion skipped: {}", e);
                return;
            }
        };
        let _guard = self.inner.transitions.lock().await;
        match self.inner.repository.get(id).await {
            Ok(Some(mut entry)) if entry.status == QueueStatus::Completed => {
                entry.preview_ref = Some(preview);
                if let Err(e) = self.inner.repository.update(entry).await {
                    tracing::warn!(entry = %id, "could not store preview: {}", e);
                }
            }
            Ok(_) => tracing::debug!(entry = %id, "entry gone before preview was stored"),
            Err(e) => tracing::warn!(entry = %id, "could not load entry for preview: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use fleet_shared::ManualClock;
    use tokio::sync::{mpsc, oneshot};

    use crate::repository::InMemoryQueueRepository;
    use converter::ConversionError;

    struct Call {
        job: SliceJob,
        ctx: SliceContext,
        reply: oneshot::Sender<Result<SlicingOutput, SlicingEngineError>>,
    }

    /// Engine whose runs are completed by the test.
    struct ManualEngine {
        calls: mpsc::UnboundedSender<Call>,
        honor_cancel: bool,
    }

    #[async_trait]
    impl SlicingEngine for ManualEngine {
        async fn slice(
            &self,
            job: SliceJob,
            ctx: SliceContext,
        ) -> Result<SlicingOutput, SlicingEngineError> {
            let (reply, rx) = oneshot::channel();
            let cancel = ctx.cancel.clone();
            let _ = self.calls.send(Call { job, ctx, reply });
            if self.honor_cancel {
                tokio::select! {
                    result = rx => result.unwrap_or(Err(SlicingEngineError::Cancelled)),
                    _ = cancel.cancelled() => Err(SlicingEngineError::Cancelled),
                }
            } else {
                rx.await.unwrap_or(Err(SlicingEngineError::Cancelled))
            }
        }
    }

    struct Preview(Result<&'static str, &'static str>);

    impl ModelConverter for Preview {
        fn convert(&self, _model_ref: &str) -> Result<String, ConversionError> {
            self.0
                .map(str::to_string)
                .map_err(|e| ConversionError::Failed(e.to_string()))
        }
    }

    struct Rig {
        scheduler: SlicingQueueScheduler,
        calls: mpsc::UnboundedReceiver<Call>,
        clock: Arc<ManualClock>,
    }

    fn rig_with(
        max_concurrent: usize,
        max_retries: u32,
        honor_cancel: bool,
        converter: Option<Arc<dyn ModelConverter>>,
    ) -> Rig {
        let (tx, calls) = mpsc::unbounded_channel();
        let clock = Arc::new(ManualClock::default());
        let config = SchedulerConfig {
            max_concurrent,
            max_retries,
            stale_threshold_secs: 60,
            ..Default::default()
        };
        let scheduler = SlicingQueueScheduler::new(
            config,
            Duration::from_secs(1),
            SchedulerDeps {
                repository: Arc::new(InMemoryQueueRepository::new()),
                engine: Arc::new(ManualEngine {
                    calls: tx,
                    honor_cancel,
                }),
                converter,
                clock: clock.clone(),
            },
        );
        Rig { scheduler, calls, clock }
    }

    fn rig(max_concurrent: usize) -> Rig {
        rig_with(max_concurrent, 2, true, None)
    }

    fn request(model: &str, priority: Option<u8>) -> SubmitSlicingRequest {
        SubmitSlicingRequest {
            model_ref: model.into(),
            slicing_property_ref: "pla-0.2".into(),
            submitter_id: "alice".into(),
            priority,
        }
    }

    fn sliced(path: &str) -> Result<SlicingOutput, SlicingEngineError> {
        Ok(SlicingOutput { result_ref: path.into() })
    }

    async fn wait_for(
        scheduler: &SlicingQueueScheduler,
        id: QueueEntryId,
        status: QueueStatus,
    ) -> QueueEntryView {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let view = scheduler.get(id).await.unwrap();
                if view.status == status {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("entry never reached expected status")
    }

    #[tokio::test]
    async fn higher_priority_wins_even_when_later() {
        let rig = rig(1);
        let e2 = rig.scheduler.enqueue(request("low.stl", Some(5))).await.unwrap();
        let e1 = rig.scheduler.enqueue(request("high.stl", Some(8))).await.unwrap();
        assert_eq!(rig.scheduler.select_next().await.unwrap().unwrap().id, e1.id);
        assert_ne!(e1.id, e2.id);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let rig = rig(1);
        let first = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap();
        rig.clock.advance(ChronoDuration::seconds(1));
        rig.scheduler.enqueue(request("b.stl", None)).await.unwrap();
        assert_eq!(rig.scheduler.select_next().await.unwrap().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let rig = rig(1);
        assert!(matches!(
            rig.scheduler.enqueue(request("a.stl", Some(11))).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            rig.scheduler.enqueue(request("a.stl", Some(0))).await,
            Err(FleetError::Validation(_))
        ));
        assert!(matches!(
            rig.scheduler.enqueue(request("  ", None)).await,
            Err(FleetError::Validation(_))
        ));
        assert!(rig.scheduler.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn admission_respects_cap() {
        let mut rig = rig(2);
        for model in ["a.stl", "b.stl", "c.stl"] {
            rig.scheduler.enqueue(request(model, None)).await.unwrap();
        }
        let admitted = rig.scheduler.admit_all().await.unwrap();
        assert_eq!(admitted.len(), 2);
        assert_eq!(rig.scheduler.running_count(), 2);
        let processing = rig
            .scheduler
            .list()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.status == QueueStatus::Processing)
            .count();
        assert_eq!(processing, 2);

        let call = rig.calls.recv().await.unwrap();
        let done = call.job.entry_id;
        call.reply.send(sliced("out/a.gcode")).ok();
        let view = wait_for(&rig.scheduler, done, QueueStatus::Completed).await;
        assert_eq!(view.progress_percentage, 100);
        assert_eq!(view.result_ref.as_deref(), Some("out/a.gcode"));
        assert!(view.completed_at.is_some());

        let third = rig.scheduler.admit().await.unwrap();
        assert!(third.is_some());
        assert_eq!(rig.scheduler.admit().await.unwrap(), None);
    }

    #[tokio::test]
    async fn engine_failure_marks_entry_failed() {
        let mut rig = rig(1);
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.admit().await.unwrap();
        let call = rig.calls.recv().await.unwrap();
        call.reply
            .send(Err(SlicingEngineError::Failed("non-manifold mesh".into())))
            .ok();
        let view = wait_for(&rig.scheduler, id, QueueStatus::Failed).await;
        assert!(view.error_message.unwrap().contains("non-manifold mesh"));
        assert!(view.completed_at.is_some());
        assert_eq!(rig.scheduler.running_count(), 0);
    }

    #[tokio::test]
    async fn cancelling_processing_entry_frees_slot_and_discards_result() {
        let mut rig = rig(1);
        let mut events = rig.scheduler.subscribe();
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        let next = rig.scheduler.enqueue(request("b.stl", None)).await.unwrap().id;
        rig.scheduler.admit().await.unwrap();
        let call = rig.calls.recv().await.unwrap();

        let view = rig.scheduler.cancel(id).await.unwrap();
        assert_eq!(view.status, QueueStatus::Cancelled);
        assert!(call.ctx.cancel.is_cancelled());
        assert_eq!(rig.scheduler.running_count(), 0);
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Cancelled { id });

        assert_eq!(rig.scheduler.admit().await.unwrap(), Some(next));
        let _ = call.reply.send(sliced("out/a.gcode"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let view = rig.scheduler.get(id).await.unwrap();
        assert_eq!(view.status, QueueStatus::Cancelled);
        assert_eq!(view.result_ref, None);
    }

    #[tokio::test]
    async fn cancelling_terminal_entry_conflicts() {
        let rig = rig(1);
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.cancel(id).await.unwrap();
        assert!(matches!(rig.scheduler.cancel(id).await, Err(FleetError::Conflict(_))));
        assert!(matches!(
            rig.scheduler.cancel(QueueEntryId::new()).await,
            Err(FleetError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stale_entry_is_requeued_and_late_result_discarded() {
        let mut rig = rig_with(1, 2, false, None);
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.admit().await.unwrap();
        let orphan = rig.calls.recv().await.unwrap();

        rig.clock.advance(ChronoDuration::seconds(120));
        let report = rig.scheduler.sweep_stale().await.unwrap();
        assert_eq!(report.requeued, vec![id]);
        let view = rig.scheduler.get(id).await.unwrap();
        assert_eq!(view.status, QueueStatus::Queued);
        assert_eq!(view.attempt, 1);
        assert_eq!(view.started_at, None);
        assert!(orphan.ctx.cancel.is_cancelled());

        orphan.reply.send(sliced("out/old.gcode")).ok();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let view = rig.scheduler.get(id).await.unwrap();
        assert_eq!(view.status, QueueStatus::Queued);
        assert_eq!(view.result_ref, None);

        rig.scheduler.admit().await.unwrap();
        let retry = rig.calls.recv().await.unwrap();
        assert_eq!(retry.job.attempt, 1);
        retry.reply.send(sliced("out/new.gcode")).ok();
        let view = wait_for(&rig.scheduler, id, QueueStatus::Completed).await;
        assert_eq!(view.result_ref.as_deref(), Some("out/new.gcode"));
    }

    #[tokio::test]
    async fn stale_entry_fails_when_retries_run_out() {
        let mut rig = rig_with(1, 0, true, None);
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.admit().await.unwrap();
        let _call = rig.calls.recv().await.unwrap();

        rig.clock.advance(ChronoDuration::seconds(120));
        let report = rig.scheduler.sweep_stale().await.unwrap();
        assert_eq!(report.failed, vec![id]);
        let view = rig.scheduler.get(id).await.unwrap();
        assert_eq!(view.status, QueueStatus::Failed);
        assert_eq!(view.error_message.as_deref(), Some(STALE_TIMEOUT));
        assert!(view.completed_at.is_some());
    }

    #[tokio::test]
    async fn progress_keeps_entry_fresh() {
        let mut rig = rig(1);
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.admit().await.unwrap();
        let call = rig.calls.recv().await.unwrap();

        rig.clock.advance(ChronoDuration::seconds(50));
        call.ctx.progress.report(40).await;
        rig.clock.advance(ChronoDuration::seconds(50));
        assert_eq!(rig.scheduler.sweep_stale().await.unwrap(), SweepReport::default());

        call.ctx.progress.report(250).await;
        let view = rig.scheduler.get(id).await.unwrap();
        assert_eq!(view.status, QueueStatus::Processing);
        assert_eq!(view.progress_percentage, 100);
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_entries() {
        let rig = rig(1);
        let old = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.cancel(old).await.unwrap();
        let kept = rig.scheduler.enqueue(request("b.stl", None)).await.unwrap().id;

        rig.clock.advance(ChronoDuration::days(8));
        let cutoff = rig.clock.now() - ChronoDuration::days(7);
        assert_eq!(rig.scheduler.purge_terminal(cutoff).await.unwrap(), 1);
        assert!(matches!(rig.scheduler.get(old).await, Err(FleetError::NotFound { .. })));
        assert!(rig.scheduler.get(kept).await.is_ok());
    }

    #[tokio::test]
    async fn preview_is_attached_after_completion() {
        let mut rig = rig_with(1, 2, true, Some(Arc::new(Preview(Ok("previews/a.glb")))));
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.admit().await.unwrap();
        rig.calls.recv().await.unwrap().reply.send(sliced("out/a.gcode")).ok();

        let view = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let view = rig.scheduler.get(id).await.unwrap();
                if view.preview_ref.is_some() {
                    return view;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(view.preview_ref.as_deref(), Some("previews/a.glb"));
    }

    #[tokio::test]
    async fn converter_failure_leaves_entry_completed() {
        let mut rig = rig_with(1, 2, true, Some(Arc::new(Preview(Err("no mesh")))));
        let mut events = rig.scheduler.subscribe();
        let id = rig.scheduler.enqueue(request("a.stl", None)).await.unwrap().id;
        rig.scheduler.admit().await.unwrap();
        rig.calls.recv().await.unwrap().reply.send(sliced("out/a.gcode")).ok();

        assert_eq!(
            events.recv().await.unwrap(),
            QueueEvent::Completed {
                id,
                result_ref: "out/a.gcode".into()
            }
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let view = rig.scheduler.get(id).await.unwrap();
        assert_eq!(view.status, QueueStatus::Completed);
        assert_eq!(view.preview_ref, None);
    }
}
