//! Streams a job's G-code to its printer one acknowledged line at a time.

use fleet_shared::protocol::{CommandPayload, PRIORITY_STREAM};
use fleet_shared::{DriverRef, JobId, JobStatus};
use tokio::task::JoinHandle;

use super::JobLifecycleManager;
use crate::dispatcher::CommandReceipt;

enum NextLine {
    Send { printer: DriverRef, index: u64, text: String },
    Exhausted,
    Halted,
}

impl JobLifecycleManager {
    pub(super) fn spawn_stream(
        &self,
        id: JobId,
        epoch: u64,
        start: Option<CommandReceipt>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.stream(id, epoch, start).await })
    }

    async fn stream(&self, id: JobId, epoch: u64, start: Option<CommandReceipt>) {
        if let Some(receipt) = start {
            if let Err(e) = receipt.outcome().await {
                self.pause_on_signal(id, Some(epoch), &format!("start not acknowledged: {e}"))
                    .await;
                return;
            }
            if !self.mark_running(id, epoch).await {
                return;
            }
        }

        loop {
            let (printer, index, text) = match self.next_line(id, epoch).await {
                NextLine::Send { printer, index, text } => (printer, index, text),
                NextLine::Exhausted => {
                    self.complete(id, epoch).await;
                    return;
                }
                NextLine::Halted => {
                    tracing::debug!(job = %id, epoch, "streamer stopped");
                    return;
                }
            };

            let receipt = match self
                .inner
                .dispatcher
                .send_command(&printer, CommandPayload::Line(text), PRIORITY_STREAM, Some(id))
                .await
            {
                Ok(receipt) => receipt,
                Err(e) => {
                    let reason = format!("line {index} could not be queued: {e}");
                    self.pause_on_signal(id, Some(epoch), &reason).await;
                    return;
                }
            };

            if let Err(e) = receipt.outcome().await {
                let reason = format!("line {index} not acknowledged: {e}");
                self.pause_on_signal(id, Some(epoch), &reason).await;
                return;
            }
            if let Err(e) = self.on_progress(id, index + 1).await {
                let reason = format!("progress could not be recorded: {e}");
                self.pause_on_signal(id, Some(epoch), &reason).await;
                return;
            }
        }
    }

    async fn mark_running(&self, id: JobId, epoch: u64) -> bool {
        let Ok(slot) = self.slot(id).await else {
            return false;
        };
        let mut slot = slot.lock().await;
        if slot.epoch != epoch || slot.job.status != JobStatus::Queued {
            return false;
        }
        if let Err(e) = slot.job.transition(JobStatus::Running, self.inner.clock.now()) {
            tracing::error!(job = %id, "could not mark job running: {}", e);
            return false;
        }
        tracing::info!(job = %id, printer = %slot.job.printer_ref, "job running");
        true
    }

    async fn next_line(&self, id: JobId, epoch: u64) -> NextLine {
        let Ok(slot) = self.slot(id).await else {
            return NextLine::Halted;
        };
        let slot = slot.lock().await;
        if slot.epoch != epoch || slot.job.status != JobStatus::Running {
            return NextLine::Halted;
        }
        if slot.job.is_exhausted() {
            return NextLine::Exhausted;
        }
        let index = slot.job.progress_lines;
        match slot.lines.get(index as usize) {
            Some(text) => NextLine::Send {
                printer: slot.job.printer_ref.clone(),
                index,
                text: text.clone(),
            },
            None => NextLine::Exhausted,
        }
    }

    async fn complete(&self, id: JobId, epoch: u64) {
        let Ok(slot) = self.slot(id).await else {
            return;
        };
        let printer = {
            let mut slot = slot.lock().await;
            if slot.epoch != epoch || slot.job.status != JobStatus::Running {
                return;
            }
            if let Err(e) = slot.job.transition(JobStatus::Completed, self.inner.clock.now()) {
                tracing::error!(job = %id, "could not complete job: {}", e);
                return;
            }
            slot.halt();
            tracing::info!(job = %id, lines = slot.job.total_lines, "job completed");
            slot.job.printer_ref.clone()
        };
        self.finish(&printer, id).await;
    }
}
