use chrono::{DateTime, Utc};
use fleet_shared::api_models::JobView;
use fleet_shared::protocol::Telemetry;
use fleet_shared::{DriverRef, JobId, JobStatus};

use crate::error::FleetError;

/// Result of applying an acknowledged line count to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Progress moved to the contained value.
    Applied(u64),
    /// Value was below the recorded progress; nothing changed.
    Regressed,
    /// Job already finished; nothing changed.
    Terminal,
}

/// A single print execution against one printer.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub printer_ref: DriverRef,
    pub gcode_ref: String,
    pub status: JobStatus,
    pub progress_lines: u64,
    pub total_lines: u64,
    pub start_offset_line: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub telemetry: Option<Telemetry>,
}

impl Job {
    /// Lines before `start_offset_line` count as already printed.
    pub fn new(
        printer_ref: DriverRef,
        gcode_ref: String,
        total_lines: u64,
        start_offset_line: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, FleetError> {
        if start_offset_line > total_lines {
            return Err(FleetError::Validation(format!(
                "start offset {start_offset_line} is beyond the last line ({total_lines})"
            )));
        }
        Ok(Self {
            id: JobId::new(),
            printer_ref,
            gcode_ref,
            status: JobStatus::Created,
            progress_lines: start_offset_line,
            total_lines,
            start_offset_line,
            created_at: now,
            started_at: None,
            finished_at: None,
            error_message: None,
            telemetry: None,
        })
    }

    pub fn transition(&mut self, to: JobStatus, now: DateTime<Utc>) -> Result<(), FleetError> {
        use JobStatus::*;
        match (self.status, to) {
            (Created, Queued) => {}
            (Queued, Running) => {
                self.started_at.get_or_insert(now);
            }
            (Running, Paused) | (Queued, Paused) => {
                self.start_offset_line = self.progress_lines;
            }
            (Paused, Running) => {
                self.started_at.get_or_insert(now);
            }
            (Running, Completed)
            | (Running, Failed)
            | (Paused, Failed)
            | (Queued, Failed)
            | (Created, Cancelled)
            | (Queued, Cancelled)
            | (Running, Cancelled)
            | (Paused, Cancelled) => {
                self.finished_at = Some(now);
            }
            (from, to) => return Err(FleetError::invalid_transition("job", from, to)),
        }
        self.status = to;
        Ok(())
    }

    /// Applies an acknowledged line count. Never moves backwards and never
    /// exceeds `total_lines`. While paused, a late acknowledgement also moves
    /// the resume point so an acked line is not streamed twice.
    pub fn apply_progress(&mut self, lines: u64) -> ProgressOutcome {
        if self.status.is_terminal() {
            return ProgressOutcome::Terminal;
        }
        if lines < self.progress_lines {
            return ProgressOutcome::Regressed;
        }
        self.progress_lines = lines.min(self.total_lines);
        if self.status == JobStatus::Paused {
            self.start_offset_line = self.progress_lines;
        }
        ProgressOutcome::Applied(self.progress_lines)
    }

    pub fn is_exhausted(&self) -> bool {
        self.progress_lines >= self.total_lines
    }

    pub fn view(&self) -> JobView {
        JobView {
            id: self.id,
            printer_ref: self.printer_ref.clone(),
            gcode_ref: self.gcode_ref.clone(),
            status: self.status,
            progress_lines: self.progress_lines,
            total_lines: self.total_lines,
            start_offset_line: self.start_offset_line,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error_message: self.error_message.clone(),
            telemetry: self.telemetry.clone(),
        }
    }
}
