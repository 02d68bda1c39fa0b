//! Shared data models for the submission surfaces and read-facing views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{DriverRef, JobId, QueueEntryId};
use crate::protocol::Telemetry;
use crate::status::{JobStatus, QueueStatus};

/// Request to put a model on the slicing queue.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitSlicingRequest {
    pub model_ref: String,
    pub slicing_property_ref: String,
    pub submitter_id: String,
    /// 1..=10, defaults to 5 when omitted.
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitSlicingResponse {
    pub id: QueueEntryId,
}

/// Request to start printing a G-code resource on one printer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StartJobRequest {
    pub printer_ref: DriverRef,
    pub gcode_ref: String,
    #[serde(default)]
    pub start_offset_line: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueEntryView {
    pub id: QueueEntryId,
    pub model_ref: String,
    pub slicing_property_ref: String,
    pub submitter_id: String,
    pub priority: u8,
    pub status: QueueStatus,
    pub progress_percentage: u8,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result_ref: Option<String>,
    pub preview_ref: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobView {
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
