use chrono::{DateTime, Utc};
use fleet_shared::QueueEntryId;
use fleet_shared::QueueStatus;
use fleet_shared::api_models::{QueueEntryView, SubmitSlicingRequest};

use crate::error::FleetError;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Error message recorded when staleness retries run out.
pub const STALE_TIMEOUT: &str = "stale-timeout";

/// A request to run the slicing engine, from submission to archival.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub id: QueueEntryId,
    pub model_ref: String,
    pub slicing_property_ref: String,
    pub submitter_id: String,
    pub priority: u8,
    pub status: QueueStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub progress_percentage: u8,
    /// Number of stale requeues so far. Also tags the current engine run so
    /// results from an abandoned run can be told apart.
    pub attempt: u32,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub result_ref: Option<String>,
    pub preview_ref: Option<String>,
}

pub fn validate_priority(priority: Option<u8>) -> Result<u8, FleetError> {
    let priority = priority.unwrap_or(DEFAULT_PRIORITY);
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(FleetError::Validation(format!(
            "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"
        )));
    }
    Ok(priority)
}

fn require(field: &str, value: &str) -> Result<(), FleetError> {
    if value.trim().is_empty() {
        return Err(FleetError::Validation(format!("{field} must not be blank")));
    }
    Ok(())
}

impl QueueEntry {
    pub fn new(request: SubmitSlicingRequest, now: DateTime<Utc>) -> Result<Self, FleetError> {
        let priority = validate_priority(request.priority)?;
        require("model_ref", &request.model_ref)?;
        require("slicing_property_ref", &request.slicing_property_ref)?;
        require("submitter_id", &request.submitter_id)?;
        Ok(Self {
            id: QueueEntryId::new(),
            model_ref: request.model_ref,
            slicing_property_ref: request.slicing_property_ref,
            submitter_id: request.submitter_id,
            priority,
            status: QueueStatus::Queued,
            created_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            progress_percentage: 0,
            attempt: 0,
            last_progress_at: None,
            result_ref: None,
            preview_ref: None,
        })
    }

    /// Moves the entry to `to`, keeping the timestamp invariants:
    /// `started_at` is set exactly when the entry has been picked up, and
    /// `completed_at` exactly when it is terminal.
    pub fn transition(&mut self, to: QueueStatus, now: DateTime<Utc>) -> Result<(), FleetError> {
        use QueueStatus::*;
        match (self.status, to) {
            (Queued, Processing) => {
                self.started_at = Some(now);
                self.last_progress_at = Some(now);
                self.progress_percentage = 0;
            }
            (Processing, Queued) => {
                self.started_at = None;
                self.last_progress_at = None;
                self.progress_percentage = 0;
                self.attempt += 1;
            }
            (Processing, Completed) => {
                self.progress_percentage = 100;
                self.completed_at = Some(now);
            }
            (Processing, Failed) | (Processing, Cancelled) | (Queued, Cancelled) => {
                self.completed_at = Some(now);
            }
            (from, to) => return Err(FleetError::invalid_transition("queue entry", from, to)),
        }
        self.status = to;
        Ok(())
    }

    pub fn fail(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        self.transition(QueueStatus::Failed, now)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn record_progress(&mut self, percentage: u8, now: DateTime<Utc>) {
        self.progress_percentage = percentage.min(100);
        self.last_progress_at = Some(now);
    }

    /// Instant the staleness threshold is measured from.
    pub fn staleness_reference(&self) -> Option<DateTime<Utc>> {
        self.last_progress_at.or(self.started_at)
    }

    pub fn view(&self) -> QueueEntryView {
        QueueEntryView {
            id: self.id,
            model_ref: self.model_ref.clone(),
            slicing_property_ref: self.slicing_property_ref.clone(),
            submitter_id: self.submitter_id.clone(),
            priority: self.priority,
            status: self.status,
            progress_percentage: self.progress_percentage,
            attempt: self.attempt,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
            result_ref: self.result_ref.clone(),
            preview_ref: self.preview_ref.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(priority: Option<u8>) -> SubmitSlicingRequest {
        SubmitSlicingRequest {
            model_ref: "benchy.stl".into(),
            slicing_property_ref: "pla-0.2mm".into(),
            submitter_id: "operator-1".into(),
            priority,
        }
    }

    #[test]
    fn priority_defaults_to_five_and_is_bounded() {
        let now = Utc::now();
        assert_eq!(QueueEntry::new(request(None), now).unwrap().priority, 5);
        assert!(matches!(QueueEntry::new(request(Some(0)), now), Err(FleetError::Validation(_))));
        assert!(matches!(QueueEntry::new(request(Some(11)), now), Err(FleetError::Validation(_))));
        assert_eq!(QueueEntry::new(request(Some(10)), now).unwrap().priority, 10);
    }

    #[test]
    fn blank_refs_are_rejected() {
        let mut req = request(None);
        req.model_ref = "  ".into();
        assert!(matches!(QueueEntry::new(req, Utc::now()), Err(FleetError::Validation(_))));
    }

    #[test]
    fn timestamps_follow_the_status() {
        let now = Utc::now();
        let mut entry = QueueEntry::new(request(None), now).unwrap();
        assert!(entry.started_at.is_none());

        entry.transition(QueueStatus::Processing, now).unwrap();
        assert_eq!(entry.started_at, Some(now));
        assert!(entry.completed_at.is_none());

        entry.transition(QueueStatus::Queued, now).unwrap();
        assert!(entry.started_at.is_none());
        assert_eq!(entry.attempt, 1);

        entry.transition(QueueStatus::Processing, now).unwrap();
        entry.transition(QueueStatus::Completed, now).unwrap();
        assert_eq!(entry.progress_percentage, 100);
        assert_eq!(entry.completed_at, Some(now));
    }

    #[test]
    fn terminal_entries_are_immutable() {
        let now = Utc::now();
        let mut entry = QueueEntry::new(request(None), now).unwrap();
        entry.transition(QueueStatus::Cancelled, now).unwrap();
        assert!(entry.started_at.is_none());
        for to in QueueStatus::ALL {
            assert!(entry.transition(*to, now).is_err());
        }
    }

    #[test]
    fn queued_entry_cannot_fail_directly() {
        let mut entry = QueueEntry::new(request(None), Utc::now()).unwrap();
        assert!(entry.fail("boom", Utc::now()).is_err());
        assert!(entry.error_message.is_none());
    }
}
