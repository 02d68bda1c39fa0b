use fleet_shared::{DriverRef, QueueEntryId, RequestId, TransportError};
use thiserror::Error;

use crate::scheduler::engine::SlicingEngineError;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Driver {0} unavailable")]
    DriverUnavailable(DriverRef),
    #[error("Command {request_id} to driver {driver} timed out after {attempts} attempts")]
    CommandTimeout {
        driver: DriverRef,
        request_id: RequestId,
        attempts: u32,
    },
    #[error("Command {request_id} rejected by driver {driver}: {reason}")]
    CommandRejected {
        driver: DriverRef,
        request_id: RequestId,
        reason: String,
    },
    #[error("Queue entry {0} is stale")]
    StaleJob(QueueEntryId),
    #[error("Slicing engine error: {0}")]
    SlicingEngine(#[from] SlicingEngineError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("G-code source error: {0}")]
    Gcode(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Dispatcher is shutting down")]
    Shutdown,
}

impl FleetError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        FleetError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid_transition(
        kind: &'static str,
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
    ) -> Self {
        FleetError::Conflict(format!("{kind} cannot move from {from} to {to}"))
    }
}
