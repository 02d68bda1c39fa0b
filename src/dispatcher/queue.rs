//! Per-driver outbound queue and the single in-flight command.

use chrono::{DateTime, Utc};
use fleet_shared::protocol::CommandPayload;
use fleet_shared::{CommandStatus, DriverRef, JobId, RequestId};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::FleetError;

/// Successful outcome of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    pub request_id: RequestId,
    pub info: Option<String>,
    /// Number of sends it took, first send included.
    pub attempts: u32,
}

pub(crate) type Completion = oneshot::Sender<Result<CommandAck, FleetError>>;

/// A command waiting for its turn.
#[derive(Debug)]
pub(crate) struct QueuedCommand {
    pub request_id: RequestId,
    pub payload: CommandPayload,
    pub priority: u8,
    pub job: Option<JobId>,
    pub submitted_at: DateTime<Utc>,
    pub completion: Completion,
}

impl PartialEq for QueuedCommand {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedCommand {}

impl PartialOrd for QueuedCommand {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap order: higher priority first, then lower request id.
impl Ord for QueuedCommand {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.request_id.cmp(&self.request_id))
    }
}

#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    heap: BinaryHeap<QueuedCommand>,
}

impl OutboundQueue {
    pub fn push(&mut self, command: QueuedCommand) {
        self.heap.push(command);
    }

    pub fn pop(&mut self) -> Option<QueuedCommand> {
        self.heap.pop()
    }

    /// Request ids in the order they will be sent.
    pub fn send_order(&self) -> Vec<RequestId> {
        let mut pending: Vec<&QueuedCommand> = self.heap.iter().collect();
        pending.sort_by(|a, b| b.cmp(a));
        pending.into_iter().map(|c| c.request_id).collect()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedCommand> + '_ {
        self.heap.drain()
    }
}

/// The command currently on the wire for a driver. Destroyed once it
/// reaches a terminal status.
#[derive(Debug)]
pub struct InFlightCommand {
    pub request_id: RequestId,
    pub driver: DriverRef,
    pub payload: CommandPayload,
    pub priority: u8,
    pub job: Option<JobId>,
    pub submitted_at: DateTime<Utc>,
    pub status: CommandStatus,
    /// 0 for the first send.
    pub attempt: u32,
    pub(crate) timer: Option<JoinHandle<()>>,
    pub(crate) completion: Option<Completion>,
}

impl InFlightCommand {
    pub(crate) fn from_queued(driver: DriverRef, queued: QueuedCommand) -> Self {
        Self {
            request_id: queued.request_id,
            driver,
            payload: queued.payload,
            priority: queued.priority,
            job: queued.job,
            submitted_at: queued.submitted_at,
            status: CommandStatus::Pending,
            attempt: 0,
            timer: None,
            completion: Some(queued.completion),
        }
    }

    pub(crate) fn replace_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(timer) {
            old.abort();
        }
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Resolves the submitter's receipt and consumes the command.
    pub(crate) fn finish(mut self, status: CommandStatus, outcome: Result<CommandAck, FleetError>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.cancel_timer();
        if let Some(completion) = self.completion.take() {
            let _ = completion.send(outcome);
        }
    }
}
