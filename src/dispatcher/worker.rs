//! One task per driver. Owns the driver's outbound queue and its single
//! in-flight command; everything that touches them arrives as a message, so
//! no lock is shared between drivers.

use fleet_shared::protocol::{
    CheckCriteria, CheckRequest, CommandRequest, CommandResponse, Outbound,
};
use fleet_shared::{AgentTransport, Clock, CommandStatus, DriverRef, JobId, RequestId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, WeakUnboundedSender, unbounded_channel};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::DispatcherEvent;
use super::backoff::RetryPolicy;
use super::check::CheckTrigger;
use super::queue::{CommandAck, InFlightCommand, OutboundQueue, QueuedCommand};
use crate::error::FleetError;
use crate::registry::DriverLinkRegistry;

#[derive(Debug)]
pub(crate) enum WorkerMsg {
    Submit(QueuedCommand),
    Response(CommandResponse),
    Timeout { request_id: RequestId, attempt: u32 },
    Retry { request_id: RequestId, attempt: u32 },
    PollCheck,
    Snapshot(oneshot::Sender<DriverQueueSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightView {
    pub request_id: RequestId,
    pub status: CommandStatus,
    pub attempt: u32,
    pub priority: u8,
    pub job: Option<JobId>,
}

/// Point-in-time view of one driver's queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverQueueSnapshot {
    pub driver: DriverRef,
    pub in_flight: Option<InFlightView>,
    /// Waiting commands in the order they will be sent.
    pub queued: Vec<RequestId>,
    pub commands_since_check: u32,
}

pub(crate) struct WorkerDeps {
    pub transport: Arc<dyn AgentTransport>,
    pub registry: Arc<DriverLinkRegistry>,
    pub clock: Arc<dyn Clock>,
    pub events: UnboundedSender<DispatcherEvent>,
    pub policy: RetryPolicy,
}

pub(crate) struct DriverWorker {
    driver: DriverRef,
    deps: WorkerDeps,
    inbox: UnboundedReceiver<WorkerMsg>,
    timers: WeakUnboundedSender<WorkerMsg>,
    queue: OutboundQueue,
    in_flight: Option<InFlightCommand>,
    check: CheckTrigger,
}

pub(crate) fn spawn(driver: DriverRef, deps: WorkerDeps) -> UnboundedSender<WorkerMsg> {
    let (tx, inbox) = unbounded_channel();
    let worker = DriverWorker {
        check: CheckTrigger::new(deps.clock.now()),
        driver,
        deps,
        inbox,
        timers: tx.downgrade(),
        queue: OutboundQueue::default(),
        in_flight: None,
    };
    tokio::spawn(worker.run());
    tx
}

impl DriverWorker {
    async fn run(mut self) {
        tracing::debug!(driver = %self.driver, "driver worker started");
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                WorkerMsg::Submit(command) => {
                    self.queue.push(command);
                    self.pump().await;
                }
                WorkerMsg::Response(response) => self.on_response(response).await,
                WorkerMsg::Timeout { request_id, attempt } => {
                    self.on_timeout(request_id, attempt).await;
                }
                WorkerMsg::Retry { request_id, attempt } => {
                    self.on_retry(request_id, attempt).await;
                }
                WorkerMsg::PollCheck => self.poll_check().await,
                WorkerMsg::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                WorkerMsg::Shutdown => break,
            }
        }
        self.abort_all();
        tracing::debug!(driver = %self.driver, "driver worker stopped");
    }

    /// Sends the head of the queue when nothing is in flight.
    async fn pump(&mut self) {
        while self.in_flight.is_none() {
            let Some(next) = self.queue.pop() else {
                return;
            };
            let mut command = InFlightCommand::from_queued(self.driver.clone(), next);
            self.transmit(&mut command).await;
            self.in_flight = Some(command);

            let criteria = self.deps.registry.check_criteria_for(&self.driver).await;
            if self.check.record_command(&criteria) {
                self.issue_check(criteria).await;
            }
        }
    }

    async fn transmit(&mut self, command: &mut InFlightCommand) {
        let request = Outbound::Command(CommandRequest {
            driver: self.driver.clone(),
            request_id: command.request_id,
            payload: command.payload.clone(),
            priority: command.priority,
        });
        match self.deps.transport.publish(request).await {
            Ok(()) => tracing::debug!(
                driver = %self.driver,
                request_id = %command.request_id,
                attempt = command.attempt,
                topic = command.payload.topic(),
                "command sent"
            ),
            Err(e) => tracing::warn!(
                driver = %self.driver,
                request_id = %command.request_id,
                "publish failed, waiting for timeout: {}",
                e
            ),
        }
        command.status = CommandStatus::Sent;
        let timer = self.arm(
            WorkerMsg::Timeout {
                request_id: command.request_id,
                attempt: command.attempt,
            },
            self.deps.policy.timeout,
        );
        command.replace_timer(timer);
    }

    fn arm(&self, msg: WorkerMsg, after: Duration) -> JoinHandle<()> {
        let tx = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(msg);
            }
        })
    }

    async fn on_response(&mut self, response: CommandResponse) {
        let command = match self.in_flight.take() {
            Some(command) if command.request_id == response.request_id => command,
            other => {
                self.in_flight = other;
                tracing::debug!(
                    driver = %self.driver,
                    request_id = %response.request_id,
                    "discarding unmatched or duplicate response"
                );
                return;
            }
        };

        let request_id = command.request_id;
        if response.ok {
            let ack = CommandAck {
                request_id,
                info: response.info,
                attempts: command.attempt + 1,
            };
            command.finish(CommandStatus::Acked, Ok(ack));
        } else {
            let reason = response
                .exception
                .unwrap_or_else(|| "rejected without reason".to_string());
            tracing::warn!(driver = %self.driver, %request_id, "command rejected: {}", reason);
            self.emit(DispatcherEvent::CommandFailed {
                driver: self.driver.clone(),
                request_id,
                job: command.job,
                reason: reason.clone(),
                timed_out: false,
            });
            let err = FleetError::CommandRejected {
                driver: self.driver.clone(),
                request_id,
                reason,
            };
            command.finish(CommandStatus::Failed, Err(err));
        }
        self.pump().await;
    }

    async fn on_timeout(&mut self, request_id: RequestId, attempt: u32) {
        let mut command = match self.in_flight.take() {
            Some(command)
                if command.request_id == request_id
                    && command.attempt == attempt
                    && command.status == CommandStatus::Sent =>
            {
                command
            }
            other => {
                self.in_flight = other;
                return;
            }
        };

        let attempts = attempt + 1;
        if attempts < self.deps.policy.attempts() {
            let retry = attempt + 1;
            let delay = self.deps.policy.delay(retry);
            tracing::warn!(
                driver = %self.driver,
                %request_id,
                retry,
                "no response, retrying in {:?}",
                delay
            );
            command.status = CommandStatus::Pending;
            let timer = self.arm(WorkerMsg::Retry { request_id, attempt: retry }, delay);
            command.replace_timer(timer);
            self.in_flight = Some(command);
            return;
        }

        tracing::error!(driver = %self.driver, %request_id, attempts, "command timed out");
        self.emit(DispatcherEvent::CommandFailed {
            driver: self.driver.clone(),
            request_id,
            job: command.job,
            reason: format!("no response after {attempts} attempts"),
            timed_out: true,
        });
        let err = FleetError::CommandTimeout {
            driver: self.driver.clone(),
            request_id,
            attempts,
        };
        command.finish(CommandStatus::TimedOut, Err(err));
        self.pump().await;
    }

    async fn on_retry(&mut self, request_id: RequestId, attempt: u32) {
        match self.in_flight.take() {
            Some(mut command)
                if command.request_id == request_id
                    && command.status == CommandStatus::Pending
                    && attempt == command.attempt + 1 =>
            {
                command.attempt = attempt;
                self.transmit(&mut command).await;
                self.in_flight = Some(command);
            }
            other => self.in_flight = other,
        }
    }

    async fn poll_check(&mut self) {
        let criteria = self.deps.registry.check_criteria_for(&self.driver).await;
        if self.check.due_by_time(&criteria, self.deps.clock.now()) {
            self.issue_check(criteria).await;
        }
    }

    async fn issue_check(&mut self, criteria: CheckCriteria) {
        let job_ref = self.deps.registry.active_job(&self.driver).await;
        let request = Outbound::Check(CheckRequest {
            driver: self.driver.clone(),
            criteria,
            job_ref,
        });
        match self.deps.transport.publish(request).await {
            Ok(()) => tracing::debug!(driver = %self.driver, "check issued"),
            Err(e) => tracing::warn!(driver = %self.driver, "check publish failed: {}", e),
        }
        self.check.reset(self.deps.clock.now());
    }

    fn emit(&self, event: DispatcherEvent) {
        if self.deps.events.send(event).is_err() {
            tracing::trace!(driver = %self.driver, "no dispatcher event listener");
        }
    }

    fn snapshot(&self) -> DriverQueueSnapshot {
        DriverQueueSnapshot {
            driver: self.driver.clone(),
            in_flight: self.in_flight.as_ref().map(|c| InFlightView {
                request_id: c.request_id,
                status: c.status,
                attempt: c.attempt,
                priority: c.priority,
                job: c.job,
            }),
            queued: self.queue.send_order(),
            commands_since_check: self.check.sent_since_check(),
        }
    }

    fn abort_all(&mut self) {
        if let Some(command) = self.in_flight.take() {
            command.finish(CommandStatus::Failed, Err(FleetError::Shutdown));
        }
        for queued in self.queue.drain() {
            let _ = queued.completion.send(Err(FleetError::Shutdown));
        }
    }
}
