//! Simulated printer driver agents for the fleet host.
//!
//! A [`SimFleet`] sits on the agent side of a bus, answers commands and
//! checks for every driver it owns, and emits heartbeats on a fixed
//! interval. Each driver can be told to misbehave through its
//! [`SimDriverHandle`].

pub mod driver;

pub use driver::{DriverLog, FaultPlan, SimDriverHandle};

use fleet_shared::protocol::Outbound;
use fleet_shared::{AgentEndpoint, DriverRef};
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub heartbeat_interval: Duration,
    /// Delay before each command response.
    pub response_delay: Duration,
    /// Upper bound of random extra delay added to `response_delay`.
    pub response_jitter: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            response_delay: Duration::ZERO,
            response_jitter: Duration::ZERO,
        }
    }
}

pub struct SimFleet {
    drivers: HashMap<DriverRef, SimDriverHandle>,
    task: JoinHandle<()>,
}

impl SimFleet {
    /// Starts serving `drivers` on `endpoint`. A heartbeat for every driver
    /// goes out immediately.
    pub fn spawn(
        endpoint: AgentEndpoint,
        drivers: impl IntoIterator<Item = DriverRef>,
        options: SimOptions,
    ) -> Self {
        let drivers: HashMap<DriverRef, SimDriverHandle> = drivers
            .into_iter()
            .map(|driver| (driver.clone(), SimDriverHandle::new(driver)))
            .collect();
        let served = drivers.clone();
        let task = tokio::spawn(serve(endpoint, served, options));
        tracing::info!(drivers = drivers.len(), "simulated fleet started");
        Self { drivers, task }
    }

    /// Drivers named `sim-0` .. `sim-{count-1}`.
    pub fn numbered(count: usize) -> Vec<DriverRef> {
        (0..count).map(|i| DriverRef::new(format!("sim-{i}"))).collect()
    }

    pub fn driver(&self, driver: &DriverRef) -> Option<SimDriverHandle> {
        self.drivers.get(driver).cloned()
    }

    pub fn drivers(&self) -> Vec<DriverRef> {
        let mut drivers: Vec<DriverRef> = self.drivers.keys().cloned().collect();
        drivers.sort();
        drivers
    }

    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
        tracing::info!("simulated fleet stopped");
    }
}

async fn serve(
    mut endpoint: AgentEndpoint,
    drivers: HashMap<DriverRef, SimDriverHandle>,
    options: SimOptions,
) {
    let mut beat = tokio::time::interval(options.heartbeat_interval);
    beat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = beat.tick() => {
                for handle in drivers.values() {
                    if let Some(heartbeat) = handle.heartbeat() {
                        if endpoint.replies.send(heartbeat).is_err() {
                            return;
                        }
                    }
                }
            }
            message = endpoint.requests.recv() => {
                let Some(message) = message else {
                    tracing::debug!("host side of the bus closed");
                    return;
                };
                let Some(handle) = drivers.get(message.driver()) else {
                    let driver = message.driver();
                    tracing::warn!(%driver, "message for unknown simulated driver");
                    continue;
                };
                let replies = match message {
                    Outbound::Command(request) => {
                        let replies = handle.on_command(request);
                        if !replies.is_empty() {
                            let delay = response_delay(&options);
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        replies
                    }
                    Outbound::Check(request) => handle.on_check(request).into_iter().collect(),
                };
                for reply in replies {
                    if endpoint.replies.send(reply).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn response_delay(options: &SimOptions) -> Duration {
    let jitter_ms = options.response_jitter.as_millis() as u64;
    if jitter_ms == 0 {
        return options.response_delay;
    }
    options.response_delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_shared::{AgentTransport, RequestId};
    use fleet_shared::channel_bus;
    use fleet_shared::protocol::{CommandPayload, CommandRequest, Inbound, PRIORITY_STREAM};

    #[tokio::test]
    async fn heartbeats_then_command_round_trip() {
        let mut bus = channel_bus();
        let fleet = SimFleet::spawn(bus.agent, SimFleet::numbered(2), SimOptions::default());

        let mut seen = Vec::new();
        for _ in 0..2 {
            match bus.inbound.recv().await.unwrap() {
                Inbound::Heartbeat(h) => seen.push(h.driver),
                other => panic!("expected heartbeat, got {other:?}"),
            }
        }
        seen.sort();
        assert_eq!(seen, fleet.drivers());

        let driver = DriverRef::new("sim-1");
        bus.transport
            .publish(Outbound::Command(CommandRequest {
                driver: driver.clone(),
                request_id: RequestId(1),
                payload: CommandPayload::Line("G28".into()),
                priority: PRIORITY_STREAM,
            }))
            .await
            .unwrap();
        match bus.inbound.recv().await.unwrap() {
            Inbound::CommandResponse(r) => assert!(r.ok && r.driver == driver),
            other => panic!("expected command response, got {other:?}"),
        }
        assert_eq!(fleet.driver(&driver).unwrap().executed_lines(), 1);
        fleet.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_driver_skips_heartbeats() {
        let mut bus = channel_bus();
        let options = SimOptions {
            heartbeat_interval: Duration::from_millis(100),
            ..Default::default()
        };
        let fleet = SimFleet::spawn(bus.agent, SimFleet::numbered(1), options);
        assert!(matches!(bus.inbound.recv().await, Some(Inbound::Heartbeat(_))));

        fleet.driver(&DriverRef::new("sim-0")).unwrap().set_silent(true);
        let quiet = tokio::time::timeout(Duration::from_millis(350), bus.inbound.recv()).await;
        assert!(quiet.is_err());
        fleet.shutdown().await;
    }
}
