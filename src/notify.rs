//! Alerts handed to whatever notifies operators.

use async_trait::async_trait;
use fleet_shared::protocol::AgentException;
use fleet_shared::{DriverRef, JobId};

#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub driver: DriverRef,
    pub job: Option<JobId>,
    pub exceptions: Vec<AgentException>,
}

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn alert(&self, alert: Alert);
}

/// Default notifier: writes the alert to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl AlertNotifier for TracingNotifier {
    async fn alert(&self, alert: Alert) {
        for exception in &alert.exceptions {
            tracing::warn!(
                driver = %alert.driver,
                job = ?alert.job,
                code = %exception.code,
                severity = ?exception.severity,
                "printer fault: {}",
                exception.message
            );
        }
    }
}
