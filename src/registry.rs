//! Liveness and check-cadence state per driver agent.
//!
//! Readers are the dispatcher and the lifecycle manager; only the dispatcher
//! writes, which is why the mutators are crate-private.

use chrono::{DateTime, Utc};
use fleet_shared::protocol::CheckCriteria;
use fleet_shared::{Clock, DriverRef, JobId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::FleetError;

#[derive(Debug, Clone, PartialEq)]
pub struct DriverLink {
    pub driver: DriverRef,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Per-driver override; `None` means the registry default applies.
    pub check_criteria: Option<CheckCriteria>,
    pub active_job: Option<JobId>,
    /// False between a missed liveness window and the next contact.
    pub reachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessChange {
    Lost { driver: DriverRef, active_job: Option<JobId> },
    Restored { driver: DriverRef, active_job: Option<JobId> },
}

#[derive(Debug)]
pub struct DriverLinkRegistry {
    links: RwLock<HashMap<DriverRef, DriverLink>>,
    clock: Arc<dyn Clock>,
    window: chrono::Duration,
    default_criteria: CheckCriteria,
}

impl DriverLinkRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        window: chrono::Duration,
        default_criteria: CheckCriteria,
    ) -> Self {
        Self {
            links: RwLock::new(HashMap::new()),
            clock,
            window,
            default_criteria,
        }
    }

    /// Creates the link on first contact. Returns `Restored` when the driver
    /// had been marked unreachable.
    pub(crate) async fn record_heartbeat(&self, driver: &DriverRef) -> Option<LivenessChange> {
        let now = self.clock.now();
        let mut links = self.links.write().await;
        match links.get_mut(driver) {
            Some(link) => {
                link.last_heartbeat_at = now;
                if link.reachable {
                    None
                } else {
                    link.reachable = true;
                    Some(LivenessChange::Restored {
                        driver: driver.clone(),
                        active_job: link.active_job,
                    })
                }
            }
            None => {
                tracing::info!(%driver, "first contact from driver");
                links.insert(
                    driver.clone(),
                    DriverLink {
                        driver: driver.clone(),
                        last_heartbeat_at: now,
                        check_criteria: None,
                        active_job: None,
                        reachable: true,
                    },
                );
                None
            }
        }
    }

    /// Whether a heartbeat arrived within the liveness window.
    pub async fn is_alive(&self, driver: &DriverRef) -> bool {
        let now = self.clock.now();
        self.links
            .read()
            .await
            .get(driver)
            .is_some_and(|link| now - link.last_heartbeat_at <= self.window)
    }

    pub async fn check_criteria_for(&self, driver: &DriverRef) -> CheckCriteria {
        self.links
            .read()
            .await
            .get(driver)
            .and_then(|link| link.check_criteria)
            .unwrap_or(self.default_criteria)
    }

    pub(crate) async fn set_check_criteria(
        &self,
        driver: &DriverRef,
        criteria: CheckCriteria,
    ) -> Result<(), FleetError> {
        let mut links = self.links.write().await;
        let link = links
            .get_mut(driver)
            .ok_or_else(|| FleetError::not_found("driver", driver))?;
        link.check_criteria = Some(criteria);
        Ok(())
    }

    pub(crate) async fn set_active_job(
        &self,
        driver: &DriverRef,
        job: Option<JobId>,
    ) -> Result<(), FleetError> {
        let mut links = self.links.write().await;
        let link = links
            .get_mut(driver)
            .ok_or_else(|| FleetError::not_found("driver", driver))?;
        link.active_job = job;
        Ok(())
    }

    pub async fn active_job(&self, driver: &DriverRef) -> Option<JobId> {
        self.links.read().await.get(driver).and_then(|link| link.active_job)
    }

    pub async fn drivers(&self) -> Vec<DriverRef> {
        let mut drivers: Vec<DriverRef> = self.links.read().await.keys().cloned().collect();
        drivers.sort();
        drivers
    }

    /// Marks drivers whose last heartbeat is older than the window as
    /// unreachable. Each outage is reported once.
    pub(crate) async fn sweep(&self) -> Vec<LivenessChange> {
        let now = self.clock.now();
        let mut links = self.links.write().await;
        let mut changes = Vec::new();
        for link in links.values_mut() {
            if link.reachable && now - link.last_heartbeat_at > self.window {
                link.reachable = false;
                changes.push(LivenessChange::Lost {
                    driver: link.driver.clone(),
                    active_job: link.active_job,
                });
            }
        }
        changes
    }

    /// Drops a link. Refused while a job is bound to it.
    pub(crate) async fn forget(&self, driver: &DriverRef) -> Result<bool, FleetError> {
        let mut links = self.links.write().await;
        if let Some(job) = links.get(driver).and_then(|link| link.active_job) {
            return Err(FleetError::Conflict(format!(
                "driver {driver} is still bound to job {job}"
            )));
        }
        Ok(links.remove(driver).is_some())
    }
}
