use chrono::{DateTime, Utc};
use fleet_shared::protocol::CheckCriteria;
use fleet_shared::saturating_seconds;

/// Tracks both check triggers for one driver. Whichever fires first issues
/// the check, and issuing a check resets both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTrigger {
    sent_since_check: u32,
    last_check_at: DateTime<Utc>,
}

impl CheckTrigger {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            sent_since_check: 0,
            last_check_at: now,
        }
    }

    /// Counts one delivered command; true when the count trigger is due.
    pub fn record_command(&mut self, criteria: &CheckCriteria) -> bool {
        self.sent_since_check = self.sent_since_check.saturating_add(1);
        criteria
            .every_commands
            .is_some_and(|n| n > 0 && self.sent_since_check >= n)
    }

    pub fn due_by_time(&self, criteria: &CheckCriteria, now: DateTime<Utc>) -> bool {
        criteria
            .every_secs
            .is_some_and(|secs| secs > 0 && now - self.last_check_at >= saturating_seconds(secs))
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.sent_since_check = 0;
        self.last_check_at = now;
    }

    pub fn sent_since_check(&self) -> u32 {
        self.sent_since_check
    }
}
