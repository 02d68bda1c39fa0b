use rand::Rng;
use std::time::Duration;

use fleet_shared::config::DispatcherConfig;

/// Retry schedule for unanswered commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            timeout: config.command_timeout(),
            max_retries: config.max_retries,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            jitter: Duration::from_millis(config.backoff_jitter_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max`, plus up to `jitter`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent).min(self.max);
        if self.jitter.is_zero() {
            return delay;
        }
        let extra = rand::rng().random_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(extra)
    }

    /// Total sends allowed for one command.
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ms: u64) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(1),
            max_retries: 5,
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            jitter: Duration::from_millis(jitter_ms),
        }
    }

    #[test]
    fn delay_doubles_until_capped() {
        let p = policy(0);
        let delays: Vec<u64> = (1..=6).map(|n| p.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn jitter_stays_within_bound() {
        let p = policy(50);
        for _ in 0..100 {
            let d = p.delay(1).as_millis();
            assert!((100..=150).contains(&d));
        }
    }

    #[test]
    fn attempts_include_first_send() {
        assert_eq!(policy(0).attempts(), 6);
    }
}
