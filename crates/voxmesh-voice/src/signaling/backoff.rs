//! Reconnect backoff schedule.

use std::time::Duration;

/// Exponential reconnect schedule: attempt `n` (starting at 1) waits
/// `base_interval * 2^n`. Attempts past `max_attempts` are not scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(3000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_interval: Duration, max_attempts: u32) -> Self {
        Self {
            base_interval,
            max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt`, or `None` when that attempt
    /// is out of budget.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        Some(self.base_interval.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_relay_client() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.base_interval, Duration::from_secs(3));
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay(1), Some(Duration::from_secs(6)));
    }

    #[test]
    fn delay_doubles_each_attempt() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), 5);
        let delays: Vec<_> = (1..=5).map(|n| policy.delay(n).unwrap()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(1600),
                Duration::from_millis(3200),
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn nothing_scheduled_past_cap() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), 3);
        assert!(policy.delay(3).is_some());
        assert_eq!(policy.delay(4), None);
        assert_eq!(policy.delay(0), None);
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), u32::MAX);
        assert!(policy.delay(40).is_some());
    }
}
