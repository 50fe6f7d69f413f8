//! Backoff schedules for reconnection and failover.

use std::time::Duration;

/// Linear backoff: the delay grows with the attempt number, capped at a
/// maximum, and the schedule ends after a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    /// Delay unit multiplied by the attempt number.
    pub base_delay: Duration,
    /// Ceiling for the computed delay.
    pub max_delay: Duration,
    /// Attempts allowed before the schedule is exhausted.
    pub max_attempts: u32,
}

impl LinearBackoff {
    /// Schedule for reconnecting a dropped connection.
    pub fn reconnect() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    /// Schedule for pool-level call retries across nodes.
    pub fn failover() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    /// Delay before the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = self.base_delay.as_millis() as u64 * u64::from(attempt.max(1));
        Duration::from_millis(ms).min(self.max_delay)
    }

    /// Whether the schedule allows another attempt after `attempts` tries.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_linearly() {
        let backoff = LinearBackoff {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        };
        assert_eq!(backoff.delay_for_attempt(1).as_millis(), 100);
        assert_eq!(backoff.delay_for_attempt(2).as_millis(), 200);
        assert_eq!(backoff.delay_for_attempt(3).as_millis(), 300);
    }

    #[test]
    fn test_delay_caps_at_max() {
        let backoff = LinearBackoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            max_attempts: 10,
        };
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_secs(3));
    }

    #[test]
    fn test_attempt_zero_treated_as_one() {
        let backoff = LinearBackoff::reconnect();
        assert_eq!(backoff.delay_for_attempt(0), backoff.delay_for_attempt(1));
    }

    #[test]
    fn test_exhaustion_bound() {
        let backoff = LinearBackoff::failover();
        assert!(!backoff.exhausted(2));
        assert!(backoff.exhausted(3));
        assert!(backoff.exhausted(4));
    }
}
