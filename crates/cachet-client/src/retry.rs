//! Retry schedule for transient store faults.

use std::time::Duration;

/// Configuration for retry behavior on transient store errors.
///
/// The first retry happens quickly; after that the client polls once per
/// `steady_delay` until `retry_timeout` of wall-clock time has passed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total wall-clock budget for one logical operation (0 = no retries).
    pub retry_timeout: Duration,
    /// Delay before the first retry.
    pub first_delay: Duration,
    /// Delay before every later retry.
    pub steady_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_timeout: Duration::from_millis(5000),
            first_delay: Duration::from_millis(20),
            steady_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn with_timeout(retry_timeout: Duration) -> Self {
        Self {
            retry_timeout,
            ..Self::default()
        }
    }

    /// Delay before the next attempt, or `None` if the budget is spent.
    ///
    /// `failed_attempts` counts attempts made so far (1 after the first
    /// failure). The delay is clamped to the remaining budget so the final
    /// attempt lands at the deadline instead of after it.
    pub fn delay_before_retry(&self, failed_attempts: u32, elapsed: Duration) -> Option<Duration> {
        if elapsed >= self.retry_timeout {
            return None;
        }
        let remaining = self.retry_timeout - elapsed;
        let base = if failed_attempts <= 1 {
            self.first_delay
        } else {
            self.steady_delay
        };
        Some(base.min(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.retry_timeout, Duration::from_secs(5));
        assert_eq!(policy.first_delay, Duration::from_millis(20));
        assert_eq!(policy.steady_delay, Duration::from_secs(1));
    }

    #[test]
    fn first_retry_is_short() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_before_retry(1, Duration::from_millis(3)),
            Some(Duration::from_millis(20))
        );
    }

    #[test]
    fn later_retries_are_steady() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_before_retry(2, Duration::from_millis(30)),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            policy.delay_before_retry(4, Duration::from_millis(2030)),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn delay_clamped_to_remaining_budget() {
        let policy = RetryPolicy::with_timeout(Duration::from_millis(1500));
        assert_eq!(
            policy.delay_before_retry(2, Duration::from_millis(1200)),
            Some(Duration::from_millis(300))
        );
    }

    #[test]
    fn exhausted_budget_stops() {
        let policy = RetryPolicy::with_timeout(Duration::from_millis(100));
        assert_eq!(policy.delay_before_retry(3, Duration::from_millis(100)), None);
        assert_eq!(policy.delay_before_retry(3, Duration::from_millis(250)), None);
    }

    #[test]
    fn zero_budget_never_retries() {
        let policy = RetryPolicy::with_timeout(Duration::ZERO);
        assert_eq!(policy.delay_before_retry(1, Duration::ZERO), None);
    }
}
