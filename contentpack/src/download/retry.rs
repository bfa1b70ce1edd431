//! Exponential backoff for transient transfer failures.

use std::time::Duration;

/// Default number of attempts per transfer, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one (minimum 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after the given failed attempt (1-based).
    ///
    /// Returns `None` once the attempt budget is spent.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts.max(1) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(
            delay.min(self.max_backoff.as_secs_f64()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.backoff(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.backoff(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.backoff(4), Some(Duration::from_millis(500)));
        assert_eq!(policy.backoff(9), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_backoff_exhausts() {
        let policy = RetryPolicy::default();
        assert!(policy.backoff(DEFAULT_MAX_ATTEMPTS - 1).is_some());
        assert!(policy.backoff(DEFAULT_MAX_ATTEMPTS).is_none());
        assert!(RetryPolicy::none().backoff(1).is_none());
    }
}
