//! Exponential backoff for outbound delivery

use rand::Rng;
use std::time::Duration;

/// Retry configuration with exponential backoff
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed flushes allowed before delivery gives up (including the first)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay before retry number `retry` (zero-based)
    #[must_use]
    pub fn backoff_duration(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let duration = if self.jitter {
            let jitter_factor = rand::thread_rng().gen_range(0..25) as f64 / 100.0;
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_millis(duration as u64)
    }

    /// True once `failures` failed flushes exhaust the policy
    #[must_use]
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff_calculation() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        };

        assert_eq!(config.backoff_duration(0).as_millis(), 100);
        assert_eq!(config.backoff_duration(1).as_millis(), 200);
        assert_eq!(config.backoff_duration(2).as_millis(), 400);

        // capped at max
        assert_eq!(config.backoff_duration(10).as_millis(), 10_000);
        assert_eq!(config.backoff_duration(u32::MAX).as_millis(), 10_000);
    }

    #[test]
    fn test_retry_backoff_with_jitter() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            jitter: true,
            ..Default::default()
        };

        for _ in 0..32 {
            let backoff = config.backoff_duration(0).as_millis();
            assert!((100..=125).contains(&backoff));
        }
    }

    #[test]
    fn test_exhaustion() {
        let config = RetryConfig {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(!config.is_exhausted(2));
        assert!(config.is_exhausted(3));
        assert!(config.is_exhausted(4));
    }
}
