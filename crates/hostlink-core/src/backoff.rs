//! Reconnect delay policies.
//!
//! A policy maps the number of consecutive failed attempts to the delay
//! before the next one. Every policy here is monotonically non-decreasing
//! in the attempt number, jitter included.

use crate::config::BusConfig;
use rand::Rng;
use std::fmt::Debug;
use std::time::Duration;

/// Delay strategy used by the connection manager between reconnect attempts.
pub trait ReconnectPolicy: Debug + Send + Sync {
    /// Delay before attempt `attempt + 1` (0-indexed).
    fn delay(&self, attempt: u32) -> Duration;
}

/// The same delay before every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectPolicy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff with optional jitter and a delay cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (typically 2.0 for doubling).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: BusConfig::MAX_RECONNECT_DELAY,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the growth factor. Values below 1.0 are clamped to 1.0.
    pub fn with_exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn nominal_secs(&self, attempt: u32) -> f64 {
        // base * (exponential_base ^ attempt), capped
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let multiplier = self.exponential_base.max(1.0).powi(exponent);
        let secs = self.base_delay.as_secs_f64() * multiplier;
        if secs.is_finite() {
            secs.min(self.max_delay.as_secs_f64())
        } else {
            self.max_delay.as_secs_f64()
        }
    }
}

impl ReconnectPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let low = self.nominal_secs(attempt);
        if !self.jitter {
            return Duration::from_secs_f64(low);
        }

        // Jitter stays inside [d(attempt), d(attempt + 1)) so a later attempt
        // never waits less than an earlier one.
        let high = self.nominal_secs(attempt.saturating_add(1));
        if high <= low {
            return Duration::from_secs_f64(low);
        }

        let mut rng = rand::rng();
        Duration::from_secs_f64(rng.random_range(low..high))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_ignores_attempt() {
        let policy = FixedDelay::new(Duration::from_secs(5));
        assert_eq!(policy.delay(0), Duration::from_secs(5));
        assert_eq!(policy.delay(100), Duration::from_secs(5));
    }

    #[test]
    fn test_delay_calculation_no_jitter() {
        let policy = ExponentialBackoff::new()
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = ExponentialBackoff::new()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(false);

        assert_eq!(policy.delay(5), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jittered_delays_are_non_decreasing() {
        let policy = ExponentialBackoff::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5));

        for _ in 0..20 {
            let mut previous = Duration::ZERO;
            for attempt in 0..12 {
                let delay = policy.delay(attempt);
                assert!(delay >= previous, "attempt {} went backwards", attempt);
                assert!(delay <= Duration::from_secs(5));
                previous = delay;
            }
        }
    }

    #[test]
    fn test_default_cap_is_max_reconnect_delay() {
        let policy = ExponentialBackoff::default().with_jitter(false);
        assert_eq!(policy.delay(40), BusConfig::MAX_RECONNECT_DELAY);
    }

    #[test]
    fn test_base_below_one_is_clamped() {
        let policy = ExponentialBackoff::new()
            .with_base_delay(Duration::from_secs(2))
            .with_exponential_base(0.5)
            .with_jitter(false);
        assert_eq!(policy.delay(3), Duration::from_secs(2));
    }
}
