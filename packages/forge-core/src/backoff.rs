//! Exponential backoff with jitter.
//!
//! Two consumers with slightly different contracts share this policy: the
//! queue reschedules retry `n` at `min(base * multiplier^(n-1), max)` with a
//! centered ±25% jitter, and the connector harness sleeps
//! `min(base * multiplier^attempt, max)` plus up to 10% additive jitter
//! between attempts.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
        }
    }

    /// Raw capped exponential delay for a zero-based exponent.
    pub fn raw_delay(&self, exponent: u32) -> Duration {
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retrying attempt `attempt_no` (1-based), jittered ±25%.
    pub fn queue_delay(&self, attempt_no: u32) -> Duration {
        let raw = self.raw_delay(attempt_no.saturating_sub(1));
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((raw.as_millis() as f64 * factor) as u64)
    }

    /// Sleep between harness attempts (zero-based), plus up to 10% jitter.
    pub fn harness_delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=0.10);
        Duration::from_millis((raw.as_millis() as f64 * (1.0 + jitter)) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_delay_doubles_until_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.raw_delay(0), Duration::from_secs(1));
        assert_eq!(policy.raw_delay(1), Duration::from_secs(2));
        assert_eq!(policy.raw_delay(2), Duration::from_secs(4));
        assert_eq!(policy.raw_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn queue_delay_stays_within_jitter_band() {
        let policy = BackoffPolicy::default();
        for _ in 0..50 {
            let d = policy.queue_delay(2);
            assert!(d >= Duration::from_millis(1500), "got {d:?}");
            assert!(d <= Duration::from_millis(2500), "got {d:?}");
        }
    }

    #[test]
    fn harness_delay_jitter_is_additive() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        for _ in 0..50 {
            let d = policy.harness_delay(1);
            assert!(d >= Duration::from_millis(200), "got {d:?}");
            assert!(d <= Duration::from_millis(220), "got {d:?}");
        }
    }

    #[test]
    fn raw_delay_grows_monotonically() {
        let policy = BackoffPolicy::default();
        for n in 0..8 {
            assert!(policy.raw_delay(n + 1) >= policy.raw_delay(n));
        }
    }
}
