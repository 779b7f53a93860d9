// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exponential backoff with full jitter for run retries.

use std::time::Duration;

use rand::Rng;

/// Retry backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay ceiling for the first retry.
    pub base: Duration,
    /// Absolute delay ceiling.
    pub cap: Duration,
    /// Ceiling growth factor per attempt.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Ceiling for the given attempt (1-based): `min(cap, base * mult^(k-1))`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62);
        let scaled = self.base.as_millis() as f64 * self.multiplier.powi(exponent as i32);
        let capped = scaled.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Full-jitter delay: uniform in `[0, ceiling(attempt)]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling_ms = self.ceiling(attempt).as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(0..=ceiling_ms);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_doubles_until_cap() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.ceiling(1), Duration::from_secs(1));
        assert_eq!(cfg.ceiling(2), Duration::from_secs(2));
        assert_eq!(cfg.ceiling(3), Duration::from_secs(4));
        assert_eq!(cfg.ceiling(6), Duration::from_secs(32));
        assert_eq!(cfg.ceiling(7), Duration::from_secs(60));
        assert_eq!(cfg.ceiling(20), Duration::from_secs(60));
    }

    #[test]
    fn test_delay_within_jitter_window() {
        let cfg = BackoffConfig::default();
        for attempt in 1..=8 {
            let ceiling = cfg.ceiling(attempt);
            for _ in 0..50 {
                let delay = cfg.delay(attempt);
                assert!(delay <= ceiling, "attempt {}: {:?} > {:?}", attempt, delay, ceiling);
            }
        }
    }

    #[test]
    fn test_large_attempt_does_not_overflow() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.ceiling(u32::MAX), Duration::from_secs(60));
    }
}
