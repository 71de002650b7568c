// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Bounded exponential backoff.

use std::time::Duration;

/// Backoff schedule for a bounded number of attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay to wait after failed attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay.as_millis() as f64);

        let final_ms = if self.jitter {
            capped_ms * (1.0 + rand::random::<f64>() * 0.25)
        } else {
            capped_ms
        };
        Duration::from_millis(final_ms as u64)
    }

    /// Whether another attempt is allowed after `attempt` (0-based) failed.
    #[must_use]
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_cap() {
        let backoff = Backoff::default().without_jitter();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let delay = backoff.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2_500));
        }
    }

    #[test]
    fn attempts_are_bounded() {
        let backoff = Backoff::default();
        assert!(backoff.should_retry(0));
        assert!(backoff.should_retry(1));
        assert!(!backoff.should_retry(2));
        assert!(!Backoff::default().with_max_attempts(1).should_retry(0));
    }
}
