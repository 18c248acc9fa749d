//! Retry policy and exponential backoff
//!
//! [`Backoff`] is a small state machine: it counts failed attempts and
//! remembers the previous delay. Each failure produces the next delay, or
//! `None` once the attempt budget is spent.
//!
//! The delay after failure `n` is `base * 2^(n-1)`, spread by a symmetric
//! jitter ratio, then clamped to `[previous delay, max_delay]`. A server
//! supplied retry-after hint replaces the computed value but is still capped
//! at `max_delay`.

use rand::Rng;
use std::time::Duration;

/// Largest exponent applied to the base delay
const MAX_EXPONENT: i32 = 30;

/// How many times to call and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total calls allowed, first attempt included; `None` retries forever
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter in `[0.0, 1.0]`
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            base_delay,
            max_delay,
            jitter,
        }
    }

    /// Policy that never gives up, for reconnect loops
    pub fn unbounded(base_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Self {
            max_attempts: None,
            base_delay,
            max_delay,
            jitter,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

/// Backoff state for one retry sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
    previous: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            previous: Duration::ZERO,
        }
    }

    /// Failed attempts recorded so far
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt and return how long to wait before the next
    ///
    /// Returns `None` when the failure used up the last allowed attempt.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.failures >= max)
        {
            return None;
        }

        let delay = match retry_after {
            Some(hint) => hint.min(self.policy.max_delay),
            None => self
                .jittered(self.exponential())
                .max(self.previous)
                .min(self.policy.max_delay),
        };

        self.previous = delay;
        Some(delay)
    }

    /// Forget past failures, e.g. after a successful reconnect
    pub fn reset(&mut self) {
        self.failures = 0;
        self.previous = Duration::ZERO;
    }

    fn exponential(&self) -> f64 {
        let exponent = i32::try_from(self.failures.saturating_sub(1))
            .unwrap_or(MAX_EXPONENT)
            .min(MAX_EXPONENT);
        self.policy.base_delay.as_secs_f64() * 2f64.powi(exponent)
    }

    fn jittered(&self, secs: f64) -> Duration {
        let ratio = self.policy.jitter.clamp(0.0, 1.0);
        let spread = if ratio > 0.0 {
            rand::rng().random_range(-ratio..=ratio)
        } else {
            0.0
        };
        let secs = (secs * (1.0 + spread)).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(self.policy.max_delay)
    }
}
