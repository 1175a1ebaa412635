//! Failure counting and poll-interval extension shared by every polling source.

use std::time::{Duration, Instant};

/// Nominal interval plus the rule for stretching it after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub interval: Duration,
    pub failure_threshold: u32,
    pub multiplier: u32,
    /// How long the extended interval stays in force before failures are forgiven.
    pub cooldown: Duration,
}

impl BackoffPolicy {
    pub fn extended_interval(&self) -> Duration {
        self.interval * self.multiplier.max(1)
    }
}

#[derive(Debug, Default, Clone)]
pub struct BackoffState {
    failures: u32,
    backing_off_since: Option<Instant>,
}

impl BackoffState {
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn is_backing_off(&self) -> bool {
        self.backing_off_since.is_some()
    }

    pub fn record_success(&mut self) {
        self.reset();
    }

    pub fn record_failure(&mut self, policy: &BackoffPolicy, now: Instant) {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= policy.failure_threshold.max(1) && self.backing_off_since.is_none() {
            self.backing_off_since = Some(now);
        }
    }

    /// Forgives accumulated failures once the cooldown has run out.
    ///
    /// Called before each attempt, so the attempt after a back-off sleep starts
    /// from a clean counter.
    pub fn expire_cooldown(&mut self, policy: &BackoffPolicy, now: Instant) -> bool {
        match self.backing_off_since {
            Some(since) if now.saturating_duration_since(since) >= policy.cooldown => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn next_interval(&self, policy: &BackoffPolicy) -> Duration {
        if self.is_backing_off() {
            policy.extended_interval()
        } else {
            policy.interval
        }
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.backing_off_since = None;
    }
}
