//! Reconnect backoff state
//!
//! Attempt `n` (n >= 1) waits `min(2^n s, max_delay)`. Once the attempt
//! counter exceeds `max_retries` no further delay is offered and the feed
//! terminates. A successful connect resets the sequence.

use std::time::Duration;

/// Reconnect limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 300,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Delay for attempt `n`: `min(2^n seconds, max_delay)`
    #[inline]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.max_delay)
    }
}

/// Attempt counter driven by the feed state machine
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Record a failure. Returns the delay before the next attempt, or
    /// `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.attempt > self.policy.max_retries {
            None
        } else {
            Some(self.policy.delay_for(self.attempt))
        }
    }

    /// Record a successful connect. Returns true if it was a reconnection.
    pub fn on_connected(&mut self) -> bool {
        let reconnected = self.attempt > 0;
        self.attempt = 0;
        reconnected
    }

    #[inline]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}
