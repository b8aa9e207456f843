//! Bounded exponential backoff for reconnection attempts

use std::time::Duration;

use crate::config::ReconnectPolicy;

/// Tracks attempts within one reconnection episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay waited after attempt `n` (1-based): `base * 2^(n-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << shift;
        let delay = self.policy.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.policy.max_delay_ms))
    }

    /// Starts the next attempt, returning its number and wait, or `None`
    /// once the attempt budget is spent.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some((self.attempt, self.delay_for(self.attempt)))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
