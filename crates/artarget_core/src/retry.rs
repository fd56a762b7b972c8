use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Job-level retry budget and backoff curve.
///
/// The delay after a failed attempt `n` is `base * 2^n`, so with the default
/// one second base the waits are 2s, 4s, 8s, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
        }
    }

    /// Backoff to wait after `attempt` failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        self.base.saturating_mul(1u32 << exponent)
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
