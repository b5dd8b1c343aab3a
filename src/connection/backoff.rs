use std::time::Duration;

use rand::Rng;

/// Base delay for exponential backoff (milliseconds).
pub const RECONNECT_BASE_DELAY_MS: u64 = 1000;

/// Maximum delay for exponential backoff (milliseconds).
pub const RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Default number of reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Relative jitter applied to every computed delay.
pub const DEFAULT_JITTER: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Fraction of the delay added or removed at random, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(RECONNECT_MAX_DELAY_MS),
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl BackoffPolicy {
    pub fn has_attempts_left(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// `min(base * 2^attempt, max)`, before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// The delay to actually wait before reconnect attempt `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(self.base_delay_for(attempt), &mut rand::thread_rng())
    }

    pub fn jittered<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = 1.0 + rng.gen_range(-jitter..=jitter);
        delay.mul_f64(factor)
    }
}
