//! Attempt count to delay policies used by the outbox relay.

use std::time::Duration;

/// Maps a record's attempt count to a pause.
pub trait BackoffPolicy: Send + Sync {
    fn delay(&self, attempts: u32) -> Duration;
}

/// `base * factor^(attempts - 1)`, capped at `max`. Zero attempts means no
/// delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, factor: f64, max: Duration) -> Self {
        Self { base, factor, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempts: u32) -> Duration {
        if attempts == 0 {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base.as_millis() as f64 * self.factor.max(1.0).powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max
        }
    }
}

/// Never waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn delay(&self, _attempts: u32) -> Duration {
        Duration::ZERO
    }
}

/// Closure-backed policy, see [`backoff_fn`].
pub struct FnBackoff<F>(F);

pub fn backoff_fn<F>(f: F) -> FnBackoff<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    FnBackoff(f)
}

impl<F> BackoffPolicy for FnBackoff<F>
where
    F: Fn(u32) -> Duration + Send + Sync,
{
    fn delay(&self, attempts: u32) -> Duration {
        (self.0)(attempts)
    }
}
