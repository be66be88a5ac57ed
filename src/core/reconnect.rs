use std::time::Duration;

/// Policy for spacing reconnect attempts after an unexpected disconnect.
///
/// The client owns the attempt counter; strategies stay stateless so one instance can be
/// shared by every client that uses it.
pub trait ReconnectStrategy: Send + Sync + 'static {
    /// Delay before attempt `attempt`; attempt 0 is the first try after a drop.
    fn delay(&self, attempt: u32) -> Duration;
}

impl<F> ReconnectStrategy for F
where
    F: Fn(u32) -> Duration + Send + Sync + 'static,
{
    fn delay(&self, attempt: u32) -> Duration {
        self(attempt)
    }
}

/// Doubling backoff: immediate first retry, then `base * 2^(n-1)` capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(128))
    }
}

impl ReconnectStrategy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles_and_caps() {
        let backoff = ExponentialBackoff::default();
        let delays: Vec<u64> = (0..=9).map(|n| backoff.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![0, 1, 2, 4, 8, 16, 32, 64, 128, 128]);
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.delay(40), Duration::from_secs(128));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(128));
    }

    #[test]
    fn closures_are_strategies() {
        let fixed = |_attempt: u32| Duration::from_millis(250);
        assert_eq!(fixed.delay(0), Duration::from_millis(250));
        assert_eq!(fixed.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn custom_base_scales_schedule() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
    }
}
