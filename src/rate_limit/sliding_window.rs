use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use super::RateLimiter;
use crate::core::{ConfigError, RateLimitConfig};

/// Smallest step the timer resolves; keeps admission strictly after the window.
const TICK: Duration = Duration::from_millis(1);

/// At most `capacity` starts in any trailing `window`.
///
/// Keeps the start times of the last `capacity` operations; a new start waits until the
/// oldest one is strictly older than `window`.
pub struct SlidingWindowLimiter {
    capacity: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = config.capacity as usize;
        Ok(Self {
            capacity,
            window: config.window,
            starts: Mutex::new(VecDeque::with_capacity(capacity)),
        })
    }

    async fn enter(&self) {
        let mut starts = self.starts.lock().await;
        if starts.len() >= self.capacity {
            if let Some(&oldest) = starts.front() {
                tokio::time::sleep_until(oldest + self.window + TICK).await;
            }
            starts.pop_front();
        }
        starts.push_back(Instant::now());
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn perform<F, Fut, R>(&self, op: F) -> impl Future<Output = R> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
        R: Send,
    {
        async move {
            self.enter().await;
            op().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn third_call_waits_for_the_oldest_start_only() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig::new(2, WINDOW)).unwrap();
        let start = Instant::now();

        limiter.perform(|| async {}).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        limiter.perform(|| async {}).await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(100)).await;
        limiter.perform(|| async {}).await;
        let third = start.elapsed();
        assert!(third > WINDOW && third < WINDOW + Duration::from_millis(50), "{third:?}");

        // The second start (t=0.1) is now the oldest.
        limiter.perform(|| async {}).await;
        let fourth = start.elapsed();
        assert!(fourth > WINDOW + Duration::from_millis(100), "{fourth:?}");
        assert!(fourth < WINDOW + Duration::from_millis(150), "{fourth:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn start_exactly_one_window_later_still_waits() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig::new(1, WINDOW)).unwrap();
        let start = Instant::now();

        limiter.perform(|| async {}).await;
        tokio::time::sleep(WINDOW).await;
        assert_eq!(start.elapsed(), WINDOW);

        limiter.perform(|| async {}).await;
        assert!(start.elapsed() > WINDOW, "{:?}", start.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_operations_do_not_block_admission() {
        let limiter = Arc::new(SlidingWindowLimiter::new(RateLimitConfig::new(2, WINDOW)).unwrap());
        let start = Instant::now();

        let slow = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .perform(|| tokio::time::sleep(Duration::from_secs(30)))
                    .await;
            })
        };
        tokio::task::yield_now().await;

        limiter.perform(|| async {}).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        slow.abort();
    }

    #[test]
    fn invalid_config_is_rejected() {
        assert!(SlidingWindowLimiter::new(RateLimitConfig::new(0, WINDOW)).is_err());
    }
}
