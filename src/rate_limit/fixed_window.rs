use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::trace;

use super::RateLimiter;
use crate::core::{ConfigError, RateLimitConfig};

struct FixedInner {
    permits: Semaphore,
    /// Finished operations whose permits return at the next refill.
    completed: AtomicUsize,
    armed: AtomicBool,
    window: Duration,
}

impl FixedInner {
    fn complete(self: &Arc<Self>) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        if self.armed.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            // Disarm first so a completion racing the refill arms a new timer.
            inner.armed.store(false, Ordering::SeqCst);
            let refill = inner.completed.swap(0, Ordering::SeqCst);
            trace!(refill, "fixed window refilled");
            inner.permits.add_permits(refill);
        });
    }
}

/// Returns the permit of an operation that finished or was dropped.
struct Completion<'a> {
    inner: &'a Arc<FixedInner>,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        self.inner.complete();
    }
}

/// `capacity` permits; permits used by finished operations come back together when the
/// window timer fires. The timer is one-shot and armed by the first completion after a refill.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    inner: Arc<FixedInner>,
}

impl FixedWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(FixedInner {
                permits: Semaphore::new(config.capacity as usize),
                completed: AtomicUsize::new(0),
                armed: AtomicBool::new(false),
                window: config.window,
            }),
        })
    }

    /// Permits available right now.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn perform<F, Fut, R>(&self, op: F) -> impl Future<Output = R> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
        R: Send,
    {
        async move {
            // The semaphore is never closed.
            if let Ok(permit) = self.inner.permits.acquire().await {
                permit.forget();
            }
            let _completion = Completion { inner: &self.inner };
            op().await
        }
    }
}
