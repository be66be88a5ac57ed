//! Admission control for outbound operations.
//!
//! Every limiter counts an operation when it starts, not when it finishes. Admission is
//! serialized per limiter; the operation itself runs outside the critical section.

use std::future::Future;
use std::sync::Arc;

pub mod bucket;
pub mod fixed_window;
pub mod sliding_window;

pub use bucket::{QuotaBucket, QuotaBucketConfig, QuotaBuckets};
pub use fixed_window::FixedWindowLimiter;
pub use sliding_window::SlidingWindowLimiter;

pub trait RateLimiter: Send + Sync {
    /// Wait for admission, then run `op`. Waiting blocks; it never fails.
    fn perform<F, Fut, R>(&self, op: F) -> impl Future<Output = R> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
        R: Send;
}

impl<L: RateLimiter> RateLimiter for Arc<L> {
    fn perform<F, Fut, R>(&self, op: F) -> impl Future<Output = R> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = R> + Send,
        R: Send,
    {
        (**self).perform(op)
    }
}
