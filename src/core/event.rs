//! Ordered multi-subscriber events.
//!
//! Handlers run one after another in subscription order. Each invocation sits behind its own
//! error/panic boundary, so a failing handler is logged and the remaining handlers still run.
//! A watchdog logs a warning when a single dispatch runs longer than the configured threshold;
//! the handlers are never cancelled.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{error, warn};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;

type Handler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct EventInner<T> {
    name: &'static str,
    warn_after: Duration,
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<T>)>>,
}

/// A named event with an ordered list of async handlers.
///
/// Clones share the same subscriber list.
pub struct Event<T> {
    inner: Arc<EventInner<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.inner.name)
            .field("subscribers", &self.inner.handlers.lock().len())
            .finish()
    }
}

impl<T> Event<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(name: &'static str, warn_after: Duration) -> Self {
        Self {
            inner: Arc::new(EventInner {
                name,
                warn_after,
                next_id: AtomicU64::new(0),
                handlers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Register `handler`; it stays registered until the returned handle is dropped.
    pub fn subscribe<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handler: Handler<T> = Arc::new(move |arg| handler(arg).boxed());
        self.inner.handlers.lock().push((id, handler));

        let weak = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.handlers.lock().retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Run every handler registered at the time of the call, in order.
    pub async fn emit(&self, arg: T) {
        let handlers: Vec<Handler<T>> = self
            .inner
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        if handlers.is_empty() {
            return;
        }

        let name = self.inner.name;
        let dispatch = async move {
            for handler in handlers {
                let arg = arg.clone();
                run_guarded(name, async move { handler(arg).await }).await;
            }
        };
        tokio::pin!(dispatch);

        tokio::select! {
            () = &mut dispatch => return,
            () = tokio::time::sleep(self.inner.warn_after) => {
                warn!(
                    event = name,
                    threshold = ?self.inner.warn_after,
                    "event handlers are taking too long to execute"
                );
            }
        }
        dispatch.await;
    }
}

/// Await `fut`, logging its error or panic instead of propagating it.
pub(crate) async fn run_guarded<F>(event: &'static str, fut: F)
where
    F: Future<Output = HandlerResult>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(event, error = %err, "event handler failed"),
        Err(panic) => error!(event, panic = panic_message(&*panic), "event handler panicked"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        *message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Registration handle returned by [`Event::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription removes the handler immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}

    /// Keep the handler registered for as long as the event lives.
    pub fn detach(mut self) {
        self.detach = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.detach.is_some())
            .finish()
    }
}
