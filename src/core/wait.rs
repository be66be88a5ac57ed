//! Correlated waits: await the next event matching a predicate, bounded by a timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use super::event::{Event, Subscription};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("no matching message within {0:?}")]
    Timeout(Duration),
    #[error("wait cancelled")]
    Cancelled,
}

/// Owner side of a cancellation scope. Cancelling is idempotent.
#[derive(Debug)]
pub struct ScopeHandle {
    tx: watch::Sender<bool>,
}

impl ScopeHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn scope(&self) -> ConnectionScope {
        ConnectionScope {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ScopeHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation signal shared by everything started within one connection's lifetime.
///
/// A scope whose [`ScopeHandle`] has been dropped counts as cancelled.
#[derive(Debug, Clone)]
pub struct ConnectionScope {
    rx: watch::Receiver<bool>,
}

impl ConnectionScope {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once the scope is cancelled.
    pub async fn cancelled(&mut self) {
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// A subscribed, not yet resolved correlated wait.
///
/// The handler is registered when the wait is created, so callers should create it before
/// sending the message that provokes the reply. It is removed when the wait finishes or is
/// dropped.
#[must_use = "a PendingWait does nothing until awaited"]
pub struct PendingWait<T> {
    rx: oneshot::Receiver<T>,
    subscription: Subscription,
}

impl<T> fmt::Debug for PendingWait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWait")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl<T> Event<T>
where
    T: Clone + Send + 'static,
{
    /// Subscribe a one-shot handler resolved by the first message matching `predicate`.
    ///
    /// Later matches are ignored.
    pub fn wait_for<P>(&self, predicate: P) -> PendingWait<T>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let subscription = self.subscribe(move |message: T| {
            if predicate(&message) {
                if let Some(tx) = slot.lock().take() {
                    let _ = tx.send(message);
                }
            }
            std::future::ready(Ok(()))
        });
        PendingWait { rx, subscription }
    }
}

impl<T> PendingWait<T> {
    /// Wait up to `timeout` for the match.
    pub async fn wait(self, timeout: Duration) -> Result<T, WaitError> {
        let Self { rx, subscription } = self;
        let outcome = resolve(timeout, rx).await;
        drop(subscription);
        outcome
    }

    /// Like [`PendingWait::wait`], but also gives up as soon as `scope` is cancelled.
    pub async fn wait_within(
        self,
        timeout: Duration,
        scope: &mut ConnectionScope,
    ) -> Result<T, WaitError> {
        let Self { rx, subscription } = self;
        let outcome = tokio::select! {
            biased;
            () = scope.cancelled() => Err(WaitError::Cancelled),
            outcome = resolve(timeout, rx) => outcome,
        };
        drop(subscription);
        outcome
    }
}

async fn resolve<T>(timeout: Duration, rx: oneshot::Receiver<T>) -> Result<T, WaitError> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(message)) => Ok(message),
        // The event (and with it the sender) is gone.
        Ok(Err(_)) => Err(WaitError::Cancelled),
        Err(_) => Err(WaitError::Timeout(timeout)),
    }
}
