use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ClientInner;
use crate::core::{ConnectionScope, DisconnectCause, Frame, WaitError};
use crate::transport::Transport;

/// Periodic ping and the predicate recognizing its echo.
#[derive(Clone)]
pub struct Keepalive {
    ping: Arc<dyn Fn() -> Bytes + Send + Sync>,
    is_echo: Arc<dyn Fn(&Frame) -> bool + Send + Sync>,
}

impl Keepalive {
    pub fn new<P, E>(ping: P, is_echo: E) -> Self
    where
        P: Fn() -> Bytes + Send + Sync + 'static,
        E: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        Self {
            ping: Arc::new(ping),
            is_echo: Arc::new(is_echo),
        }
    }
}

impl fmt::Debug for Keepalive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keepalive").finish_non_exhaustive()
    }
}

/// One task per connection. Each tick sends a ping and waits for the echo before sleeping
/// again; a missed echo forces the connection down the unexpected-close path.
pub(super) async fn run<T: Transport>(
    client: Weak<ClientInner<T>>,
    keepalive: Keepalive,
    mut scope: ConnectionScope,
    interval: Duration,
    pong_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;
            () = scope.cancelled() => return,
            () = tokio::time::sleep(interval) => {}
        }
        let Some(inner) = client.upgrade() else {
            return;
        };

        let is_echo = Arc::clone(&keepalive.is_echo);
        let pending = inner.raw_message_received.wait_for(move |frame| is_echo(frame));
        let started = Instant::now();
        if let Err(err) = inner.send_raw((keepalive.ping)()).await {
            debug!(connection = %inner.transport.endpoint(), error = %err, "keepalive ping not sent");
            return;
        }

        match pending.wait_within(pong_timeout, &mut scope).await {
            Ok(_) => inner.health.lock().record_rtt(started.elapsed()),
            Err(WaitError::Timeout(timeout)) => {
                warn!(
                    connection = %inner.transport.endpoint(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "keepalive echo not received"
                );
                inner.transport.abort(DisconnectCause::PongTimeout);
                return;
            }
            Err(WaitError::Cancelled) => return,
        }
    }
}
