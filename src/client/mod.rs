//! A logical connection that survives transient disconnects.
//!
//! [`PersistentClient`] wraps a [`FramedTransport`]. Unexpected closes after a successful
//! connect start a reconnect loop with backoff that runs until it succeeds or
//! [`PersistentClient::disconnect`] stops it. Connect and disconnect are serialized by one gate.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::event::run_guarded;
use crate::core::{
    ClientOptions, ConfigError, ConnectionScope, ConnectionState, ConnectionStats,
    DisconnectCause, Event, ExponentialBackoff, Frame, FramingConfig, HealthMonitor,
    ReconnectStrategy, ScopeHandle, SocketError, SocketResult, Subscription, WaitError,
};
use crate::rate_limit::RateLimiter;
use crate::transport::{FramedTransport, Transport, TungsteniteTransport};

pub mod hooks;
mod keepalive;
mod login;

pub use hooks::{ClientHooks, ConnectHook, RawMessageHook};
pub use keepalive::Keepalive;
pub use login::{LoginHandshake, LoginReply};

/// Everything needed to build a [`PersistentClient`].
pub struct PersistentClientArgs<T: Transport> {
    pub transport: T,
    pub options: ClientOptions,
    pub framing: FramingConfig,
    pub reconnect: Arc<dyn ReconnectStrategy>,
    pub hooks: ClientHooks<T>,
    pub login: Option<LoginHandshake>,
    pub keepalive: Option<Keepalive>,
}

impl<T: Transport> PersistentClientArgs<T> {
    /// Default options, CRLF framing, exponential backoff, no login and no keepalive.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            options: ClientOptions::default(),
            framing: FramingConfig::default(),
            reconnect: Arc::new(ExponentialBackoff::default()),
            hooks: ClientHooks::default(),
            login: None,
            keepalive: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectKind {
    Initial,
    Reconnect,
}

struct ReconnectTask {
    handle: JoinHandle<()>,
    cancel: ScopeHandle,
}

#[derive(Default)]
struct Tasks {
    reconnect: Option<ReconnectTask>,
    keepalive: Option<JoinHandle<()>>,
}

struct ClientInner<T: Transport> {
    transport: FramedTransport<T>,
    options: ClientOptions,
    backoff: Arc<dyn ReconnectStrategy>,
    hooks: ClientHooks<T>,
    login: Option<LoginHandshake>,
    keepalive: Option<Keepalive>,
    gate: tokio::sync::Mutex<()>,
    stopping: AtomicBool,
    /// Set once login and hooks succeeded for the live connection.
    established: AtomicBool,
    attempts: AtomicU32,
    tasks: Mutex<Tasks>,
    health: Mutex<HealthMonitor>,
    connected: Event<()>,
    disconnected: Event<()>,
    raw_message_sent: Event<Frame>,
    raw_message_received: Event<Frame>,
    _transport_subscriptions: Mutex<Vec<Subscription>>,
}

/// Stable logical connection over a [`Transport`]. Clones share the same connection.
pub struct PersistentClient<T: Transport = TungsteniteTransport> {
    inner: Arc<ClientInner<T>>,
}

impl<T: Transport> Clone for PersistentClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> PersistentClient<T> {
    pub fn new(args: PersistentClientArgs<T>) -> Result<Self, ConfigError> {
        args.options.validate()?;
        let warn_after = args.options.handler_warning_timeout;
        let transport = FramedTransport::new(args.transport, args.framing, warn_after)?;

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner<T>>| {
            let on_frame = {
                let weak = weak.clone();
                transport.message_received().subscribe(move |frame: Frame| {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_raw_message(frame).await;
                        }
                        Ok(())
                    }
                })
            };
            let on_close = {
                let weak = weak.clone();
                transport
                    .closed_unexpectedly()
                    .subscribe(move |cause: DisconnectCause| {
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_unexpected_disconnect(&cause);
                        }
                        std::future::ready(Ok(()))
                    })
            };

            ClientInner {
                transport,
                options: args.options,
                backoff: args.reconnect,
                hooks: args.hooks,
                login: args.login,
                keepalive: args.keepalive,
                gate: tokio::sync::Mutex::new(()),
                stopping: AtomicBool::new(false),
                established: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                tasks: Mutex::new(Tasks::default()),
                health: Mutex::new(HealthMonitor::new()),
                connected: Event::new("connected", warn_after),
                disconnected: Event::new("disconnected", warn_after),
                raw_message_sent: Event::new("raw_message_sent", warn_after),
                raw_message_received: Event::new("raw_message_received", warn_after),
                _transport_subscriptions: Mutex::new(vec![on_frame, on_close]),
            }
        });

        Ok(Self { inner })
    }

    pub fn endpoint(&self) -> &str {
        self.inner.transport.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.transport.state()
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    /// Failed reconnect attempts in the current disconnect episode.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Cancellation scope of the live connection.
    pub fn scope(&self) -> Option<ConnectionScope> {
        self.inner.transport.scope()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.inner.health.lock().get_stats()
    }

    pub fn connected(&self) -> &Event<()> {
        &self.inner.connected
    }

    pub fn disconnected(&self) -> &Event<()> {
        &self.inner.disconnected
    }

    pub fn raw_message_sent(&self) -> &Event<Frame> {
        &self.inner.raw_message_sent
    }

    /// Raised for every non-empty inbound frame, in wire order.
    pub fn raw_message_received(&self) -> &Event<Frame> {
        &self.inner.raw_message_received
    }

    /// Connect using [`ClientOptions::connect_timeout`].
    pub async fn connect(&self) -> SocketResult<()> {
        self.connect_within(self.inner.options.connect_timeout).await
    }

    /// Open the transport, run the login handshake and hooks, then start keepalive.
    ///
    /// Fails with [`SocketError::AlreadyConnected`] when open. Failures are returned, not
    /// retried. Dropping the future tears down a half-built connection.
    pub async fn connect_within(&self, timeout: Duration) -> SocketResult<()> {
        self.inner.connect_inner(ConnectKind::Initial, timeout).await
    }

    /// Tear down the connection and stop any reconnect loop. No-op when never connected.
    ///
    /// Must not be awaited from a `Disconnected` or frame handler: it waits for both.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.stopping.store(true, Ordering::SeqCst);

        let reconnect = inner.tasks.lock().reconnect.take();
        if let Some(task) = reconnect {
            task.cancel.cancel();
            if let Err(err) = task.handle.await {
                if err.is_panic() {
                    error!(error = %err, "reconnect task panicked");
                }
            }
        }

        let _gate = inner.gate.lock().await;
        inner.stop_keepalive();
        // Whoever clears `established` first reports the disconnect.
        let was_established = inner.established.swap(false, Ordering::SeqCst);
        inner.transport.close().await;
        if was_established {
            info!(connection = %inner.transport.endpoint(), "disconnected");
            inner.disconnected.emit(()).await;
        }
    }

    /// Write one message, then raise `RawMessageSent`.
    pub async fn send_raw(&self, message: impl Into<Bytes>) -> SocketResult<()> {
        self.inner.send_raw(message.into()).await
    }

    /// [`PersistentClient::send_raw`] admitted through `limiter`.
    pub async fn send_limited<L: RateLimiter>(
        &self,
        limiter: &L,
        message: impl Into<Bytes>,
    ) -> SocketResult<()> {
        let message = message.into();
        limiter.perform(|| self.send_raw(message)).await
    }

    /// Send `message` and wait for the first frame matching `predicate`, within
    /// [`ClientOptions::response_timeout`].
    pub async fn request<P>(&self, message: impl Into<Bytes>, predicate: P) -> SocketResult<Frame>
    where
        P: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        let pending = self.inner.raw_message_received.wait_for(predicate);
        self.send_raw(message).await?;
        let Some(mut scope) = self.scope() else {
            return Err(SocketError::NotOpen(self.state()));
        };
        let reply = pending
            .wait_within(self.inner.options.response_timeout, &mut scope)
            .await?;
        Ok(reply)
    }
}

/// Requests a quiet close of a connection whose setup did not finish.
struct TeardownGuard<T: Transport> {
    transport: Option<FramedTransport<T>>,
}

impl<T: Transport> TeardownGuard<T> {
    fn disarm(&mut self) {
        self.transport = None;
    }
}

impl<T: Transport> Drop for TeardownGuard<T> {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.shutdown_nowait();
        }
    }
}

impl<T: Transport> ClientInner<T> {
    fn client(self: &Arc<Self>) -> PersistentClient<T> {
        PersistentClient {
            inner: Arc::clone(self),
        }
    }

    async fn connect_inner(self: &Arc<Self>, kind: ConnectKind, timeout: Duration) -> SocketResult<()> {
        let _gate = self.gate.lock().await;
        if self.transport.state() == ConnectionState::Open {
            return Err(SocketError::AlreadyConnected);
        }
        match kind {
            ConnectKind::Initial => self.stopping.store(false, Ordering::SeqCst),
            ConnectKind::Reconnect if self.stopping.load(Ordering::SeqCst) => {
                return Err(WaitError::Cancelled.into());
            }
            ConnectKind::Reconnect => {}
        }

        self.transport.connect(timeout).await?;
        let mut guard = TeardownGuard {
            transport: Some(self.transport.clone()),
        };
        self.health.lock().on_connected();
        info!(
            connection = %self.transport.endpoint(),
            reconnect = kind == ConnectKind::Reconnect,
            "connected"
        );
        self.connected.emit(()).await;

        if let Err(err) = self.establish(kind).await {
            error!(connection = %self.transport.endpoint(), error = %err, "connection setup failed");
            guard.disarm();
            self.transport.close().await;
            self.disconnected.emit(()).await;
            return Err(err);
        }

        // Same lock as the unexpected-close handler: a close either lands after
        // `established` is set or shows up here as a closed transport.
        let live = {
            let mut tasks = self.tasks.lock();
            if self.transport.is_open() {
                self.established.store(true, Ordering::SeqCst);
                let keepalive = self.spawn_keepalive();
                if let Some(previous) = std::mem::replace(&mut tasks.keepalive, keepalive) {
                    previous.abort();
                }
                true
            } else {
                false
            }
        };
        guard.disarm();
        if !live {
            let state = self.transport.state();
            warn!(connection = %self.transport.endpoint(), "connection lost during setup");
            self.transport.close().await;
            self.disconnected.emit(()).await;
            return Err(SocketError::NotOpen(state));
        }

        self.attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn establish(self: &Arc<Self>, kind: ConnectKind) -> SocketResult<()> {
        let client = self.client();
        if let Some(login) = &self.login {
            login.run(&client, self.options.login_timeout).await?;
        }
        if let Some(hook) = &self.hooks.on_connect {
            hook(client.clone()).await?;
        }
        if kind == ConnectKind::Reconnect {
            if let Some(hook) = &self.hooks.on_reconnect {
                hook(client).await?;
            }
        }
        Ok(())
    }

    async fn send_raw(&self, message: Bytes) -> SocketResult<()> {
        self.transport.send(message.clone()).await?;
        self.health.lock().record_sent();
        self.raw_message_sent.emit(Frame::new(message)).await;
        Ok(())
    }

    async fn handle_raw_message(&self, frame: Frame) {
        self.health.lock().record_received();
        if frame.is_empty() {
            return;
        }
        self.raw_message_received.emit(frame.clone()).await;
        if let Some(hook) = &self.hooks.on_raw_message {
            run_guarded("on_raw_message", hook(frame)).await;
        }
    }

    fn handle_unexpected_disconnect(self: &Arc<Self>, cause: &DisconnectCause) {
        self.health.lock().record_disconnect(cause);
        let mut tasks = self.tasks.lock();
        if let Some(keepalive) = tasks.keepalive.take() {
            keepalive.abort();
        }
        // A connection that never finished setup belongs to its connect call, which reports
        // the failure itself.
        if !self.established.swap(false, Ordering::SeqCst) {
            return;
        }

        let cancel = ScopeHandle::new();
        let scope = cancel.scope();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.disconnected.emit(()).await;
            }
            reconnect_loop(weak, scope).await;
        });

        if let Some(previous) = tasks.reconnect.replace(ReconnectTask { handle, cancel }) {
            previous.cancel.cancel();
        }
    }

    /// Spawn the keepalive loop for the live connection. Does not touch `tasks`.
    fn spawn_keepalive(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.options.keepalive_enabled() {
            return None;
        }
        let keepalive = self.keepalive.clone()?;
        let scope = self.transport.scope()?;
        Some(tokio::spawn(keepalive::run(
            Arc::downgrade(self),
            keepalive,
            scope,
            self.options.ping_interval,
            self.options.pong_timeout,
        )))
    }

    fn stop_keepalive(&self) {
        if let Some(handle) = self.tasks.lock().keepalive.take() {
            handle.abort();
        }
    }
}

impl<T: Transport> Drop for ClientInner<T> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(task) = tasks.reconnect.take() {
            task.cancel.cancel();
        }
        if let Some(handle) = tasks.keepalive.take() {
            handle.abort();
        }
        self.transport.shutdown_nowait();
    }
}

async fn reconnect_loop<T: Transport>(client: Weak<ClientInner<T>>, mut cancel: ConnectionScope) {
    loop {
        let (attempt, delay) = {
            let Some(inner) = client.upgrade() else {
                return;
            };
            if inner.stopping.load(Ordering::SeqCst) {
                return;
            }
            let attempt = inner.attempts.load(Ordering::SeqCst);
            (attempt, inner.backoff.delay(attempt))
        };
        info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = client.upgrade() else {
            return;
        };
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            outcome = inner.connect_inner(ConnectKind::Reconnect, inner.options.connect_timeout) => outcome,
        };
        match outcome {
            Ok(()) => {
                inner.health.lock().increment_reconnect();
                info!(connection = %inner.transport.endpoint(), attempt, "reconnected");
                return;
            }
            Err(SocketError::AlreadyConnected) => return,
            Err(err) => {
                let failed = inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    connection = %inner.transport.endpoint(),
                    attempt = failed,
                    error = %err,
                    "reconnect attempt failed"
                );
            }
        }
    }
}
