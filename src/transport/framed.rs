//! Connection state machine and the per-connection read loop.
//!
//! The read loop lives in its own task and is the only consumer of the transport reader.
//! Writes go through a per-connection [`WriterActor`]. `connect` and `close` are serialized by
//! an async gate; the state itself sits behind a short synchronous lock so the read loop can
//! classify its own exit without taking the gate.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use kameo::error::SendError;
use kameo::prelude::{Actor, ActorRef};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;
use tracing::{debug, error, info, warn};

use super::Transport;
use super::writer::{WriteMessage, WriterActor};
use crate::core::{
    ConfigError, ConnectionScope, ConnectionState, DelimiterCodec, DisconnectCause, Event, Frame,
    FramingConfig, ScopeHandle, SocketError, SocketResult,
};

#[derive(Debug, Clone)]
enum ReadControl {
    Run,
    Close,
    Abort(DisconnectCause),
}

enum ReadExit {
    Requested,
    Failed(DisconnectCause),
}

/// Handles the read loop and senders need while a connection is live.
struct Link<T: Transport> {
    writer: ActorRef<WriterActor<T::Writer>>,
    control: watch::Sender<ReadControl>,
    scope: ConnectionScope,
}

/// Resources only `connect`/`close` touch, under the gate.
struct LiveConnection<T: Transport> {
    reader_task: JoinHandle<()>,
    writer: ActorRef<WriterActor<T::Writer>>,
}

impl<T: Transport> LiveConnection<T> {
    /// Wait for the read loop, then for the writer to shut down.
    ///
    /// The writer is stopped by whoever took the connection's [`Link`]: `close` passes it in,
    /// otherwise the read loop stopped it in `finish`. A read loop that panicked never got
    /// there, so its link is picked up here.
    async fn release(self, inner: &FramedInner<T>, link: Option<Link<T>>) {
        if let Err(err) = self.reader_task.await {
            if err.is_panic() {
                error!(error = %err, "read loop panicked");
            }
        }
        let orphaned = match link {
            Some(link) => Some(link),
            None => inner.link.lock().take(),
        };
        if let Some(link) = orphaned {
            stop_writer(&link.writer).await;
        }
        self.writer.wait_for_shutdown().await;
    }
}

/// Ask the writer to drain and stop. Each writer is stopped at most once.
async fn stop_writer<W>(writer: &ActorRef<WriterActor<W>>)
where
    W: futures_util::Sink<Bytes, Error = SocketError> + Send + Unpin + 'static,
{
    // kameo cannot report a stop signal sent to a closed mailbox as an error.
    if writer.is_alive() {
        let _ = writer.stop_gracefully().await;
    }
}

struct FramedInner<T: Transport> {
    transport: T,
    framing: FramingConfig,
    state: Mutex<ConnectionState>,
    gate: tokio::sync::Mutex<Option<LiveConnection<T>>>,
    link: Mutex<Option<Link<T>>>,
    message_received: Event<Frame>,
    closed_unexpectedly: Event<DisconnectCause>,
}

/// A transport connection that yields delimited frames.
///
/// Clones share the same connection.
pub struct FramedTransport<T: Transport> {
    inner: Arc<FramedInner<T>>,
}

impl<T: Transport> Clone for FramedTransport<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> FramedTransport<T> {
    /// `handler_warning` is the slow-dispatch threshold for both events.
    pub fn new(
        transport: T,
        framing: FramingConfig,
        handler_warning: Duration,
    ) -> Result<Self, ConfigError> {
        framing.validate()?;
        Ok(Self {
            inner: Arc::new(FramedInner {
                transport,
                framing,
                state: Mutex::new(ConnectionState::None),
                gate: tokio::sync::Mutex::new(None),
                link: Mutex::new(None),
                message_received: Event::new("message_received", handler_warning),
                closed_unexpectedly: Event::new("closed_unexpectedly", handler_warning),
            }),
        })
    }

    pub fn endpoint(&self) -> &str {
        self.inner.transport.endpoint()
    }

    /// Current state; only meaningful for diagnostics outside the gate.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// True while the connection is open and its read loop has not exited.
    pub fn is_open(&self) -> bool {
        let scope_live = self
            .inner
            .link
            .lock()
            .as_ref()
            .is_some_and(|link| !link.scope.is_cancelled());
        scope_live && self.state() == ConnectionState::Open
    }

    /// Raised once per frame, in arrival order, from the read loop task.
    ///
    /// Handlers must not await [`FramedTransport::close`]: close waits for the read loop,
    /// which is busy running the handler.
    pub fn message_received(&self) -> &Event<Frame> {
        &self.inner.message_received
    }

    /// Raised at most once per connection when the stream ends without a close request.
    pub fn closed_unexpectedly(&self) -> &Event<DisconnectCause> {
        &self.inner.closed_unexpectedly
    }

    /// Cancellation scope of the live connection, if any.
    pub fn scope(&self) -> Option<ConnectionScope> {
        self.inner.link.lock().as_ref().map(|link| link.scope.clone())
    }

    pub async fn connect(&self, timeout: Duration) -> SocketResult<()> {
        let mut gate = self.inner.gate.lock().await;
        if self.state() == ConnectionState::Open {
            return Err(SocketError::AlreadyConnected);
        }
        if let Some(stale) = gate.take() {
            stale.release(&self.inner, None).await;
        }

        let endpoint = self.endpoint();
        let (reader, writer) = tokio::time::timeout(
            timeout,
            self.inner.transport.connect(&self.inner.framing),
        )
        .await
        .map_err(|_| SocketError::ConnectTimeout {
            endpoint: endpoint.to_string(),
            timeout,
        })??;

        let scope_handle = ScopeHandle::new();
        let scope = scope_handle.scope();
        let writer = WriterActor::spawn(WriterActor::new(writer, scope.clone()));
        let (control, control_rx) = watch::channel(ReadControl::Run);

        *self.inner.link.lock() = Some(Link {
            writer: writer.clone(),
            control,
            scope,
        });
        *self.inner.state.lock() = ConnectionState::Open;

        let reader_task = tokio::spawn(read_loop(
            Arc::clone(&self.inner),
            reader,
            control_rx,
            scope_handle,
        ));
        *gate = Some(LiveConnection {
            reader_task,
            writer,
        });

        info!(connection = %endpoint, "transport connected");
        Ok(())
    }

    /// Write one message. Fails with [`SocketError::NotOpen`] unless the state is `Open`.
    pub async fn send(&self, message: Bytes) -> SocketResult<()> {
        let writer = self
            .inner
            .link
            .lock()
            .as_ref()
            .map(|link| link.writer.clone());
        let Some(writer) = writer else {
            return Err(SocketError::NotOpen(self.state()));
        };

        match writer.ask(WriteMessage { message }).await {
            Ok(()) => Ok(()),
            Err(SendError::HandlerError(SocketError::NotOpen(_))) => {
                Err(SocketError::NotOpen(self.state()))
            }
            Err(SendError::HandlerError(err)) => {
                self.abort(DisconnectCause::WriteFailure {
                    error: err.to_string(),
                });
                Err(err)
            }
            Err(_) => Err(SocketError::NotOpen(self.state())),
        }
    }

    /// Stop the read loop, wait for it, then release the stream. No-op when not open.
    pub async fn close(&self) {
        let mut gate = self.inner.gate.lock().await;
        let requested = {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::CloseRequested;
                true
            } else {
                false
            }
        };

        let link = self.inner.link.lock().take();
        if let Some(link) = link.as_ref() {
            link.control.send_replace(ReadControl::Close);
        }
        match gate.take() {
            Some(connection) => connection.release(&self.inner, link).await,
            None => {
                if let Some(link) = link {
                    stop_writer(&link.writer).await;
                }
            }
        }

        if requested {
            *self.inner.state.lock() = ConnectionState::Closed;
            info!(connection = %self.endpoint(), "transport closed");
        } else if self.state() == ConnectionState::CloseRequested {
            *self.inner.state.lock() = ConnectionState::Closed;
        }
    }

    /// Force the live connection down the unexpected-close path with `cause`.
    pub fn abort(&self, cause: DisconnectCause) {
        if let Some(link) = self.inner.link.lock().as_ref() {
            link.control.send_replace(ReadControl::Abort(cause));
        }
    }

    /// Request a close without waiting for the read loop; it finishes the transition itself.
    pub(crate) fn shutdown_nowait(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ConnectionState::Open {
                *state = ConnectionState::CloseRequested;
            }
        }
        if let Some(link) = self.inner.link.lock().as_ref() {
            link.control.send_replace(ReadControl::Close);
        }
    }
}

async fn read_loop<T: Transport>(
    inner: Arc<FramedInner<T>>,
    mut reader: T::Reader,
    mut control: watch::Receiver<ReadControl>,
    scope: ScopeHandle,
) {
    let mut codec = DelimiterCodec::new(
        inner.framing.delimiter.clone(),
        inner.framing.max_frame_bytes,
    );
    let mut buffer = BytesMut::with_capacity(inner.framing.read_chunk_bytes);

    let exit = loop {
        let step = tokio::select! {
            biased;
            changed = control.changed() => match changed {
                Ok(()) => {
                    let signal = control.borrow_and_update().clone();
                    match signal {
                        ReadControl::Run => None,
                        ReadControl::Close => Some(ReadExit::Requested),
                        ReadControl::Abort(cause) => Some(ReadExit::Failed(cause)),
                    }
                }
                Err(_) => Some(ReadExit::Requested),
            },
            chunk = reader.next() => inner.ingest(chunk, &mut codec, &mut buffer).await,
        };
        if let Some(exit) = step {
            break exit;
        }
    };

    scope.cancel();
    inner.finish(exit).await;
}

impl<T: Transport> FramedInner<T> {
    async fn ingest(
        &self,
        chunk: Option<SocketResult<Bytes>>,
        codec: &mut DelimiterCodec,
        buffer: &mut BytesMut,
    ) -> Option<ReadExit> {
        let bytes = match chunk {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                return Some(ReadExit::Failed(DisconnectCause::ReadFailure {
                    error: err.to_string(),
                }));
            }
            None => return Some(ReadExit::Failed(DisconnectCause::RemoteClosed)),
        };
        if bytes.is_empty() {
            return None;
        }

        buffer.extend_from_slice(&bytes);
        loop {
            match codec.decode(buffer) {
                Ok(Some(frame)) => self.message_received.emit(Frame::new(frame)).await,
                Ok(None) => return None,
                Err(SocketError::FrameTooLong { limit }) => {
                    return Some(ReadExit::Failed(DisconnectCause::FrameTooLong { limit }));
                }
                Err(err) => {
                    return Some(ReadExit::Failed(DisconnectCause::ReadFailure {
                        error: err.to_string(),
                    }));
                }
            }
        }
    }

    async fn finish(&self, exit: ReadExit) {
        let unexpected = {
            let mut state = self.state.lock();
            match (&exit, *state) {
                (ReadExit::Failed(_), ConnectionState::Open) => {
                    *state = ConnectionState::Closed;
                    true
                }
                (_, ConnectionState::CloseRequested) => {
                    *state = ConnectionState::Closed;
                    false
                }
                _ => false,
            }
        };

        let link = self.link.lock().take();
        if let Some(link) = link {
            stop_writer(&link.writer).await;
        }

        match exit {
            ReadExit::Failed(cause) if unexpected => {
                warn!(
                    connection = %self.transport.endpoint(),
                    cause = %cause,
                    "connection closed unexpectedly"
                );
                self.closed_unexpectedly.emit(cause).await;
            }
            ReadExit::Failed(cause) => {
                debug!(cause = %cause, "read loop ended after close was requested");
            }
            ReadExit::Requested => {}
        }
    }
}
