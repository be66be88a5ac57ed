//! Reusable test utilities for exercising clients without a real socket.
//!
//! [`MockTransport::channel_pair`] returns the transport plus a [`MockServer`] that accepts
//! each connection attempt as a [`MockConnection`]. Tests push raw inbound chunks (so frames
//! can be split anywhere), read what the client wrote, refuse connections, or drop the socket.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, Stream};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::{FramingConfig, SocketError, SocketResult};
use crate::transport::{Transport, TransportConnectFuture};

struct MockShared {
    accept_tx: mpsc::UnboundedSender<MockConnection>,
    refusing: AtomicBool,
    attempts: AtomicUsize,
}

/// Transport backed by in-memory channels. Every connect attempt is counted.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    pub fn channel_pair() -> (Self, MockServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(MockShared {
            accept_tx,
            refusing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            MockServer { accept_rx, shared },
        )
    }
}

impl Transport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn endpoint(&self) -> &str {
        "mock://server"
    }

    fn connect(&self, _framing: &FramingConfig) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.attempts.fetch_add(1, Ordering::SeqCst);
            if shared.refusing.load(Ordering::SeqCst) {
                return Err(SocketError::ConnectionFailed(
                    "mock server refused the connection".to_string(),
                ));
            }

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            shared
                .accept_tx
                .send(MockConnection {
                    outbound_rx,
                    inbound_tx: Some(inbound_tx),
                })
                .map_err(|_| SocketError::ConnectionFailed("mock server is gone".to_string()))?;

            Ok((
                MockReader { rx: inbound_rx },
                MockWriter {
                    tx: Some(outbound_tx),
                },
            ))
        })
    }
}

/// Error surface for operations on [`MockConnection`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
pub enum MockServerError {
    #[error("mock socket already dropped")]
    SocketDropped,
    #[error("client side is no longer reading")]
    ChannelClosed,
}

/// Server-side handle paired with [`MockTransport`].
pub struct MockServer {
    accept_rx: mpsc::UnboundedReceiver<MockConnection>,
    shared: Arc<MockShared>,
}

impl MockServer {
    /// Next successful connection made by the client.
    pub async fn accept(&mut self) -> Option<MockConnection> {
        self.accept_rx.recv().await
    }

    pub async fn accept_timeout(&mut self, timeout: Duration) -> Option<MockConnection> {
        tokio::time::timeout(timeout, self.accept_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// While set, connect attempts fail with [`SocketError::ConnectionFailed`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Connect attempts seen so far, including refused ones.
    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// One accepted connection.
pub struct MockConnection {
    outbound_rx: mpsc::UnboundedReceiver<Bytes>,
    inbound_tx: Option<mpsc::UnboundedSender<SocketResult<Bytes>>>,
}

impl MockConnection {
    /// Next message the client wrote; `None` once the client released its writer.
    pub async fn recv_outbound(&mut self) -> Option<Bytes> {
        self.outbound_rx.recv().await
    }

    pub async fn recv_outbound_timeout(&mut self, timeout: Duration) -> Option<Bytes> {
        tokio::time::timeout(timeout, self.outbound_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Push raw bytes exactly as given; no delimiter is added.
    pub fn send_chunk(&self, chunk: impl Into<Bytes>) -> Result<(), MockServerError> {
        self.push(Ok(chunk.into()))
    }

    /// Push `line` followed by CRLF.
    pub fn send_line(&self, line: &str) -> Result<(), MockServerError> {
        self.send_chunk(format!("{line}\r\n"))
    }

    /// Make the client's next read fail.
    pub fn fail(&self, error: &str) -> Result<(), MockServerError> {
        self.push(Err(SocketError::Transport {
            context: "mock_transport_read",
            error: error.to_string(),
        }))
    }

    /// Simulate the server closing the socket. Already queued chunks are still delivered.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }

    fn push(&self, item: SocketResult<Bytes>) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(item).map_err(|_| MockServerError::ChannelClosed)
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<SocketResult<Bytes>>,
}

impl Stream for MockReader {
    type Item = SocketResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Sink<Bytes> for MockWriter {
    type Error = SocketError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let closed = || SocketError::Transport {
            context: "mock_transport_write",
            error: "mock outbound channel closed".to_string(),
        };
        let tx = self.tx.as_ref().ok_or_else(closed)?;
        tx.send(item).map_err(|_| closed())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Closing the sink ends the server's outbound stream.
        self.tx = None;
        Poll::Ready(Ok(()))
    }
}
