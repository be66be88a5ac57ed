//! Plain TCP and TLS-over-TCP byte streams.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::FramedWrite;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::core::{DelimiterCodec, FramingConfig, SocketError, SocketResult};
use crate::tls::webpki_client_config;
use crate::transport::{Transport, TransportConnectFuture};

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<S> AsyncStream for S where S: AsyncRead + AsyncWrite + Send + Unpin {}

type BoxedIo = Box<dyn AsyncStream>;

/// Connects to `host:port`, optionally wrapping the socket in TLS.
///
/// The writer appends the configured delimiter to every message.
#[derive(Clone)]
pub struct TcpTransport {
    host: Arc<str>,
    port: u16,
    endpoint: Arc<str>,
    tls: Option<TlsConnector>,
}

impl TcpTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host: String = host.into();
        let endpoint = format!("tcp://{host}:{port}");
        Self {
            host: host.into(),
            port,
            endpoint: endpoint.into(),
            tls: None,
        }
    }

    /// TLS with the bundled webpki trust roots.
    pub fn secure(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port).with_tls_config(webpki_client_config())
    }

    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.endpoint = format!("tls://{}:{}", self.host, self.port).into();
        self.tls = Some(TlsConnector::from(config));
        self
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    async fn open(&self) -> SocketResult<BoxedIo> {
        let stream = TcpStream::connect((&*self.host, self.port))
            .await
            .map_err(|err| SocketError::ConnectionFailed(format!("{}: {err}", self.endpoint)))?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(connection = %self.endpoint, error = %err, "set_nodelay failed");
        }

        let Some(connector) = self.tls.as_ref() else {
            return Ok(Box::new(stream));
        };
        let domain = ServerName::try_from(self.host.to_string()).map_err(|_| {
            SocketError::ConnectionFailed(format!("invalid TLS server name: {}", self.host))
        })?;
        let tls = connector
            .connect(domain, stream)
            .await
            .map_err(|err| SocketError::ConnectionFailed(format!("TLS handshake failed: {err}")))?;
        Ok(Box::new(tls))
    }
}

impl Transport for TcpTransport {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn connect(&self, framing: &FramingConfig) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let transport = self.clone();
        let chunk = framing.read_chunk_bytes;
        let codec = DelimiterCodec::new(framing.delimiter.clone(), framing.max_frame_bytes);
        Box::pin(async move {
            let io = transport.open().await?;
            let (read_half, write_half) = tokio::io::split(io);
            Ok((
                TcpReader {
                    inner: ReaderStream::with_capacity(read_half, chunk),
                },
                TcpWriter {
                    inner: FramedWrite::new(write_half, codec),
                },
            ))
        })
    }
}

/// Raw chunks as read from the socket.
pub struct TcpReader {
    inner: ReaderStream<ReadHalf<BoxedIo>>,
}

impl Stream for TcpReader {
    type Item = SocketResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner)
            .poll_next(cx)
            .map(|item| item.map(|chunk| chunk.map_err(|err: io::Error| err.into())))
    }
}

/// Delimited writes; each item is followed by the delimiter on the wire.
pub struct TcpWriter {
    inner: FramedWrite<WriteHalf<BoxedIo>, DelimiterCodec>,
}

impl Sink<Bytes> for TcpWriter {
    type Error = SocketError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner).start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx)
    }
}
