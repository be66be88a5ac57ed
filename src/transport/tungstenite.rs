//! WebSocket byte stream: each text or binary message is one chunk.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream,
    connect_async_tls_with_config as tungstenite_connect_tls,
    tungstenite::{Message as TungsteniteMessage, Utf8Bytes, protocol::WebSocketConfig},
};
use tracing::trace;

use crate::core::{Delimiter, FramingConfig, SocketError, SocketResult};
use crate::tls::install_rustls_crypto_provider;
use crate::transport::{Transport, TransportConnectFuture};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn map_ws_error(context: &'static str, err: impl ToString) -> SocketError {
    SocketError::transport(context, err)
}

fn message_payload(msg: TungsteniteMessage) -> Option<Bytes> {
    match msg {
        TungsteniteMessage::Text(text) => Some(AsRef::<Bytes>::as_ref(&text).clone()),
        TungsteniteMessage::Binary(bytes) => Some(bytes),
        TungsteniteMessage::Ping(_)
        | TungsteniteMessage::Pong(_)
        | TungsteniteMessage::Frame(_)
        | TungsteniteMessage::Close(_) => None,
    }
}

fn chunk_to_message(bytes: Bytes) -> TungsteniteMessage {
    match std::str::from_utf8(bytes.as_ref()) {
        Ok(_) => {
            // SAFETY: validated as UTF-8 just above.
            let text = unsafe { Utf8Bytes::from_bytes_unchecked(bytes) };
            TungsteniteMessage::Text(text)
        }
        Err(_) => TungsteniteMessage::Binary(bytes),
    }
}

/// WebSocket client transport. Pings are answered by tungstenite; only data messages surface.
///
/// Every inbound data message is terminated with the framing delimiter, so one WebSocket
/// message becomes at least one frame. Outbound messages are sent one per WebSocket message.
#[derive(Clone)]
pub struct TungsteniteTransport {
    url: Arc<str>,
    connector: Option<Connector>,
}

impl TungsteniteTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().into(),
            connector: None,
        }
    }

    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn rustls(self, config: Arc<rustls::ClientConfig>) -> Self {
        self.with_connector(Connector::Rustls(config))
    }
}

pub struct TungsteniteReader {
    inner: futures_util::stream::SplitStream<WsStream>,
    delimiter: Delimiter,
    closed: bool,
}

impl TungsteniteReader {
    fn terminate(&self, payload: Bytes) -> Bytes {
        if payload.ends_with(self.delimiter.as_bytes()) {
            return payload;
        }
        let mut chunk = BytesMut::with_capacity(payload.len() + self.delimiter.len());
        chunk.extend_from_slice(&payload);
        chunk.extend_from_slice(self.delimiter.as_bytes());
        chunk.freeze()
    }
}

impl Stream for TungsteniteReader {
    type Item = SocketResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(TungsteniteMessage::Close(frame)))) => {
                    trace!(frame = ?frame, "websocket close frame received");
                    self.closed = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Ok(msg))) => {
                    if let Some(payload) = message_payload(msg) {
                        return Poll::Ready(Some(Ok(self.terminate(payload))));
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Some(Err(map_ws_error("websocket_read", err))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

pub struct TungsteniteWriter {
    inner: futures_util::stream::SplitSink<WsStream, TungsteniteMessage>,
}

impl Sink<Bytes> for TungsteniteWriter {
    type Error = SocketError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_ready(cx)
            .map_err(|e| map_ws_error("websocket_write", e))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(chunk_to_message(item))
            .map_err(|e| map_ws_error("websocket_write", e))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| map_ws_error("websocket_write", e))
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(|e| map_ws_error("websocket_write", e))
    }
}

impl Transport for TungsteniteTransport {
    type Reader = TungsteniteReader;
    type Writer = TungsteniteWriter;

    fn endpoint(&self) -> &str {
        &self.url
    }

    fn connect(&self, framing: &FramingConfig) -> TransportConnectFuture<Self::Reader, Self::Writer> {
        let url = self.url.to_string();
        let connector = self.connector.clone();
        let max_message = framing.max_frame_bytes;
        let delimiter = framing.delimiter.clone();
        Box::pin(async move {
            install_rustls_crypto_provider();

            let mut config = WebSocketConfig::default();
            config.max_message_size = Some(max_message);
            config.max_frame_size = Some(max_message);

            let (stream, _) = tungstenite_connect_tls(url, Some(config), false, connector)
                .await
                .map_err(|e| SocketError::ConnectionFailed(e.to_string()))?;

            let (write, read) = stream.split();
            Ok((
                TungsteniteReader {
                    inner: read,
                    delimiter,
                    closed: false,
                },
                TungsteniteWriter { inner: write },
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_chunks_go_out_as_text() {
        let msg = chunk_to_message(Bytes::from_static(b"PING :server"));
        assert!(matches!(msg, TungsteniteMessage::Text(ref t) if t.as_str() == "PING :server"));

        let msg = chunk_to_message(Bytes::from_static(&[0xff, 0xfe]));
        assert!(matches!(msg, TungsteniteMessage::Binary(_)));
    }

    #[test]
    fn control_messages_are_skipped() {
        assert_eq!(message_payload(TungsteniteMessage::Ping(Bytes::new())), None);
        assert_eq!(message_payload(TungsteniteMessage::Pong(Bytes::new())), None);
        assert_eq!(
            message_payload(TungsteniteMessage::Binary(Bytes::from_static(b"abc"))),
            Some(Bytes::from_static(b"abc"))
        );
    }

    #[test]
    fn endpoint_is_the_url() {
        let transport = TungsteniteTransport::new("wss://stream.example.com/ws");
        assert_eq!(transport.endpoint(), "wss://stream.example.com/ws");
    }
}
