use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Sink, Stream};

use crate::core::{FramingConfig, SocketError, SocketResult};

pub mod framed;
pub mod tcp;
pub mod tungstenite;
mod writer;

pub use framed::FramedTransport;
pub use tcp::TcpTransport;
pub use tungstenite::TungsteniteTransport;

pub type TransportConnectFuture<R, W> = Pin<Box<dyn Future<Output = SocketResult<(R, W)>> + Send>>;

/// Connection factory for a duplex byte stream.
///
/// The reader yields raw chunks exactly as they arrive; [`FramedTransport`] owns framing. The
/// writer takes one application message per item: transports with native message boundaries
/// send one frame per item, stream transports append the delimiter themselves.
pub trait Transport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = SocketResult<Bytes>> + Send + Unpin + 'static;
    type Writer: Sink<Bytes, Error = SocketError> + Send + Unpin + 'static;

    /// Human-readable endpoint used in logs and errors.
    fn endpoint(&self) -> &str;

    fn connect(&self, framing: &FramingConfig) -> TransportConnectFuture<Self::Reader, Self::Writer>;
}
