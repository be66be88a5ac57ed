use bytes::Bytes;
use futures_util::{Sink, SinkExt};
use kameo::error::ActorStopReason;
use kameo::prelude::{Actor, ActorRef, Context, Message as KameoMessage, WeakActorRef};
use tracing::debug;

use crate::core::{ConnectionScope, ConnectionState, SocketError, SocketResult};

/// Per-connection actor that owns the transport sink.
///
/// The mailbox is the write queue: messages reach the wire in the order they were asked for.
pub struct WriterActor<W>
where
    W: Sink<Bytes, Error = SocketError> + Send + Unpin + 'static,
{
    writer: W,
    scope: ConnectionScope,
}

impl<W> WriterActor<W>
where
    W: Sink<Bytes, Error = SocketError> + Send + Unpin + 'static,
{
    pub fn new(writer: W, scope: ConnectionScope) -> Self {
        Self { writer, scope }
    }
}

impl<W> Actor for WriterActor<W>
where
    W: Sink<Bytes, Error = SocketError> + Send + Unpin + 'static,
{
    type Args = Self;
    type Error = SocketError;

    async fn on_start(args: Self::Args, _ctx: ActorRef<Self>) -> Result<Self, Self::Error> {
        Ok(args)
    }

    async fn on_stop(
        &mut self,
        _ctx: WeakActorRef<Self>,
        _reason: ActorStopReason,
    ) -> SocketResult<()> {
        if let Err(err) = self.writer.close().await {
            debug!(target: "socket-writer", error = %err, "closing sink failed");
        }
        Ok(())
    }
}

pub struct WriteMessage {
    pub message: Bytes,
}

impl<W> KameoMessage<WriteMessage> for WriterActor<W>
where
    W: Sink<Bytes, Error = SocketError> + Send + Unpin + 'static,
{
    type Reply = SocketResult<()>;

    async fn handle(
        &mut self,
        msg: WriteMessage,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        if self.scope.is_cancelled() {
            return Err(SocketError::NotOpen(ConnectionState::Closed));
        }
        debug!(target: "socket-writer", bytes = msg.message.len(), "writing message to wire");
        self.writer.send(msg.message).await
    }
}
