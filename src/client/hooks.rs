use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use super::PersistentClient;
use crate::core::{Frame, HandlerResult, SocketResult};
use crate::transport::Transport;

pub type ConnectHook<T> =
    Arc<dyn Fn(PersistentClient<T>) -> BoxFuture<'static, SocketResult<()>> + Send + Sync>;

pub type RawMessageHook = Arc<dyn Fn(Frame) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Extension points for the protocol client that owns a [`PersistentClient`].
///
/// `on_connect` runs after every successful connect (and login), `on_reconnect` additionally
/// after automatic reconnects. An error from either aborts that connect attempt.
/// `on_raw_message` sees every non-empty inbound frame after `RawMessageReceived` fired; its
/// errors are logged.
pub struct ClientHooks<T: Transport> {
    pub on_connect: Option<ConnectHook<T>>,
    pub on_reconnect: Option<ConnectHook<T>>,
    pub on_raw_message: Option<RawMessageHook>,
}

impl<T: Transport> ClientHooks<T> {
    pub fn on_connect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PersistentClient<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SocketResult<()>> + Send + 'static,
    {
        self.on_connect = Some(Arc::new(move |client| hook(client).boxed()));
        self
    }

    pub fn on_reconnect<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PersistentClient<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SocketResult<()>> + Send + 'static,
    {
        self.on_reconnect = Some(Arc::new(move |client| hook(client).boxed()));
        self
    }

    pub fn on_raw_message<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.on_raw_message = Some(Arc::new(move |frame| hook(frame).boxed()));
        self
    }
}

impl<T: Transport> Default for ClientHooks<T> {
    fn default() -> Self {
        Self {
            on_connect: None,
            on_reconnect: None,
            on_raw_message: None,
        }
    }
}

impl<T: Transport> Clone for ClientHooks<T> {
    fn clone(&self) -> Self {
        Self {
            on_connect: self.on_connect.clone(),
            on_reconnect: self.on_reconnect.clone(),
            on_raw_message: self.on_raw_message.clone(),
        }
    }
}
