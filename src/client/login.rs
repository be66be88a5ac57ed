use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::info;

use super::PersistentClient;
use crate::core::{Frame, SocketError, SocketResult};
use crate::transport::Transport;

/// How the server answered a login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginReply {
    Accepted,
    Rejected(String),
}

type Classifier = Arc<dyn Fn(&Frame) -> Option<LoginReply> + Send + Sync>;

/// Credentials sent right after connecting, and how to recognize the server's verdict.
///
/// The classifier returns `None` for frames unrelated to the login.
#[derive(Clone)]
pub struct LoginHandshake {
    credentials: Vec<Bytes>,
    classify: Classifier,
}

impl LoginHandshake {
    pub fn new<I, M, F>(credentials: I, classify: F) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<Bytes>,
        F: Fn(&Frame) -> Option<LoginReply> + Send + Sync + 'static,
    {
        Self {
            credentials: credentials.into_iter().map(Into::into).collect(),
            classify: Arc::new(classify),
        }
    }

    /// Send the credentials and wait for a verdict.
    ///
    /// Rejection is [`SocketError::AuthenticationFailed`]; silence is a wait timeout.
    pub(super) async fn run<T: Transport>(
        &self,
        client: &PersistentClient<T>,
        timeout: Duration,
    ) -> SocketResult<()> {
        let classify = Arc::clone(&self.classify);
        let pending = client
            .raw_message_received()
            .wait_for(move |frame| classify(frame).is_some());

        for credential in &self.credentials {
            client.send_raw(credential.clone()).await?;
        }

        let Some(mut scope) = client.scope() else {
            return Err(SocketError::NotOpen(client.state()));
        };
        let reply = pending.wait_within(timeout, &mut scope).await?;
        match (self.classify)(&reply) {
            Some(LoginReply::Accepted) => {
                info!(connection = %client.endpoint(), "login accepted");
                Ok(())
            }
            Some(LoginReply::Rejected(message)) => {
                Err(SocketError::AuthenticationFailed { message })
            }
            None => Err(SocketError::AuthenticationFailed {
                message: format!("unrecognized login reply: {}", reply.to_text_lossy()),
            }),
        }
    }
}

impl fmt::Debug for LoginHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginHandshake")
            .field("credentials", &self.credentials.len())
            .finish_non_exhaustive()
    }
}
