use std::fmt;
use std::time::Duration;

use thiserror::Error;

use super::config::ConfigError;
use super::wait::WaitError;

/// Result alias used across the crate.
pub type SocketResult<T> = Result<T, SocketError>;

/// Canonical error type for transports and persistent clients.
#[derive(Debug, Clone, Error)]
pub enum SocketError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect to {endpoint} did not complete within {timeout:?}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Connection is not open (state: {0})")]
    NotOpen(ConnectionState),

    #[error("Transport error ({context}): {error}")]
    Transport {
        context: &'static str,
        error: String,
    },

    #[error("Frame exceeds {limit} bytes without a delimiter")]
    FrameTooLong { limit: usize },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SocketError {
    pub(crate) fn transport(context: &'static str, error: impl ToString) -> Self {
        Self::Transport {
            context,
            error: error.to_string(),
        }
    }

    /// True when the error means "no reply arrived in time" rather than a negative reply.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::Wait(WaitError::Timeout(_))
        )
    }
}

impl From<std::io::Error> for SocketError {
    fn from(err: std::io::Error) -> Self {
        Self::transport("io", err)
    }
}

/// Lifecycle of a single logical connection.
///
/// Legal order is `None -> Open -> CloseRequested -> Closed`, and `Closed -> Open` again on
/// reconnect. An unexpected close goes straight from `Open` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    None,
    Open,
    CloseRequested,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Open => "open",
            Self::CloseRequested => "close-requested",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Why a connection ended without the owner asking for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The remote side ended the stream (EOF or close frame).
    RemoteClosed,
    /// Reading from the stream failed.
    ReadFailure { error: String },
    /// Writing to the stream failed.
    WriteFailure { error: String },
    /// A buffered frame grew past the configured maximum.
    FrameTooLong { limit: usize },
    /// The keepalive ping was not echoed in time.
    PongTimeout,
}

impl fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoteClosed => f.write_str("remote closed the stream"),
            Self::ReadFailure { error } => write!(f, "read failure: {error}"),
            Self::WriteFailure { error } => write!(f, "write failure: {error}"),
            Self::FrameTooLong { limit } => write!(f, "frame exceeded {limit} bytes"),
            Self::PongTimeout => f.write_str("keepalive echo not received"),
        }
    }
}

/// Snapshot returned by [`crate::client::PersistentClient::stats`].
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub uptime: Duration,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub reconnects: u64,
    pub unexpected_disconnects: u64,
    pub last_message_age: Duration,
    pub recent_disconnects: Vec<String>,
    pub p50_rtt_us: u64,
    pub p99_rtt_us: u64,
    pub rtt_samples: u64,
}
