//! Persistent framed socket client.
//!
//! A [`FramedTransport`] cuts a duplex byte stream into delimited frames and tracks the
//! connection state. [`PersistentClient`] keeps one logical connection alive across transient
//! disconnects with exponential backoff, an optional login handshake and keepalive, and raises
//! events for everything it sends and receives. The [`rate_limit`] module throttles outbound
//! operations.

pub mod client;
pub mod core;
pub mod rate_limit;
pub mod testing;
pub mod tls;
pub mod transport;

pub use client::{
    ClientHooks, Keepalive, LoginHandshake, LoginReply, PersistentClient, PersistentClientArgs,
};
pub use core::{
    ClientOptions, ConfigError, ConnectionState, ConnectionStats, Delimiter, DisconnectCause,
    Event, ExponentialBackoff, Frame, FramingConfig, RateLimitConfig, ReconnectStrategy,
    SocketError, SocketResult, WaitError,
};
pub use rate_limit::{
    FixedWindowLimiter, QuotaBucket, QuotaBucketConfig, QuotaBuckets, RateLimiter,
    SlidingWindowLimiter,
};
pub use transport::{FramedTransport, TcpTransport, Transport, TungsteniteTransport};
