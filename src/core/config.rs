use std::time::Duration;

use thiserror::Error;

use super::frame::Delimiter;

/// Raised when a component is constructed with values it cannot honor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be {requirement}")]
    Invalid {
        field: &'static str,
        requirement: &'static str,
    },
}

fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid {
            field,
            requirement: "greater than zero",
        });
    }
    Ok(())
}

/// Timing knobs for [`crate::client::PersistentClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    /// Zero disables keepalive.
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub login_timeout: Duration,
    pub response_timeout: Duration,
    /// Cumulative handler time after which an event dispatch logs a warning.
    pub handler_warning_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            handler_warning_timeout: Duration::from_secs(2),
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("connect_timeout", self.connect_timeout)?;
        positive("pong_timeout", self.pong_timeout)?;
        positive("login_timeout", self.login_timeout)?;
        positive("response_timeout", self.response_timeout)?;
        positive("handler_warning_timeout", self.handler_warning_timeout)
    }

    pub fn keepalive_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}

/// How the byte stream is cut into frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramingConfig {
    pub delimiter: Delimiter,
    /// Size hint for each read from a stream transport.
    pub read_chunk_bytes: usize,
    /// Upper bound on a buffered frame that has not seen its delimiter yet.
    pub max_frame_bytes: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            delimiter: Delimiter::CRLF,
            read_chunk_bytes: 4 * 1024,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl FramingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_chunk_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "read_chunk_bytes",
                requirement: "greater than zero",
            });
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_frame_bytes",
                requirement: "greater than zero",
            });
        }
        Ok(())
    }
}

/// Capacity per window for the fixed and sliding window limiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self { capacity, window }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "capacity",
                requirement: "greater than zero",
            });
        }
        positive("window", self.window)
    }
}
