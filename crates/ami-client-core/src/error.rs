//! Error types shared by the transport and the session layer.

use thiserror::Error;

/// Errors raised by a [`Transport`](crate::Transport) or one of its connections.
///
/// Cloneable so it can be delivered through the notification channel as an
/// `internalError`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The manager rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote endpoint could not be reached.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Every allowed connect attempt failed.
    #[error("Reconnection error after max count attempts ({attempts})")]
    MaxAttemptsExceeded { attempts: u32 },

    /// The connection is already closed.
    #[error("Connection closed")]
    Closed,

    /// Socket level failure.
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether another connect attempt may succeed.
    ///
    /// Authentication failures and an exhausted attempt budget are terminal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionRefused(_) | Self::Closed | Self::Io(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors raised when reading or writing session options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("Unknown option: {0}")]
    Unknown(String),
    #[error("Invalid value for option '{name}': {reason}")]
    InvalidValue { name: String, reason: String },
}
