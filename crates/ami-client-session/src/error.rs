//! Session error types.

use std::time::Duration;

use ami_client_core::{OptionError, TransportError};
use thiserror::Error;

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors surfaced to callers of the session API.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No live connection; call `connect` first.
    #[error("Not connected: call connect() before sending actions")]
    NotConnected,

    /// No response arrived in time. The session itself is unaffected.
    #[error("Timeout waiting for response to action {action_id} after {}ms", after.as_millis())]
    Timeout { action_id: String, after: Duration },

    /// The connection dropped while the request was outstanding.
    #[error("Client disconnected before action {action_id} was answered")]
    Disconnected { action_id: String },

    /// A newer request registered the same correlation id.
    #[error("Action id {action_id} was reused by a newer request")]
    DuplicateActionId { action_id: String },

    /// Transport failure during connect or write.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Rejected option access.
    #[error(transparent)]
    Option(#[from] OptionError),
}

impl SessionError {
    /// Returns true if this is a response timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the request was abandoned because of a disconnect.
    #[must_use]
    pub const fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected { .. })
    }

    /// Correlation id of the failed request, if the error concerns one.
    #[must_use]
    pub fn action_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { action_id, .. }
            | Self::Disconnected { action_id }
            | Self::DuplicateActionId { action_id } => Some(action_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = SessionError::Timeout {
            action_id: "42".into(),
            after: Duration::from_millis(250),
        };
        assert!(err.is_timeout());
        assert!(!err.is_disconnected());
        assert_eq!(err.action_id(), Some("42"));
        assert_eq!(
            err.to_string(),
            "Timeout waiting for response to action 42 after 250ms"
        );
    }

    #[test]
    fn test_transport_errors_convert() {
        let err: SessionError = TransportError::Closed.into();
        assert!(matches!(err, SessionError::Transport(TransportError::Closed)));
        assert_eq!(err.action_id(), None);
    }
}
