//! Transport seam consumed by the session layer.
//!
//! A transport owns the physical connection, framing and login handshake.
//! The session only sees parsed messages and lifecycle signals.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{Action, ConnectOptions, Credentials, InboundMessage, TransportError};

/// Signal emitted by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A parsed inbound message.
    Message(InboundMessage),
    /// A non-fatal error on the connection.
    Error(TransportError),
    /// The connection is gone. No further signals follow.
    Close,
}

/// Write side of a live connection.
pub trait ConnectionHandle: Send + Sync {
    /// Queue an action on the wire.
    ///
    /// # Errors
    /// Returns error if the connection can no longer accept writes.
    fn write(&self, action: &Action) -> Result<(), TransportError>;

    /// Request closure. Idempotent.
    fn close(&self);

    /// Whether the connection is still open.
    fn is_connected(&self) -> bool;
}

impl std::fmt::Debug for dyn ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// A freshly established connection: its handle and its signal stream.
///
/// Dropping `events` detaches every listener of the connection.
pub struct ConnectionParts {
    /// Shared write handle.
    pub handle: Arc<dyn ConnectionHandle>,
    /// Inbound signals, ending after [`ConnectionEvent::Close`].
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl std::fmt::Debug for ConnectionParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParts")
            .field("connected", &self.handle.is_connected())
            .finish_non_exhaustive()
    }
}

/// Trait for connection factories.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open and authenticate a connection.
    ///
    /// # Errors
    /// Returns [`TransportError::AuthenticationFailed`] when the login is
    /// rejected, or a network kind error when the endpoint is unreachable.
    async fn connect(
        &self,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<ConnectionParts, TransportError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn connect(
        &self,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<ConnectionParts, TransportError> {
        (**self).connect(credentials, options).await
    }
}
