//! Session orchestration for the AMI client.
//!
//! This crate provides:
//! - `AmiClient` - the public session API
//! - `Correlator` - promise-style requests matched to their responses
//! - `Dispatcher` - filtering and republication of inbound messages
//! - `ConnectionManager` - connect, close handling, reconnection and keep-alive

pub mod client;
pub mod correlator;
pub mod dispatcher;
pub mod error;
pub mod keepalive;
pub mod manager;
pub mod options;

pub use client::{AmiClient, Sent};
pub use correlator::{Correlator, PendingResponse};
pub use error::{Result, SessionError};
pub use manager::{ConnectionManager, ConnectionState, DisconnectReason};
pub use options::OptionStore;

pub use ami_client_core::{
    Action, ConnectOptions, ConnectionHandle, Credentials, Event, INTERNAL_ID_PREFIX,
    InboundMessage, Notification, NotificationHub, OptionError, Response, SessionOptions,
    Transport, TransportError, generate_internal_id, is_internal_id,
};
pub use ami_client_transport::{RetryPolicy, RetryingTransport};

#[cfg(feature = "memory")]
pub use ami_client_transport::{MemoryServer, MemoryTransport};

#[cfg(all(test, feature = "memory"))]
mod tests {
    use super::*;

    #[test]
    fn test_memory_feature_reexports_server() {
        let server = MemoryServer::new(Credentials::new("test", "test"));
        let _transport: MemoryTransport = server.transport();
        assert_eq!(server.connection_count(), 0);
    }
}
