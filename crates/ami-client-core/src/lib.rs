//! Core abstractions for the AMI session client.
//!
//! This crate provides the fundamental building blocks:
//! - `Action`, `Event`, `Response` - Manager protocol messages
//! - `SessionOptions` - Validated client configuration
//! - `NotificationHub` - Broadcast of session notifications
//! - `Transport` and `ConnectionHandle` traits

pub mod credentials;
pub mod error;
pub mod message;
pub mod notify;
pub mod options;
pub mod traits;

pub use credentials::{ConnectOptions, Credentials};
pub use error::{OptionError, TransportError};
pub use message::{
    Action, Event, Fields, INTERNAL_ID_PREFIX, InboundMessage, Response, generate_internal_id,
    is_internal_id,
};
pub use notify::{Notification, NotificationHub};
pub use options::{EventFilter, SessionOptions};
pub use traits::{ConnectionEvent, ConnectionHandle, ConnectionParts, Transport};
