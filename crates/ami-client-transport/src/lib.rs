//! Transport side of the AMI session client.
//!
//! Provides:
//! - `RetryingTransport` - connect attempts with a fixed delay and a cap
//! - `MemoryTransport` - in-process manager peer (feature: memory)

pub mod retry;

#[cfg(feature = "memory")]
pub mod memory;

pub use retry::{RetryPolicy, RetryingTransport};

#[cfg(feature = "memory")]
pub use memory::{MemoryServer, MemoryTransport};
