//! Connect attempts with a fixed delay and an optional cap.

use std::time::Duration;

use ami_client_core::{
    ConnectOptions, ConnectionParts, Credentials, SessionOptions, Transport, TransportError,
};
use async_trait::async_trait;

/// How connect failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retry network failures at all.
    pub reconnect: bool,
    /// Pause between two attempts.
    pub attempts_delay: Duration,
    /// Total attempts allowed. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&SessionOptions::default())
    }
}

impl RetryPolicy {
    /// Policy described by the session options.
    #[must_use]
    pub const fn from_options(options: &SessionOptions) -> Self {
        Self {
            reconnect: options.reconnect,
            attempts_delay: options.attempts_delay,
            max_attempts: options.max_attempts_count,
        }
    }

    /// Single attempt, first failure is final.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            reconnect: false,
            attempts_delay: Duration::ZERO,
            max_attempts: Some(1),
        }
    }

    const fn exhausted(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts >= max,
            None => false,
        }
    }
}

/// Wraps a transport and retries failed connects according to a [`RetryPolicy`].
///
/// Authentication failures are never retried.
pub struct RetryingTransport<T> {
    inner: T,
    policy: RetryPolicy,
}

impl<T> RetryingTransport<T>
where
    T: Transport,
{
    /// Create a retrying wrapper.
    #[must_use]
    pub const fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The policy in effect.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<T> Transport for RetryingTransport<T>
where
    T: Transport,
{
    async fn connect(
        &self,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<ConnectionParts, TransportError> {
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            match self.inner.connect(credentials, options).await {
                Ok(parts) => {
                    if attempts > 1 {
                        tracing::info!(attempts, address = %options.address(), "connected after retries");
                    }
                    return Ok(parts);
                }
                Err(e) if !self.policy.reconnect || !e.is_retryable() => return Err(e),
                Err(e) => {
                    if self.policy.exhausted(attempts) {
                        tracing::warn!(attempts, error = %e, "giving up on connect");
                        return Err(TransportError::MaxAttemptsExceeded { attempts });
                    }
                    tracing::debug!(
                        attempt = attempts,
                        delay_ms = u64::try_from(self.policy.attempts_delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "connect attempt failed, retrying"
                    );
                    tokio::time::sleep(self.policy.attempts_delay).await;
                }
            }
        }
    }
}
