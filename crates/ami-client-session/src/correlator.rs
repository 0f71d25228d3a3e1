//! Correlation of promise-style requests with their responses.
//!
//! Each request is registered under its correlation id together with a
//! oneshot reply channel and a timeout task. Exactly one of three paths
//! settles it: the matching response, the timeout, or a disconnect. The path
//! that removes the entry from the table wins; the reply is sent while the
//! table lock is held so no other path can observe a half-settled entry.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use ami_client_core::{Action, ConnectionHandle, Response};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};

type Reply = oneshot::Sender<Result<Response>>;

/// An in-flight request.
struct PendingRequest {
    /// Distinguishes registrations that reuse the same correlation id.
    ticket: u64,
    /// The action as written to the wire.
    action: Action,
    reply: Reply,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    fn settle(self, result: Result<Response>) {
        self.timer.abort();
        let _ = self.reply.send(result); // caller stopped waiting
    }
}

/// Table of in-flight requests keyed by correlation id.
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_ticket: AtomicU64,
}

impl Correlator {
    /// Create an empty correlator.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `action`, arm its timeout and write it to `handle`.
    ///
    /// An internal correlation id is assigned when the action has none.
    /// Registration happens before the write so a fast response cannot
    /// overtake it.
    ///
    /// # Errors
    /// Returns error if the write fails; the entry is removed again.
    pub fn submit(
        self: &Arc<Self>,
        handle: &dyn ConnectionHandle,
        mut action: Action,
        timeout: Duration,
    ) -> Result<PendingResponse> {
        let action_id = action.ensure_action_id().to_string();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            // Spawned under the lock so the timer cannot look up the entry
            // before it is inserted.
            let timer = {
                let correlator = Arc::downgrade(self);
                let action_id = action_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(correlator) = correlator.upgrade() {
                        correlator.expire(&action_id, ticket, timeout);
                    }
                })
            };
            let entry = PendingRequest {
                ticket,
                action: action.clone(),
                reply,
                timer,
            };
            if let Some(previous) = pending.insert(action_id.clone(), entry) {
                tracing::warn!(action_id = %action_id, "correlation id reused while pending");
                previous.settle(Err(SessionError::DuplicateActionId {
                    action_id: action_id.clone(),
                }));
            }
        }

        if let Err(e) = handle.write(&action) {
            self.cancel(&action_id, ticket);
            return Err(e.into());
        }
        tracing::debug!(action_id = %action_id, action = %action.name, "request submitted");

        Ok(PendingResponse {
            action_id,
            ticket,
            rx,
            correlator: Arc::downgrade(self),
            done: false,
        })
    }

    /// Settle the request registered under `action_id` with `response`.
    ///
    /// Returns false when nothing was waiting for this id.
    pub fn resolve(&self, action_id: &str, response: Response) -> bool {
        let mut pending = self.pending.lock();
        match pending.remove(action_id) {
            Some(entry) => {
                tracing::debug!(action_id = %action_id, "request resolved");
                entry.settle(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request with [`SessionError::Disconnected`].
    ///
    /// Returns the number of requests rejected.
    pub fn reject_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        for (action_id, entry) in pending.drain() {
            tracing::debug!(action_id = %action_id, "request rejected on disconnect");
            entry.settle(Err(SessionError::Disconnected { action_id }));
        }
        count
    }

    /// Number of requests still waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no request is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Whether a request is waiting under `action_id`.
    #[must_use]
    pub fn contains(&self, action_id: &str) -> bool {
        self.pending.lock().contains_key(action_id)
    }

    /// The submitted action waiting under `action_id`.
    #[must_use]
    pub fn submitted(&self, action_id: &str) -> Option<Action> {
        self.pending
            .lock()
            .get(action_id)
            .map(|entry| entry.action.clone())
    }

    fn expire(&self, action_id: &str, ticket: u64, after: Duration) {
        let mut pending = self.pending.lock();
        if pending.get(action_id).is_some_and(|e| e.ticket == ticket) {
            if let Some(entry) = pending.remove(action_id) {
                tracing::debug!(action_id = %action_id, "request timed out");
                // The timer is the running task; dropping its handle is enough.
                let _ = entry.reply.send(Err(SessionError::Timeout {
                    action_id: action_id.to_string(),
                    after,
                }));
            }
        }
    }

    fn cancel(&self, action_id: &str, ticket: u64) {
        let mut pending = self.pending.lock();
        if pending.get(action_id).is_some_and(|e| e.ticket == ticket) {
            if let Some(entry) = pending.remove(action_id) {
                entry.timer.abort();
            }
        }
    }
}

/// Future resolving to the response of a promise-style request.
///
/// Dropping it before completion deregisters the request.
#[must_use = "the request is deregistered when this is dropped"]
pub struct PendingResponse {
    action_id: String,
    ticket: u64,
    rx: oneshot::Receiver<Result<Response>>,
    correlator: Weak<Correlator>,
    done: bool,
}

impl PendingResponse {
    /// Correlation id of the request.
    #[must_use]
    pub fn action_id(&self) -> &str {
        &self.action_id
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("action_id", &self.action_id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl Future for PendingResponse {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.done = true;
                let action_id = self.action_id.clone();
                Poll::Ready(result.unwrap_or_else(|_| Err(SessionError::Disconnected { action_id })))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.cancel(&self.action_id, self.ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use ami_client_core::TransportError;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    /// Handle recording writes, optionally failing them.
    #[derive(Default)]
    struct RecordingHandle {
        written: Mutex<Vec<Action>>,
        fail: bool,
    }

    impl ConnectionHandle for RecordingHandle {
        fn write(&self, action: &Action) -> std::result::Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Closed);
            }
            self.written.lock().push(action.clone());
            Ok(())
        }

        fn close(&self) {}

        fn is_connected(&self) -> bool {
            !self.fail
        }
    }

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn test_resolve_delivers_response() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let pending = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();
        assert!(correlator.contains("1"));
        assert_eq!(handle.written.lock().len(), 1);

        assert!(correlator.resolve("1", Response::new("Success").with_field("Ping", "Pong")));
        let response = assert_ok!(pending.await);
        assert_eq!(response.get("Ping"), Some("Pong"));
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_deregisters() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let pending = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();

        let err = assert_err!(pending.await);
        assert!(err.is_timeout());
        assert_eq!(err.action_id(), Some("1"));
        assert!(!correlator.contains("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_without_polling() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let _pending = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();
        tokio::time::sleep(TIMEOUT * 2).await;

        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_timeout_is_not_delivered() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let pending = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();
        tokio::time::sleep(TIMEOUT * 2).await;

        assert!(!correlator.resolve("1", Response::new("Success")));
        assert!(assert_err!(pending.await).is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_all_broadcasts_disconnect() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let first = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();
        let second = correlator
            .submit(&handle, Action::new("Status").with_action_id("2"), TIMEOUT)
            .unwrap();

        assert_eq!(correlator.reject_all(), 2);
        assert!(assert_err!(first.await).is_disconnected());
        assert!(assert_err!(second.await).is_disconnected());
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_once() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let pending = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();

        assert!(correlator.resolve("1", Response::new("Success")));
        assert_eq!(correlator.reject_all(), 0);
        assert!(!correlator.resolve("1", Response::new("Error")));
        tokio::time::sleep(TIMEOUT * 2).await;

        let response = assert_ok!(pending.await);
        assert_eq!(response.status(), Some("Success"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_deregisters() {
        let correlator = Correlator::new();
        let handle = RecordingHandle {
            fail: true,
            ..RecordingHandle::default()
        };

        let err = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::Closed)));
        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_deregisters() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let pending = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();
        drop(pending);

        assert!(correlator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reused_id_supersedes_earlier_request() {
        let correlator = Correlator::new();
        let handle = RecordingHandle::default();

        let first = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();
        let second = correlator
            .submit(&handle, Action::new("Ping").with_action_id("1"), TIMEOUT)
            .unwrap();

        let err = assert_err!(first.await);
        assert!(matches!(err, SessionError::DuplicateActionId { .. }));
        assert!(correlator.contains("1"));

        assert!(correlator.resolve("1", Response::new("Success")));
        assert_ok!(second.await);
    }
}
