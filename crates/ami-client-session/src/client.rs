//! Public session API.

use std::sync::Arc;

use ami_client_core::{
    Action, ConnectOptions, ConnectionHandle, Credentials, Event, Notification,
    NotificationHub, OptionError, Response, SessionOptions, Transport,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::correlator::{Correlator, PendingResponse};
use crate::error::{Result, SessionError};
use crate::manager::{ConnectionManager, ConnectionState};
use crate::options::OptionStore;

/// Outcome of [`AmiClient::send_with`].
#[derive(Debug)]
pub enum Sent {
    /// Fire-and-forget: the action was handed to the transport.
    Written,
    /// Promise-style: resolves to the matching response.
    Pending(PendingResponse),
}

/// Session client for the manager protocol.
///
/// Composes the option store, dispatcher, request correlator and
/// connection manager. Background work runs on the tokio runtime, so the
/// client must be used from within one.
///
/// ```no_run
/// # async fn demo() -> ami_client_session::Result<()> {
/// use ami_client_session::{Action, AmiClient, ConnectOptions, Credentials, MemoryServer};
///
/// let server = MemoryServer::new(Credentials::new("admin", "secret"));
/// let client = AmiClient::new(server.transport());
/// client
///     .connect(Credentials::new("admin", "secret"), ConnectOptions::default())
///     .await?;
/// let pong = client.request(Action::new("Ping"))?.await?;
/// assert_eq!(pong.get("Ping"), Some("Pong"));
/// # Ok(())
/// # }
/// ```
pub struct AmiClient {
    options: Arc<OptionStore>,
    hub: Arc<NotificationHub>,
    correlator: Arc<Correlator>,
    manager: Arc<ConnectionManager>,
    last_action: Mutex<Option<Action>>,
}

impl AmiClient {
    /// Create a client with default options.
    #[must_use]
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_options(transport, SessionOptions::default())
    }

    /// Create a client with the given options.
    #[must_use]
    pub fn with_options(transport: impl Transport + 'static, options: SessionOptions) -> Self {
        let options = Arc::new(OptionStore::new(options));
        let hub = Arc::new(NotificationHub::new());
        let correlator = Correlator::new();
        let manager = ConnectionManager::new(
            Arc::new(transport),
            Arc::clone(&options),
            Arc::clone(&hub),
            Arc::clone(&correlator),
        );
        Self {
            options,
            hub,
            correlator,
            manager,
            last_action: Mutex::new(None),
        }
    }

    /// Connect and log in.
    ///
    /// Connect attempts follow `reconnect`, `attemptsDelay` and
    /// `maxAttemptsCount`. The credentials are kept for automatic
    /// reconnection.
    ///
    /// # Errors
    /// Returns [`SessionError::Transport`] with the failure of the last attempt.
    pub async fn connect(
        &self,
        credentials: Credentials,
        options: ConnectOptions,
    ) -> Result<Arc<dyn ConnectionHandle>> {
        self.manager.connect(credentials, options).await
    }

    /// Close the connection. No automatic reconnection follows.
    pub fn disconnect(&self) {
        self.manager.disconnect();
    }

    fn live_handle(&self) -> Result<Arc<dyn ConnectionHandle>> {
        self.manager
            .current_connection()
            .filter(|handle| handle.is_connected())
            .ok_or(SessionError::NotConnected)
    }

    fn record(&self, action: &Action) {
        *self.last_action.lock() = Some(action.clone());
        self.hub.publish(Notification::Action(action.clone()));
    }

    /// Fire-and-forget send.
    ///
    /// An internal correlation id is assigned when the action has none.
    /// Later failures surface as `internalError` notifications.
    ///
    /// # Errors
    /// Returns [`SessionError::NotConnected`] without a live connection, or
    /// the transport error if the write is refused.
    pub fn send(&self, mut action: Action) -> Result<()> {
        let handle = self.live_handle()?;
        action.ensure_action_id();
        self.record(&action);
        handle.write(&action)?;
        Ok(())
    }

    /// Promise-style send: the returned future resolves to the response
    /// carrying the same correlation id.
    ///
    /// Internally generated ids are stripped from the response. The future
    /// fails with [`SessionError::Timeout`] after `responseTimeout` and with
    /// [`SessionError::Disconnected`] if the connection drops first.
    ///
    /// # Errors
    /// Returns [`SessionError::NotConnected`] without a live connection, or
    /// the transport error if the write is refused.
    pub fn request(&self, mut action: Action) -> Result<PendingResponse> {
        let handle = self.live_handle()?;
        action.ensure_action_id();
        self.record(&action);
        let timeout = self.options.read(|o| o.response_timeout);
        self.correlator.submit(handle.as_ref(), action, timeout)
    }

    /// [`send`](Self::send) or [`request`](Self::request) depending on `promisable`.
    ///
    /// # Errors
    /// Same as the selected method.
    pub fn send_with(&self, action: Action, promisable: bool) -> Result<Sent> {
        if promisable {
            self.request(action).map(Sent::Pending)
        } else {
            self.send(action).map(|()| Sent::Written)
        }
    }

    /// Read one option. `None` for unknown names.
    #[must_use]
    pub fn get_option(&self, name: &str) -> Option<Value> {
        self.options.get(name)
    }

    /// Write one option. Nothing changes on error.
    ///
    /// # Errors
    /// Returns error for unknown names or values of the wrong type.
    pub fn set_option(&self, name: &str, value: Value) -> std::result::Result<(), OptionError> {
        self.options.set(name, value)?;
        if name == "keepAlive" {
            self.manager.refresh_keepalive();
        }
        Ok(())
    }

    /// Snapshot of every option.
    #[must_use]
    pub fn options(&self) -> SessionOptions {
        self.options.snapshot()
    }

    /// Merge a partial JSON object of options.
    ///
    /// Returns the keys that were not applied.
    ///
    /// # Errors
    /// Returns error if `partial` is not a JSON object.
    pub fn set_options(&self, partial: &Value) -> std::result::Result<Vec<String>, OptionError> {
        let rejected = self.options.merge(partial)?;
        self.manager.refresh_keepalive();
        Ok(rejected)
    }

    /// The most recent event that passed the filter.
    #[must_use]
    pub fn last_event(&self) -> Option<Event> {
        self.manager.dispatcher().last_event()
    }

    /// The most recent response, internally generated ids stripped.
    #[must_use]
    pub fn last_response(&self) -> Option<Response> {
        self.manager.dispatcher().last_response()
    }

    /// The most recent action sent.
    #[must_use]
    pub fn last_action(&self) -> Option<Action> {
        self.last_action.lock().clone()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    /// Handle of the live connection.
    #[must_use]
    pub fn current_connection(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.manager.current_connection()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Number of promise-style requests still waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlator.len()
    }

    /// Receiver for every notification published from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.hub.subscribe()
    }

    /// The notification hub, for filtered streams.
    #[must_use]
    pub fn notifications(&self) -> &NotificationHub {
        &self.hub
    }
}

impl Drop for AmiClient {
    fn drop(&mut self) {
        self.manager.disconnect();
    }
}
