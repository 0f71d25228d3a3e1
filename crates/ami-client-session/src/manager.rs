//! Connection lifecycle: connect, close handling, reconnection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ami_client_core::{
    ConnectOptions, ConnectionEvent, ConnectionHandle, ConnectionParts, Credentials,
    Notification, NotificationHub, Transport, TransportError,
};
use ami_client_transport::{RetryPolicy, RetryingTransport};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::keepalive::KeepAlive;
use crate::options::OptionStore;

/// Who ended the last connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    User,
    /// The peer or the network closed it.
    Remote,
}

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnected(DisconnectReason),
    Reconnecting,
    /// The last connect or reconnection attempt failed.
    Failed,
}

struct ActiveConnection {
    generation: u64,
    handle: Arc<dyn ConnectionHandle>,
    closing: bool,
}

/// The live connection, if any.
///
/// Components look the handle up here at every use instead of keeping it,
/// so nothing outlives a reconnect.
#[derive(Default)]
pub struct ConnectionSlot {
    active: RwLock<Option<ActiveConnection>>,
}

impl ConnectionSlot {
    /// Handle of the live connection. `None` once it started closing.
    #[must_use]
    pub fn handle(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.active
            .read()
            .as_ref()
            .filter(|active| !active.closing)
            .map(|active| Arc::clone(&active.handle))
    }

    /// Install `handle` as generation `generation`, returning the one it replaces.
    pub fn replace(
        &self,
        generation: u64,
        handle: Arc<dyn ConnectionHandle>,
    ) -> Option<Arc<dyn ConnectionHandle>> {
        self.active
            .write()
            .replace(ActiveConnection {
                generation,
                handle,
                closing: false,
            })
            .map(|previous| previous.handle)
    }

    /// Whether `generation` is still the installed connection.
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.active
            .read()
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// First phase of teardown. Returns false if `generation` is not
    /// installed or is already closing.
    pub fn mark_closing(&self, generation: u64) -> bool {
        match self.active.write().as_mut() {
            Some(active) if active.generation == generation && !active.closing => {
                active.closing = true;
                true
            }
            _ => false,
        }
    }

    /// Second phase of teardown: remove `generation` if still installed.
    pub fn take_if(&self, generation: u64) -> Option<Arc<dyn ConnectionHandle>> {
        let mut active = self.active.write();
        if active.as_ref().is_some_and(|a| a.generation == generation) {
            active.take().map(|a| a.handle)
        } else {
            None
        }
    }

    /// Remove whatever is installed. Returns the handle unless it was
    /// already closing.
    pub fn take_open(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.active
            .write()
            .take()
            .filter(|active| !active.closing)
            .map(|active| active.handle)
    }
}

/// Drives connect / close / reconnect for one session.
///
/// Each installed connection gets a generation number. Its inbound pump and
/// close handling act only while that generation is current, so signals from
/// a replaced connection are ignored.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    options: Arc<OptionStore>,
    hub: Arc<NotificationHub>,
    correlator: Arc<Correlator>,
    keepalive: Arc<KeepAlive>,
    dispatcher: Arc<Dispatcher>,
    slot: Arc<ConnectionSlot>,
    state: Mutex<ConnectionState>,
    target: Mutex<Option<(Credentials, ConnectOptions)>>,
    user_disconnect: AtomicBool,
    generation: AtomicU64,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager with its keep-alive and dispatcher.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        options: Arc<OptionStore>,
        hub: Arc<NotificationHub>,
        correlator: Arc<Correlator>,
    ) -> Arc<Self> {
        let slot = Arc::new(ConnectionSlot::default());
        let keepalive = KeepAlive::new(Arc::clone(&options), Arc::clone(&slot));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&options),
            Arc::clone(&hub),
            Arc::clone(&correlator),
            Arc::clone(&keepalive),
        ));
        Arc::new(Self {
            transport,
            options,
            hub,
            correlator,
            keepalive,
            dispatcher,
            slot,
            state: Mutex::new(ConnectionState::Idle),
            target: Mutex::new(None),
            user_disconnect: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnect_task: Mutex::new(None),
        })
    }

    /// Connect with the retry policy of the current options.
    ///
    /// Credentials and options are kept for automatic reconnection. A
    /// connection that is already live is replaced.
    ///
    /// # Errors
    /// Returns the transport error of the last attempt, e.g.
    /// [`TransportError::AuthenticationFailed`] or
    /// [`TransportError::MaxAttemptsExceeded`].
    pub async fn connect(
        self: &Arc<Self>,
        credentials: Credentials,
        options: ConnectOptions,
    ) -> Result<Arc<dyn ConnectionHandle>> {
        *self.target.lock() = Some((credentials.clone(), options.clone()));
        self.user_disconnect.store(false, Ordering::SeqCst);
        if self.stop_reconnect() {
            tracing::debug!("reconnection superseded by connect()");
        }
        self.set_state(ConnectionState::Connecting);
        tracing::info!(address = %options.address(), user = %credentials.user, "connecting");

        match self.establish(&credentials, &options).await {
            Ok(parts) => Ok(self.install(parts)),
            Err(e) => {
                tracing::warn!(address = %options.address(), error = %e, "connect failed");
                self.set_state(if self.slot.handle().is_some() {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Failed
                });
                Err(e.into())
            }
        }
    }

    /// Close the connection on behalf of the user. Idempotent.
    ///
    /// `disconnect` is published and pending requests are rejected before
    /// the transport confirms closure. A reconnection in progress is
    /// stopped and no new one follows.
    pub fn disconnect(&self) {
        self.user_disconnect.store(true, Ordering::SeqCst);
        self.keepalive.cancel();
        if self.stop_reconnect() {
            tracing::info!("reconnection stopped by disconnect()");
            self.set_state(ConnectionState::Disconnected(DisconnectReason::User));
        }

        let Some(handle) = self.slot.take_open() else {
            return;
        };
        tracing::info!("disconnecting");
        self.set_state(ConnectionState::Disconnected(DisconnectReason::User));
        self.hub.publish(Notification::Disconnect);
        let rejected = self.correlator.reject_all();
        if rejected > 0 {
            tracing::debug!(rejected, "pending requests rejected");
        }
        handle.close();
    }

    /// Handle of the live connection.
    #[must_use]
    pub fn current_connection(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.slot.handle()
    }

    /// Whether a live connection is installed and open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.slot.handle().is_some_and(|handle| handle.is_connected())
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn keepalive(&self) -> &Arc<KeepAlive> {
        &self.keepalive
    }

    /// Start or stop the heartbeat after `keepAlive` changed at runtime.
    pub fn refresh_keepalive(self: &Arc<Self>) {
        if self.options.read(|o| o.keep_alive) {
            self.keepalive.ensure_running();
        } else {
            self.keepalive.pause();
        }
    }

    /// Abort the reconnection task. Returns true if it was still running.
    fn stop_reconnect(&self) -> bool {
        match self.reconnect_task.lock().take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                true
            }
            _ => false,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::trace!(from = ?*current, to = ?state, "state change");
            *current = state;
        }
    }

    async fn establish(
        &self,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> std::result::Result<ConnectionParts, TransportError> {
        let policy = RetryPolicy::from_options(&self.options.snapshot());
        RetryingTransport::new(Arc::clone(&self.transport), policy)
            .connect(credentials, options)
            .await
    }

    fn install(self: &Arc<Self>, parts: ConnectionParts) -> Arc<dyn ConnectionHandle> {
        let ConnectionParts { handle, events } = parts;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.keepalive.cancel();
        if let Some(previous) = self.slot.replace(generation, Arc::clone(&handle)) {
            if previous.is_connected() {
                previous.close();
            }
        }

        self.set_state(ConnectionState::Connected);
        tracing::info!(generation, "connected");
        tokio::spawn(Arc::clone(self).pump(generation, events));
        self.hub.publish(Notification::Connect);

        if self.options.read(|o| o.keep_alive) {
            self.keepalive.arm();
        }
        handle
    }

    async fn pump(
        self: Arc<Self>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            if !self.slot.is_current(generation) {
                break;
            }
            match event {
                ConnectionEvent::Message(message) => self.dispatcher.dispatch(message),
                ConnectionEvent::Error(e) => {
                    tracing::warn!(generation, error = %e, "connection error");
                    self.hub.publish(Notification::InternalError(e));
                }
                ConnectionEvent::Close => break,
            }
        }
        drop(events);
        self.handle_close(generation).await;
    }

    async fn handle_close(self: &Arc<Self>, generation: u64) {
        if !self.slot.mark_closing(generation) {
            return;
        }

        self.keepalive.cancel();
        let by_user = self.user_disconnect.load(Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected(if by_user {
            DisconnectReason::User
        } else {
            DisconnectReason::Remote
        }));
        tracing::info!(generation, "connection closed");
        self.hub.publish(Notification::Disconnect);
        let rejected = self.correlator.reject_all();
        if rejected > 0 {
            tracing::debug!(rejected, "pending requests rejected");
        }

        // Let handlers already running for this connection finish before
        // the handle is released.
        tokio::task::yield_now().await;
        self.slot.take_if(generation);

        if self.user_disconnect.load(Ordering::SeqCst)
            || !self.options.read(|o| o.reconnect)
            || self.slot.handle().is_some()
        {
            return;
        }
        self.set_state(ConnectionState::Reconnecting);
        self.hub.publish(Notification::Reconnection);
        self.spawn_reconnect();
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            let target = this.target.lock().clone();
            let Some((credentials, options)) = target else {
                return;
            };
            tracing::info!(address = %options.address(), "reconnecting");

            match this.establish(&credentials, &options).await {
                Ok(parts) if this.user_disconnect.load(Ordering::SeqCst) => {
                    tracing::debug!("reconnected after disconnect(), dropping connection");
                    parts.handle.close();
                }
                Ok(parts) => {
                    this.install(parts);
                    // disconnect() may have run between the check above and
                    // the install.
                    if this.user_disconnect.load(Ordering::SeqCst) {
                        this.disconnect();
                    }
                }
                Err(e) => {
                    tracing::warn!(address = %options.address(), error = %e, "reconnection failed");
                    this.set_state(ConnectionState::Failed);
                    this.hub.publish(Notification::InternalError(e));
                }
            }
        });
        if let Some(previous) = self.reconnect_task.lock().replace(task) {
            previous.abort();
        }
        if self.user_disconnect.load(Ordering::SeqCst) && self.stop_reconnect() {
            self.set_state(ConnectionState::Disconnected(DisconnectReason::User));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ami_client_core::{Action, Event, SessionOptions};
    use ami_client_transport::MemoryServer;
    use serde_json::json;
    use tokio::sync::broadcast;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    fn creds() -> Credentials {
        Credentials::new("test", "test")
    }

    fn manager(
        server: &MemoryServer,
        options: serde_json::Value,
    ) -> (Arc<ConnectionManager>, broadcast::Receiver<Notification>) {
        let options = Arc::new(OptionStore::new(
            SessionOptions::from_value(options).unwrap(),
        ));
        let hub = Arc::new(NotificationHub::new());
        let rx = hub.subscribe();
        let manager =
            ConnectionManager::new(Arc::new(server.transport()), options, hub, Correlator::new());
        (manager, rx)
    }

    async fn next_named(rx: &mut broadcast::Receiver<Notification>, name: &str) -> Notification {
        loop {
            let notification = rx.recv().await.unwrap();
            if notification.name() == name {
                return notification;
            }
        }
    }

    #[test]
    fn test_slot_two_phase_teardown() {
        struct Dummy;
        impl ConnectionHandle for Dummy {
            fn write(&self, _action: &Action) -> std::result::Result<(), TransportError> {
                Ok(())
            }
            fn close(&self) {}
            fn is_connected(&self) -> bool {
                true
            }
        }

        let slot = ConnectionSlot::default();
        assert!(slot.replace(1, Arc::new(Dummy)).is_none());
        assert!(slot.handle().is_some());

        assert!(slot.mark_closing(1));
        assert!(!slot.mark_closing(1));
        assert!(slot.handle().is_none());
        assert!(slot.is_current(1));

        assert!(slot.take_if(2).is_none());
        assert!(slot.take_if(1).is_some());
        assert!(!slot.is_current(1));
        assert!(slot.take_open().is_none());
    }

    #[tokio::test]
    async fn test_connect_installs_connection() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(&server, json!({}));
        assert_eq!(manager.state(), ConnectionState::Idle);

        let handle = assert_ok!(manager.connect(creds(), ConnectOptions::default()).await);
        assert!(handle.is_connected());
        assert!(manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(rx.recv().await.unwrap(), Notification::Connect);
    }

    #[tokio::test]
    async fn test_connect_failure_sets_failed() {
        let server = MemoryServer::new(creds());
        let (manager, _rx) = manager(&server, json!({}));

        let err = assert_err!(
            manager
                .connect(Credentials::new("username", "secret"), ConnectOptions::default())
                .await
        );
        assert!(matches!(
            err,
            crate::SessionError::Transport(TransportError::AuthenticationFailed(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_dispatcher() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(&server, json!({}));
        manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();

        server.broadcast_event(Event::new("FullyBooted"));
        next_named(&mut rx, "FullyBooted").await;
        assert_eq!(manager.dispatcher().last_event(), Some(Event::new("FullyBooted")));
    }

    #[tokio::test]
    async fn test_connection_errors_are_published() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(&server, json!({}));
        manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();

        server.send_error(TransportError::Io("reset by peer".into()));
        assert_eq!(
            next_named(&mut rx, "internalError").await,
            Notification::InternalError(TransportError::Io("reset by peer".into()))
        );
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_remote_close_without_reconnect() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(&server, json!({}));
        manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();

        server.drop_connections();
        next_named(&mut rx, "disconnect").await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected(DisconnectReason::Remote)
        );
        assert!(manager.current_connection().is_none());
        assert_eq!(server.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(&server, json!({"reconnect": true}));
        manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), Notification::Connect);

        manager.disconnect();
        manager.disconnect();
        assert_eq!(rx.recv().await.unwrap(), Notification::Disconnect);
        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected(DisconnectReason::User)
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(server.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_second_connect_replaces_first() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(&server, json!({"reconnect": true}));
        let first = manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();
        let second = manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();

        assert!(!first.is_connected());
        assert!(second.is_connected());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let names: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|n| n.name().into_owned())
            .collect();
        assert_eq!(names, vec!["connect", "connect"]);
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_failure_is_published() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(
            &server,
            json!({"reconnect": true, "attemptsDelay": 10, "maxAttemptsCount": 2}),
        );
        manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();

        server.shutdown();
        next_named(&mut rx, "reconnection").await;
        assert_eq!(
            next_named(&mut rx, "internalError").await,
            Notification::InternalError(TransportError::MaxAttemptsExceeded { attempts: 2 })
        );
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_running_reconnection() {
        let server = MemoryServer::new(creds());
        let (manager, mut rx) = manager(
            &server,
            json!({"reconnect": true, "attemptsDelay": 100, "maxAttemptsCount": null}),
        );
        manager
            .connect(creds(), ConnectOptions::default())
            .await
            .unwrap();

        server.shutdown();
        next_named(&mut rx, "reconnection").await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        manager.disconnect();
        assert_eq!(
            manager.state(),
            ConnectionState::Disconnected(DisconnectReason::User)
        );
        let attempts = server.connect_attempts();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(server.connect_attempts(), attempts);
        assert!(manager.reconnect_task.lock().is_none());
    }
}
