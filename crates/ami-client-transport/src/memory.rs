//! In-memory transport.
//!
//! A [`MemoryServer`] plays the manager side of the protocol inside the
//! process: it checks credentials, records every action written to it,
//! answers `Ping` and can push events or drop connections on demand.
//! Useful for tests and for embedding the session layer without a socket.

use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use ami_client_core::{
    Action, ConnectOptions, ConnectionEvent, ConnectionHandle, ConnectionParts, Credentials,
    Event, InboundMessage, Response, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

const ACTION_CHANNEL_CAPACITY: usize = 256;

struct ServerState {
    credentials: Credentials,
    online: AtomicBool,
    auto_pong: AtomicBool,
    connect_attempts: AtomicU32,
    connections: Mutex<Vec<Arc<MemoryConnection>>>,
    written: Mutex<Vec<Action>>,
    actions: broadcast::Sender<Action>,
}

impl ServerState {
    fn live_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.is_connected());
        connections.clone()
    }

    fn deliver(&self, event: &ConnectionEvent) -> usize {
        let live = self.live_connections();
        for connection in &live {
            connection.emit(event.clone());
        }
        live.len()
    }
}

/// Manager peer living in the same process.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl MemoryServer {
    /// Create an online server accepting `credentials`.
    #[must_use]
    pub fn new(credentials: Credentials) -> Self {
        let (actions, _) = broadcast::channel(ACTION_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(ServerState {
                credentials,
                online: AtomicBool::new(true),
                auto_pong: AtomicBool::new(true),
                connect_attempts: AtomicU32::new(0),
                connections: Mutex::new(Vec::new()),
                written: Mutex::new(Vec::new()),
                actions,
            }),
        }
    }

    /// Transport connecting to this server.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            state: Arc::clone(&self.state),
        }
    }

    /// Accept new connections again.
    pub fn listen(&self) {
        self.state.online.store(true, Ordering::SeqCst);
    }

    /// Refuse new connections and drop every live one.
    pub fn shutdown(&self) {
        self.state.online.store(false, Ordering::SeqCst);
        self.drop_connections();
    }

    /// Close every live connection from the server side.
    pub fn drop_connections(&self) {
        for connection in self.state.live_connections() {
            connection.close();
        }
    }

    /// Whether new connections are accepted.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.state.online.load(Ordering::SeqCst)
    }

    /// Answer `Ping` actions automatically (enabled by default).
    pub fn set_auto_pong(&self, enabled: bool) {
        self.state.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Number of connect attempts seen so far, successful or not.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.live_connections().len()
    }

    /// Every action written so far, oldest first.
    #[must_use]
    pub fn written(&self) -> Vec<Action> {
        self.state.written.lock().clone()
    }

    /// Receiver for actions written from now on.
    #[must_use]
    pub fn subscribe_actions(&self) -> broadcast::Receiver<Action> {
        self.state.actions.subscribe()
    }

    /// Push an event to every live connection. Returns the number reached.
    pub fn broadcast_event(&self, event: Event) -> usize {
        self.state
            .deliver(&ConnectionEvent::Message(InboundMessage::Event(event)))
    }

    /// Push a response to every live connection.
    pub fn send_response(&self, response: Response) -> usize {
        self.state
            .deliver(&ConnectionEvent::Message(InboundMessage::Response(response)))
    }

    /// Push a raw chunk to every live connection.
    pub fn send_data(&self, chunk: impl Into<Bytes>) -> usize {
        self.state
            .deliver(&ConnectionEvent::Message(InboundMessage::Data(chunk.into())))
    }

    /// Report a connection error on every live connection.
    pub fn send_error(&self, error: TransportError) -> usize {
        self.state.deliver(&ConnectionEvent::Error(error))
    }
}

/// [`Transport`] backed by a [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<ServerState>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        credentials: &Credentials,
        options: &ConnectOptions,
    ) -> Result<ConnectionParts, TransportError> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        if !self.state.online.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionRefused(format!(
                "connect ECONNREFUSED {}",
                options.address()
            )));
        }
        if *credentials != self.state.credentials {
            return Err(TransportError::AuthenticationFailed(
                "Authentication failed".to_string(),
            ));
        }

        let (events_tx, events) = mpsc::unbounded_channel();
        let connection = Arc::new(MemoryConnection {
            open: AtomicBool::new(true),
            events_tx,
            server: Arc::downgrade(&self.state),
        });
        self.state.connections.lock().push(Arc::clone(&connection));
        tracing::debug!(address = %options.address(), user = %credentials.user, "memory connection opened");

        Ok(ConnectionParts {
            handle: connection,
            events,
        })
    }
}

/// Client end of an in-memory connection.
///
/// Holds the server weakly; once the server is gone writes fail.
pub struct MemoryConnection {
    open: AtomicBool,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    server: Weak<ServerState>,
}

impl MemoryConnection {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event); // receiver detached
    }
}

impl ConnectionHandle for MemoryConnection {
    fn write(&self, action: &Action) -> Result<(), TransportError> {
        let Some(server) = self.server.upgrade().filter(|_| self.is_connected()) else {
            return Err(TransportError::Closed);
        };

        server.written.lock().push(action.clone());
        let _ = server.actions.send(action.clone());

        if server.auto_pong.load(Ordering::SeqCst) && action.name.eq_ignore_ascii_case("ping") {
            let mut pong = Response::new("Success").with_field("Ping", "Pong");
            pong.action_id.clone_from(&action.action_id);
            self.emit(ConnectionEvent::Message(InboundMessage::Response(pong)));
        }
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.emit(ConnectionEvent::Close);
        }
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
