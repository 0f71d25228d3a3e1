//! Keep-alive heartbeat.
//!
//! One ping is outstanding at a time. The next ping is scheduled only when
//! the answer to the previous one arrives, so a silent peer stops the
//! heartbeat instead of piling up pings.

use std::sync::{Arc, Weak};

use ami_client_core::{Action, generate_internal_id};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::manager::ConnectionSlot;
use crate::options::OptionStore;

/// Name of the ping action.
const PING_ACTION: &str = "Ping";

#[derive(Default)]
struct State {
    pending_ping: Option<String>,
    timer: Option<JoinHandle<()>>,
}

/// Heartbeat for the current connection.
pub struct KeepAlive {
    options: Arc<OptionStore>,
    slot: Arc<ConnectionSlot>,
    state: Mutex<State>,
}

impl KeepAlive {
    #[must_use]
    pub fn new(options: Arc<OptionStore>, slot: Arc<ConnectionSlot>) -> Arc<Self> {
        Arc::new(Self {
            options,
            slot,
            state: Mutex::new(State::default()),
        })
    }

    /// Schedule the next ping after `keepAliveDelay`, replacing any
    /// scheduled one.
    pub fn arm(self: &Arc<Self>) {
        let delay = self.options.read(|o| o.keep_alive_delay);
        let this: Weak<Self> = Arc::downgrade(self);

        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = this.upgrade() {
                this.fire();
            }
        }));
    }

    /// Arm the heartbeat if it is enabled, connected and idle.
    ///
    /// Used after options change at runtime.
    pub fn ensure_running(self: &Arc<Self>) {
        if !self.options.read(|o| o.keep_alive) || self.slot.handle().is_none() {
            return;
        }
        let idle = {
            let state = self.state.lock();
            state.pending_ping.is_none() && state.timer.is_none()
        };
        if idle {
            self.arm();
        }
    }

    fn fire(&self) {
        let ping_id = {
            let mut state = self.state.lock();
            state.timer = None;
            if !self.options.read(|o| o.keep_alive) {
                return;
            }
            let id = generate_internal_id();
            state.pending_ping = Some(id.clone());
            id
        };

        let Some(handle) = self.slot.handle().filter(|h| h.is_connected()) else {
            self.state.lock().pending_ping = None;
            return;
        };

        tracing::debug!(action_id = %ping_id, "keep-alive ping");
        if let Err(e) = handle.write(&Action::new(PING_ACTION).with_action_id(ping_id)) {
            tracing::warn!(error = %e, "keep-alive ping not written");
            self.state.lock().pending_ping = None;
        }
    }

    /// Consume the answer to the outstanding ping.
    ///
    /// Returns true when `action_id` was the ping; the next ping is then
    /// scheduled if the heartbeat is still enabled.
    pub fn acknowledge(self: &Arc<Self>, action_id: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.pending_ping.as_deref() != Some(action_id) {
                return false;
            }
            state.pending_ping = None;
        }
        tracing::trace!(action_id = %action_id, "keep-alive acknowledged");
        if self.options.read(|o| o.keep_alive) {
            self.arm();
        }
        true
    }

    /// Stop scheduling pings. An outstanding ping is still recognized so
    /// its answer stays internal.
    pub fn pause(&self) {
        if let Some(timer) = self.state.lock().timer.take() {
            timer.abort();
        }
    }

    /// Stop the heartbeat and forget the outstanding ping.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.pending_ping = None;
    }

    /// Correlation id of the outstanding ping.
    #[must_use]
    pub fn pending_ping(&self) -> Option<String> {
        self.state.lock().pending_ping.clone()
    }

    /// Whether a ping is scheduled.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.lock().timer.is_some()
    }
}
