//! Classification and republication of inbound messages.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ami_client_core::{Event, InboundMessage, Notification, NotificationHub, Response};
use parking_lot::Mutex;

use crate::correlator::Correlator;
use crate::keepalive::KeepAlive;
use crate::options::OptionStore;

/// Milliseconds since the Unix epoch.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Routes every inbound message of the current connection.
///
/// Internal bookkeeping (keep-alive pings, correlated requests) always runs
/// before the generic `event` / `response` notification is published.
pub struct Dispatcher {
    options: Arc<OptionStore>,
    hub: Arc<NotificationHub>,
    correlator: Arc<Correlator>,
    keepalive: Arc<KeepAlive>,
    last_event: Mutex<Option<Event>>,
    last_response: Mutex<Option<Response>>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        options: Arc<OptionStore>,
        hub: Arc<NotificationHub>,
        correlator: Arc<Correlator>,
        keepalive: Arc<KeepAlive>,
    ) -> Self {
        Self {
            options,
            hub,
            correlator,
            keepalive,
            last_event: Mutex::new(None),
            last_response: Mutex::new(None),
        }
    }

    /// Handle one inbound message.
    pub fn dispatch(&self, message: InboundMessage) {
        match message {
            InboundMessage::Event(event) => self.on_event(event),
            InboundMessage::Response(response) => self.on_response(response),
            InboundMessage::Data(chunk) => self.hub.publish(Notification::Data(chunk)),
        }
    }

    fn on_event(&self, mut event: Event) {
        let (add_time, by_type, lower_case) = self.options.read(|o| {
            (
                o.add_time,
                o.emit_events_by_types,
                o.event_type_to_lower_case,
            )
        });

        if let Some(name) = event.name.as_deref() {
            if self.options.read(|o| o.is_event_filtered(name)) {
                tracing::trace!(event = %name, "event filtered");
                return;
            }
        }

        if add_time {
            event.time = Some(now_millis());
        }
        *self.last_event.lock() = Some(event.clone());

        let by_type_name = event
            .name
            .as_ref()
            .filter(|_| by_type)
            .map(|name| if lower_case { name.to_lowercase() } else { name.clone() });

        match by_type_name {
            Some(name) => {
                self.hub.publish(Notification::Event(event.clone()));
                self.hub.publish(Notification::EventByType { name, event });
            }
            None => self.hub.publish(Notification::Event(event)),
        }
    }

    fn on_response(&self, mut response: Response) {
        if let Some(id) = response.action_id.as_deref() {
            if self.keepalive.acknowledge(id) {
                return;
            }
        }

        let (add_time, by_id) = self
            .options
            .read(|o| (o.add_time, o.emit_responses_by_id));
        if add_time {
            response.time = Some(now_millis());
        }

        if let Some(action_id) = response.action_id.clone() {
            if by_id {
                self.hub.publish(Notification::ResponseById {
                    action_id: action_id.clone(),
                    response: response.clone(),
                });
            }
            response.strip_internal_id();
            self.correlator.resolve(&action_id, response.clone());
        }

        *self.last_response.lock() = Some(response.clone());
        self.hub.publish(Notification::Response(response));
    }

    /// The most recent event that passed the filter.
    #[must_use]
    pub fn last_event(&self) -> Option<Event> {
        self.last_event.lock().clone()
    }

    /// The most recent published response, internal ids stripped.
    #[must_use]
    pub fn last_response(&self) -> Option<Response> {
        self.last_response.lock().clone()
    }
}
