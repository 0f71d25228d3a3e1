//! Broadcast of session notifications.

use std::borrow::Cow;

use bytes::Bytes;
use futures::{StreamExt, future};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{Action, Event, Response, TransportError};

/// Default number of notifications buffered per subscriber.
const CHANNEL_CAPACITY: usize = 1024;

/// Everything the session publishes to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A connection was established.
    Connect,
    /// The connection was lost or closed by the user.
    Disconnect,
    /// An automatic reconnection is starting.
    Reconnection,
    /// An action was handed to the transport.
    Action(Action),
    /// An inbound event that passed the filter.
    Event(Event),
    /// The same event, published under its type name.
    EventByType { name: String, event: Event },
    /// An inbound response.
    Response(Response),
    /// A response published under its correlation id.
    ResponseById { action_id: String, response: Response },
    /// A raw chunk from the transport.
    Data(Bytes),
    /// A failure nobody was awaiting.
    InternalError(TransportError),
}

impl Notification {
    /// Public notification name, e.g. `event`, `Hangup` or `resp_42`.
    #[must_use]
    pub fn name(&self) -> Cow<'_, str> {
        match self {
            Self::Connect => Cow::Borrowed("connect"),
            Self::Disconnect => Cow::Borrowed("disconnect"),
            Self::Reconnection => Cow::Borrowed("reconnection"),
            Self::Action(_) => Cow::Borrowed("action"),
            Self::Event(_) => Cow::Borrowed("event"),
            Self::EventByType { name, .. } => Cow::Borrowed(name.as_str()),
            Self::Response(_) => Cow::Borrowed("response"),
            Self::ResponseById { action_id, .. } => Cow::Owned(format!("resp_{action_id}")),
            Self::Data(_) => Cow::Borrowed("data"),
            Self::InternalError(_) => Cow::Borrowed("internalError"),
        }
    }
}

/// Fan-out of notifications to any number of subscribers.
///
/// Publishing never blocks; slow subscribers lose the oldest notifications.
pub struct NotificationHub {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    /// Create a new hub.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a hub buffering `capacity` notifications per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a notification to current subscribers.
    pub fn publish(&self, notification: Notification) {
        tracing::trace!(name = %notification.name(), "publish");
        let _ = self.sender.send(notification); // no subscribers is fine
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get a receiver for live notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Stream of live notifications, skipping any lost to lag.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, Notification> {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| future::ready(res.ok()))
            .boxed()
    }

    /// Stream of events published under type name `name`.
    #[must_use]
    pub fn events_of_type(
        &self,
        name: impl Into<String>,
    ) -> futures::stream::BoxStream<'static, Event> {
        let name = name.into();
        self.stream()
            .filter_map(move |notification| {
                future::ready(match notification {
                    Notification::EventByType { name: kind, event } if kind == name => Some(event),
                    _ => None,
                })
            })
            .boxed()
    }

    /// Stream of responses published under correlation id `action_id`.
    #[must_use]
    pub fn responses_for(
        &self,
        action_id: impl Into<String>,
    ) -> futures::stream::BoxStream<'static, Response> {
        let action_id = action_id.into();
        self.stream()
            .filter_map(move |notification| {
                future::ready(match notification {
                    Notification::ResponseById {
                        action_id: id,
                        response,
                    } if id == action_id => Some(response),
                    _ => None,
                })
            })
            .boxed()
    }
}
