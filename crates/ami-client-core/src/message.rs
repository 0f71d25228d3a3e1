//! Manager protocol messages.
//!
//! Messages are flat key/value records. The keys the session layer relies on
//! (`Action`, `Event`, `ActionID`) are lifted into typed fields, everything
//! else stays in an opaque [`Fields`] map.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque key/value payload of a message.
pub type Fields = BTreeMap<String, String>;

/// Prefix reserved for correlation ids generated by the client itself.
///
/// Ids in this namespace are stripped from responses before they are
/// surfaced to subscribers or callers.
pub const INTERNAL_ID_PREFIX: &str = "--ami_";

/// Generate a fresh correlation id inside the internal namespace.
#[must_use]
pub fn generate_internal_id() -> String {
    format!("{INTERNAL_ID_PREFIX}{}", Uuid::new_v4().simple())
}

/// Whether `id` belongs to the internal namespace.
#[must_use]
pub fn is_internal_id(id: &str) -> bool {
    id.starts_with(INTERNAL_ID_PREFIX)
}

/// Outbound request to the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Command name (`Action:` header).
    #[serde(rename = "Action")]
    pub name: String,
    /// Correlation id (`ActionID:` header).
    #[serde(rename = "ActionID", default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Remaining headers.
    #[serde(flatten)]
    pub fields: Fields,
}

impl Action {
    /// Create an action with no correlation id and no extra fields.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            action_id: None,
            fields: Fields::new(),
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Assign an internal correlation id if none is set, returning the id.
    pub fn ensure_action_id(&mut self) -> &str {
        self.action_id.get_or_insert_with(generate_internal_id)
    }
}

/// Unsolicited notification from the manager.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Event {
    /// Event type name (`Event:` header).
    #[serde(rename = "Event", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Remaining headers.
    #[serde(flatten)]
    pub fields: Fields,
    /// Arrival time in milliseconds since the Unix epoch, stamped when
    /// `addTime` is enabled.
    #[serde(rename = "$time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

impl Event {
    /// Create an event of the given type.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a header.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Reply to an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the action this answers.
    #[serde(rename = "ActionID", default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
    /// Headers, including `Response:` itself.
    #[serde(flatten)]
    pub fields: Fields,
    /// Arrival time in milliseconds since the Unix epoch.
    #[serde(rename = "$time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u64>,
}

impl Response {
    /// Create a response with the given `Response:` status.
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        let mut fields = Fields::new();
        fields.insert("Response".to_string(), status.into());
        Self {
            action_id: None,
            fields,
            time: None,
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    /// Add a header.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a header.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// The `Response:` status, e.g. `Success` or `Error`.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.get("Response")
    }

    /// Drop the correlation id when it was generated internally.
    pub fn strip_internal_id(&mut self) {
        if self.action_id.as_deref().is_some_and(is_internal_id) {
            self.action_id = None;
        }
    }
}

/// A parsed message delivered by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Event(Event),
    Response(Response),
    /// Raw chunk that did not parse into a message.
    Data(Bytes),
}
