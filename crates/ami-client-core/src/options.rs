//! Session configuration.
//!
//! Every recognized key is a field of [`SessionOptions`]; the camelCase JSON
//! form is the runtime boundary used by `get_option` / `set_option`.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::OptionError;

/// Canonical event filter: lower-cased event names to suppress.
pub type EventFilter = BTreeSet<String>;

/// Names of all recognized options, in their JSON spelling.
pub const OPTION_NAMES: &[&str] = &[
    "addTime",
    "attemptsDelay",
    "emitEventsByTypes",
    "emitResponsesById",
    "eventFilter",
    "eventTypeToLowerCase",
    "keepAlive",
    "keepAliveDelay",
    "maxAttemptsCount",
    "reconnect",
    "responseTimeout",
];

/// Client configuration with defaults filled for every key.
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct SessionOptions {
    /// Stamp events and responses with their arrival time.
    pub add_time: bool,
    /// Delay between connect attempts.
    #[serde(with = "millis")]
    pub attempts_delay: Duration,
    /// Publish each event a second time under its type name.
    pub emit_events_by_types: bool,
    /// Publish each correlated response under `resp_<id>`.
    pub emit_responses_by_id: bool,
    /// Event types to suppress. `None` disables filtering.
    #[serde(deserialize_with = "deserialize_event_filter")]
    pub event_filter: Option<EventFilter>,
    /// Lower-case the type name used for per-type publication.
    pub event_type_to_lower_case: bool,
    /// Send periodic keep-alive pings while connected.
    pub keep_alive: bool,
    /// Interval between keep-alive pings.
    #[serde(with = "millis")]
    pub keep_alive_delay: Duration,
    /// Maximum connect attempts. `None` means unbounded.
    pub max_attempts_count: Option<u32>,
    /// Reconnect automatically when the connection drops.
    pub reconnect: bool,
    /// How long a promise-style request waits for its response.
    #[serde(with = "millis")]
    pub response_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            add_time: false,
            attempts_delay: Duration::from_millis(1000),
            emit_events_by_types: true,
            emit_responses_by_id: true,
            event_filter: None,
            event_type_to_lower_case: false,
            keep_alive: false,
            keep_alive_delay: Duration::from_millis(1000),
            max_attempts_count: Some(30),
            reconnect: false,
            response_timeout: Duration::from_millis(10_000),
        }
    }
}

impl SessionOptions {
    /// Build options from a JSON object, filling defaults.
    ///
    /// # Errors
    /// Returns error on unknown keys or values of the wrong shape.
    pub fn from_value(value: Value) -> Result<Self, OptionError> {
        serde_json::from_value(value).map_err(|e| OptionError::InvalidValue {
            name: "options".to_string(),
            reason: e.to_string(),
        })
    }

    /// JSON form of all options.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Whether `name` is a recognized option key.
    #[must_use]
    pub fn is_known(name: &str) -> bool {
        OPTION_NAMES.contains(&name)
    }

    /// Read one option by its JSON name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        if !Self::is_known(name) {
            return None;
        }
        self.to_value().get(name).cloned()
    }

    /// Write one option by its JSON name.
    ///
    /// Nothing changes when the name is unknown or the value is invalid.
    ///
    /// # Errors
    /// Returns [`OptionError::Unknown`] or [`OptionError::InvalidValue`].
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), OptionError> {
        if !Self::is_known(name) {
            return Err(OptionError::Unknown(name.to_string()));
        }

        let mut current = match self.to_value() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        current.insert(name.to_string(), value);

        *self = serde_json::from_value(Value::Object(current)).map_err(|e| {
            OptionError::InvalidValue {
                name: name.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(())
    }

    /// Merge the recognized keys of `partial` into these options.
    ///
    /// Returns the keys that were not applied: unknown names and known
    /// names whose value was rejected.
    pub fn merge(&mut self, partial: &Map<String, Value>) -> Vec<String> {
        let mut rejected = Vec::new();
        for (name, value) in partial {
            if let Err(e) = self.set(name, value.clone()) {
                tracing::warn!(option = %name, error = %e, "option not applied");
                rejected.push(name.clone());
            }
        }
        rejected
    }

    /// Whether an event of this type is suppressed by the filter.
    #[must_use]
    pub fn is_event_filtered(&self, event_name: &str) -> bool {
        self.event_filter
            .as_ref()
            .is_some_and(|filter| filter.contains(&event_name.to_lowercase()))
    }
}

/// Normalize a user supplied event filter.
///
/// Accepts a list of names, an object whose keys are names, or `null` /
/// `false` for no filtering. Names are lower-cased and de-duplicated; falsy
/// entries are dropped.
///
/// # Errors
/// Returns a description of the offending value.
pub fn normalize_event_filter(value: &Value) -> Result<Option<EventFilter>, String> {
    let names: Vec<String> = match value {
        Value::Null | Value::Bool(false) => return Ok(None),
        Value::Array(items) => items
            .iter()
            .map(filter_entry)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect(),
        Value::Object(map) => map.keys().cloned().collect(),
        other => return Err(format!("expected a list or a map of event names, got {other}")),
    };

    Ok(Some(
        names
            .into_iter()
            .filter(|name| !name.is_empty())
            .map(|name| name.to_lowercase())
            .collect(),
    ))
}

fn filter_entry(item: &Value) -> Result<Option<String>, String> {
    match item {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::Bool(true) => Ok(Some("true".to_string())),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) if n.as_f64() == Some(0.0) => Ok(None),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(format!("invalid event name {other}")),
    }
}

fn deserialize_event_filter<'de, D>(deserializer: D) -> Result<Option<EventFilter>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    normalize_event_filter(&value).map_err(serde::de::Error::custom)
}

/// Durations as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::default();
        assert!(!options.add_time);
        assert!(options.emit_events_by_types);
        assert!(options.emit_responses_by_id);
        assert_eq!(options.max_attempts_count, Some(30));
        assert_eq!(options.keep_alive_delay, Duration::from_millis(1000));
        assert_eq!(options.response_timeout, Duration::from_secs(10));
        assert!(options.event_filter.is_none());
    }

    #[test]
    fn test_get_unknown_option() {
        let options = SessionOptions::default();
        assert!(options.get("undefinedOption").is_none());
        assert_eq!(options.get("keepAliveDelay"), Some(json!(1000)));
        assert_eq!(options.get("eventFilter"), Some(Value::Null));
    }

    #[test]
    fn test_set_unknown_option_does_not_mutate() {
        let mut options = SessionOptions::default();
        let before = options.clone();
        let err = options.set("undefinedOption", json!(true)).unwrap_err();
        assert_eq!(err, OptionError::Unknown("undefinedOption".to_string()));
        assert_eq!(options, before);
    }

    #[test]
    fn test_set_invalid_value_does_not_mutate() {
        let mut options = SessionOptions::default();
        let before = options.clone();
        let err = options.set("keepAlive", json!("yes")).unwrap_err();
        assert!(matches!(err, OptionError::InvalidValue { ref name, .. } if name == "keepAlive"));
        assert_eq!(options, before);
    }

    #[test]
    fn test_set_filter_from_list() {
        let mut options = SessionOptions::default();
        options
            .set("eventFilter", json!(["Dial", "dial", "Hangup", "", null, 0]))
            .unwrap();
        let filter = options.event_filter.clone().unwrap();
        assert_eq!(
            filter.into_iter().collect::<Vec<_>>(),
            vec!["dial".to_string(), "hangup".to_string()]
        );
        assert!(options.is_event_filtered("DIAL"));
        assert!(!options.is_event_filtered("Newchannel"));
    }

    #[test]
    fn test_set_filter_from_map() {
        let mut options = SessionOptions::default();
        options
            .set("eventFilter", json!({"Dial": 1, "Hangup": true}))
            .unwrap();
        assert!(options.is_event_filtered("dial"));
        assert!(options.is_event_filtered("hangup"));
    }

    #[test]
    fn test_canonical_filter_is_stable() {
        let mut options = SessionOptions::default();
        options.set("eventFilter", json!(["Dial"])).unwrap();
        let canonical = options.get("eventFilter").unwrap();
        options.set("eventFilter", canonical.clone()).unwrap();
        assert_eq!(options.get("eventFilter").unwrap(), canonical);
    }

    #[test]
    fn test_disable_filter() {
        let mut options = SessionOptions::default();
        options.set("eventFilter", json!(["Dial"])).unwrap();
        options.set("eventFilter", Value::Null).unwrap();
        assert!(options.event_filter.is_none());
        assert!(!options.is_event_filtered("Dial"));
    }

    #[test]
    fn test_unbounded_attempts() {
        let mut options = SessionOptions::default();
        options.set("maxAttemptsCount", Value::Null).unwrap();
        assert_eq!(options.max_attempts_count, None);
    }

    #[test]
    fn test_merge_reports_rejected_keys() {
        let mut options = SessionOptions::default();
        let partial = json!({
            "reconnect": true,
            "keepAliveDelay": 100,
            "undefinedOption": 1,
            "addTime": "sometimes"
        });
        let mut rejected = options.merge(partial.as_object().unwrap());
        rejected.sort();

        assert_eq!(rejected, vec!["addTime".to_string(), "undefinedOption".to_string()]);
        assert!(options.reconnect);
        assert!(!options.add_time);
        assert_eq!(options.keep_alive_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_from_value_rejects_unknown_keys() {
        assert!(SessionOptions::from_value(json!({"reconnect": true})).is_ok());
        assert!(SessionOptions::from_value(json!({"bogus": true})).is_err());
    }

    #[test]
    fn test_round_trip_through_json() {
        let options = SessionOptions::from_value(json!({
            "eventFilter": {"Dial": true},
            "maxAttemptsCount": null,
            "attemptsDelay": 250
        }))
        .unwrap();
        let json = options.to_value();
        assert_eq!(json["eventFilter"], json!(["dial"]));
        assert_eq!(json["maxAttemptsCount"], Value::Null);
        assert_eq!(json["attemptsDelay"], json!(250));
        assert_eq!(SessionOptions::from_value(json).unwrap(), options);
    }
}
