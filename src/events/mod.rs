//! Structured domain events
//!
//! Events are flat JSON objects tagged with an `event_type`. A
//! `MessageRegistry` turns a type into a human-readable message (or splits an
//! oversized event into several), and an `EventSink` delivers the result.

pub mod registry;
pub mod sink;
pub mod split;

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub use registry::{render_template, MessageFormat, MessageRegistry, Splitter};
pub use sink::{EventSink, FormattingSink, MemorySink, TracingSink};
pub use split::{halve, split, split_execute_convergence};

/// Serialized size above which events are split
pub const DEFAULT_MAX_EVENT_LENGTH: usize = 50_000;

pub const EVENT_TYPE: &str = "event_type";
pub const MESSAGE: &str = "message";
pub const MSG_TYPE: &str = "msg_type";
pub const SPLIT_MESSAGE: &str = "split_message";
pub const IS_ERROR: &str = "is_error";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("No message registered for event type '{0}'")]
    MsgTypeNotFound(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Event {
    fields: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: &str) -> Self {
        let mut fields = Map::new();
        fields.insert(EVENT_TYPE.to_string(), Value::String(event_type.to_string()));
        Self { fields }
    }

    /// Attach a field. Values that fail to serialize are recorded as null.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Mark the event as reporting a failure
    pub fn with_error(self, error: &dyn fmt::Display) -> Self {
        self.with(IS_ERROR, true).with("error", error.to_string())
    }

    pub fn event_type(&self) -> Option<&str> {
        self.fields.get(EVENT_TYPE).and_then(Value::as_str)
    }

    pub fn message(&self) -> Option<&str> {
        self.fields.get(MESSAGE).and_then(Value::as_str)
    }

    pub fn is_error(&self) -> bool {
        self.fields
            .get(IS_ERROR)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Copy of this event without the given fields
    pub fn without(&self, keys: &[&str]) -> Event {
        let fields = self
            .fields
            .iter()
            .filter(|(key, _)| !keys.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Event { fields }
    }

    /// Length of the compact JSON rendering
    pub fn serialized_len(&self) -> usize {
        serde_json::to_string(&self.fields)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl From<Map<String, Value>> for Event {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(&self.fields) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("{}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_fields() {
        let event = Event::new("mark-dirty-success")
            .with("scaling_group_id", "g1")
            .with("tenant_id", "t1");
        assert_eq!(event.event_type(), Some("mark-dirty-success"));
        assert_eq!(event.get("scaling_group_id"), Some(&json!("g1")));
        assert!(!event.is_error());
    }

    #[test]
    fn test_error_event() {
        let event = Event::new("mark-dirty-failure").with_error(&"session expired");
        assert!(event.is_error());
        assert_eq!(event.get("error"), Some(&json!("session expired")));
    }

    #[test]
    fn test_without() {
        let event = Event::new("x").with("a", 1).with("b", 2);
        let trimmed = event.without(&["a"]);
        assert!(trimmed.get("a").is_none());
        assert_eq!(trimmed.get("b"), Some(&json!(2)));
        assert_eq!(event.get("a"), Some(&json!(1)));
    }
}
