// Event type -> message registry
//
// Built once at startup and shared by reference with the sinks that need it.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

use super::split::split_execute_convergence;
use super::{Event, EventError, MESSAGE, MSG_TYPE, SPLIT_MESSAGE};

/// Turns one event into several `(event, message template)` pairs
pub type Splitter = fn(Event, usize) -> Vec<(Event, String)>;

#[derive(Clone)]
pub enum MessageFormat {
    Template(String),
    Splitter(Splitter),
}

impl fmt::Debug for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageFormat::Template(template) => f.debug_tuple("Template").field(template).finish(),
            MessageFormat::Splitter(_) => f.write_str("Splitter"),
        }
    }
}

const STANDARD_TEMPLATES: &[(&str, &str)] = &[
    ("converge-all-groups", "Attempting to converge all dirty groups"),
    ("converge-all-groups-error", "Error while converging all groups"),
    (
        "converge-divergent-flag-disappeared",
        "Divergent flag {path} disappeared when trying to start convergence. This should be harmless.",
    ),
    ("converge-fatal-error", "Fatal error while converging group {scaling_group_id}."),
    ("converge-lock-skipped", "Group {scaling_group_id} is being converged by another worker"),
    ("converge-non-fatal-error", "Non-fatal error while converging group {scaling_group_id}"),
    ("delete-server", "Deleting {server_id} server"),
    (
        "execute-convergence-results",
        "Got result of {worst_status} after executing convergence",
    ),
    ("launch-servers", "Launching {num_servers} servers"),
    ("mark-clean-failure", "Failed to mark group {scaling_group_id} clean"),
    (
        "mark-clean-not-found",
        "Dirty flag of group {scaling_group_id} not found when deleting",
    ),
    (
        "mark-clean-skipped",
        "Not marking group {scaling_group_id} clean because another convergence was requested.",
    ),
    ("mark-clean-success", "Marked group {scaling_group_id} clean"),
    ("mark-dirty-failure", "Failed to mark group {scaling_group_id} dirty"),
    ("mark-dirty-success", "Marked group {scaling_group_id} dirty"),
];

#[derive(Debug, Clone)]
pub struct MessageRegistry {
    formats: HashMap<String, MessageFormat>,
    max_event_length: usize,
}

impl MessageRegistry {
    /// An empty registry
    pub fn new(max_event_length: usize) -> Self {
        Self {
            formats: HashMap::new(),
            max_event_length,
        }
    }

    /// Registry with every event type this crate emits
    pub fn standard(max_event_length: usize) -> Self {
        let mut registry = Self::new(max_event_length);
        for (event_type, template) in STANDARD_TEMPLATES {
            registry.register_template(event_type, template);
        }
        registry.register_splitter("execute-convergence", split_execute_convergence);
        registry
    }

    pub fn register_template(&mut self, event_type: &str, template: &str) -> &mut Self {
        self.formats.insert(
            event_type.to_string(),
            MessageFormat::Template(template.to_string()),
        );
        self
    }

    pub fn register_splitter(&mut self, event_type: &str, splitter: Splitter) -> &mut Self {
        self.formats
            .insert(event_type.to_string(), MessageFormat::Splitter(splitter));
        self
    }

    pub fn max_event_length(&self) -> usize {
        self.max_event_length
    }

    pub fn lookup(&self, event_type: &str) -> Result<&MessageFormat, EventError> {
        self.formats
            .get(event_type)
            .ok_or_else(|| EventError::MsgTypeNotFound(event_type.to_string()))
    }

    /// Format `event` according to its registered type.
    ///
    /// Each resulting event carries the rendered `message` and its
    /// `msg_type`; when a splitter produced more than one event, each is also
    /// tagged `split_message = "i of n"`.
    pub fn validate(&self, event: Event) -> Result<Vec<Event>, EventError> {
        let event_type = event.event_type().unwrap_or_default().to_string();
        let parts = match self.lookup(&event_type)? {
            MessageFormat::Template(template) => vec![(event, template.clone())],
            MessageFormat::Splitter(splitter) => splitter(event, self.max_event_length),
        };

        let total = parts.len();
        Ok(parts
            .into_iter()
            .enumerate()
            .map(|(index, (mut event, template))| {
                let message = render_template(&template, &event);
                event.insert(MESSAGE, Value::String(message));
                event.insert(MSG_TYPE, Value::String(event_type.clone()));
                if total > 1 {
                    event.insert(
                        SPLIT_MESSAGE,
                        Value::String(format!("{} of {}", index + 1, total)),
                    );
                }
                event
            })
            .collect())
    }

    /// `validate`, falling back to the raw event for unknown types
    pub fn validated_or_raw(&self, event: Event) -> Vec<Event> {
        let raw = event.clone();
        match self.validate(event) {
            Ok(events) => events,
            Err(EventError::MsgTypeNotFound(_)) => vec![raw],
        }
    }
}

/// Substitute `{field}` placeholders from the event's fields.
///
/// Placeholders naming absent fields are left as written.
pub fn render_template(template: &str, event: &Event) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            rendered.push_str(&rest[open..]);
            return rendered;
        };
        let key = &after[..close];
        match event.get(key) {
            Some(Value::String(s)) => rendered.push_str(s),
            Some(other) => rendered.push_str(&other.to_string()),
            None => {
                rendered.push('{');
                rendered.push_str(key);
                rendered.push('}');
            }
        }
        rest = &after[close + 1..];
    }
    rendered.push_str(rest);
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_template() {
        let event = Event::new("launch-servers")
            .with("num_servers", 3)
            .with("scaling_group_id", "g1");
        assert_eq!(
            render_template("Launching {num_servers} servers for {scaling_group_id}", &event),
            "Launching 3 servers for g1"
        );
        assert_eq!(render_template("Missing {nope}", &event), "Missing {nope}");
        assert_eq!(render_template("Unclosed {brace", &event), "Unclosed {brace");
    }

    #[test]
    fn test_validate_template() {
        let registry = MessageRegistry::standard(1000);
        let events = registry
            .validate(Event::new("mark-dirty-success").with("scaling_group_id", "g1"))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message(), Some("Marked group g1 dirty"));
        assert_eq!(events[0].get(MSG_TYPE), Some(&json!("mark-dirty-success")));
        assert!(events[0].get(SPLIT_MESSAGE).is_none());
    }

    #[test]
    fn test_validate_unknown_type() {
        let registry = MessageRegistry::standard(1000);
        let event = Event::new("not-a-thing").with("x", 1);
        assert_eq!(
            registry.validate(event.clone()).unwrap_err(),
            EventError::MsgTypeNotFound("not-a-thing".to_string())
        );
        assert_eq!(registry.validated_or_raw(event.clone()), vec![event]);
    }

    #[test]
    fn test_validate_splitter_tags_parts() {
        let registry = MessageRegistry::standard(200);
        let servers: Vec<String> = (0..10).map(|i| format!("server-{i}-{}", "y".repeat(30))).collect();
        let event = Event::new("execute-convergence")
            .with("scaling_group_id", "g1")
            .with("servers", &servers);

        let events = registry.validate(event).unwrap();
        let total = events.len();
        assert!(total > 1);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.message(), Some("Executing convergence"));
            assert_eq!(event.get(MSG_TYPE), Some(&json!("execute-convergence")));
            assert_eq!(
                event.get(SPLIT_MESSAGE),
                Some(&json!(format!("{} of {}", i + 1, total)))
            );
        }
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = MessageRegistry::new(100);
        registry.register_template("hello", "Hello {name}");
        let events = registry
            .validate(Event::new("hello").with("name", "world"))
            .unwrap();
        assert_eq!(events[0].message(), Some("Hello world"));
    }
}
