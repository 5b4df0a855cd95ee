// Event sinks

use std::sync::{Arc, Mutex};
use tracing::{error, info};

use super::registry::MessageRegistry;
use super::{Event, MSG_TYPE, SPLIT_MESSAGE};

/// Destination for structured events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Emits events through `tracing`, keeping the full record as a JSON field
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let event_type = event.event_type().unwrap_or_default();
        let msg_type = event
            .get(MSG_TYPE)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let split_message = event
            .get(SPLIT_MESSAGE)
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let message = event.message().unwrap_or(event_type);

        if event.is_error() {
            error!(event_type, msg_type, split_message, fields = %event, "{message}");
        } else {
            info!(event_type, msg_type, split_message, fields = %event, "{message}");
        }
    }
}

/// Collects events in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Types of the collected events, in emission order
    pub fn event_types(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| e.event_type().map(str::to_string))
            .collect()
    }

    pub fn clear(&self) {
        match self.events.lock() {
            Ok(mut events) => events.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: Event) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

/// Formats events with a `MessageRegistry` before handing them downstream.
/// Events of unknown type pass through unformatted.
#[derive(Clone)]
pub struct FormattingSink {
    registry: Arc<MessageRegistry>,
    downstream: Arc<dyn EventSink>,
}

impl FormattingSink {
    pub fn new(registry: Arc<MessageRegistry>, downstream: Arc<dyn EventSink>) -> Self {
        Self {
            registry,
            downstream,
        }
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }
}

impl EventSink for FormattingSink {
    fn emit(&self, event: Event) {
        for validated in self.registry.validated_or_raw(event) {
            self.downstream.emit(validated);
        }
    }
}
