//! Event values and descriptor matching.
//!
//! An event is a `type` string plus an arbitrary JSON payload. A handful of
//! type namespaces are reserved for events the interpreter raises itself:
//!
//! - `done.state.<id>` - a compound/parallel state reached a final child
//! - `done.invoke.<id>` - an invoked/spawned child completed with output
//! - `error.platform.<id>` - a child failed, or a runtime error surfaced
//! - `after.<delay>.<id>` - a delayed transition timer fired
//! - `init` - the synthetic event used while entering the initial state
//!
//! Transition event descriptors match exactly, or via `*` (any event), or
//! via a trailing `.*` segment (`error.*` matches `error.platform.x`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An immutable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Remaining payload fields.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// Creates an event with no payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: Map::new(),
        }
    }

    /// Creates an event with a payload.
    ///
    /// An object payload is flattened into the event's fields; any other
    /// value lands under a `data` field.
    pub fn with_payload(event_type: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// The synthetic initialization event, carrying the spawn input.
    pub fn init(input: Option<Value>) -> Self {
        let mut map = Map::new();
        if let Some(input) = input {
            map.insert("input".to_string(), input);
        }
        Self {
            event_type: "init".to_string(),
            payload: map,
        }
    }

    /// `done.state.<id>` with an optional output value.
    pub fn done_state(state_id: &str, output: Option<Value>) -> Self {
        let mut map = Map::new();
        if let Some(output) = output {
            map.insert("output".to_string(), output);
        }
        Self {
            event_type: format!("done.state.{}", state_id),
            payload: map,
        }
    }

    /// `done.invoke.<id>` with an optional output value.
    pub fn done_invoke(child_id: &str, output: Option<Value>) -> Self {
        let mut map = Map::new();
        if let Some(output) = output {
            map.insert("output".to_string(), output);
        }
        Self {
            event_type: format!("done.invoke.{}", child_id),
            payload: map,
        }
    }

    /// `error.platform.<id>` carrying the error value.
    pub fn error_platform(child_id: &str, error: Value) -> Self {
        let mut map = Map::new();
        map.insert("error".to_string(), error);
        Self {
            event_type: format!("error.platform.{}", child_id),
            payload: map,
        }
    }

    /// The synthetic event type for an `after` delay on a state.
    pub fn after_type(delay_key: &str, state_id: &str) -> String {
        format!("after.{}.{}", delay_key, state_id)
    }

    /// Looks up a payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Returns the event as a JSON object (`type` + payload fields).
    pub fn to_value(&self) -> Value {
        let mut map = self.payload.clone();
        map.insert(
            "type".to_string(),
            Value::String(self.event_type.clone()),
        );
        Value::Object(map)
    }

    /// Returns true for interpreter-raised event types.
    pub fn is_internal(&self) -> bool {
        self.event_type.starts_with("done.")
            || self.event_type.starts_with("error.platform.")
            || self.event_type.starts_with("after.")
            || self.event_type == "init"
    }
}

/// Returns true if an event descriptor matches an event type.
///
/// `*` matches everything. A descriptor ending in `.*` matches any type
/// that extends the prefix by at least one dotted segment.
pub fn descriptor_matches(descriptor: &str, event_type: &str) -> bool {
    if descriptor == "*" {
        return true;
    }
    if let Some(prefix) = descriptor.strip_suffix(".*") {
        return event_type.len() > prefix.len() + 1
            && event_type.starts_with(prefix)
            && event_type.as_bytes()[prefix.len()] == b'.';
    }
    descriptor == event_type
}
