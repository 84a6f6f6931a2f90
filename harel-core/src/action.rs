//! Compiled actions.
//!
//! Definition actions are either a bare name (resolved through the
//! implementations map at execution time) or an object with a `type`
//! field selecting a built-in:
//!
//! - `assign` with a `set` map of dotted paths to values, or an
//!   `updater` naming a registered assign function
//! - `raise` / `send` with an event template, optional delay and id
//! - `cancel` with the `sendId` of a pending delayed send
//! - `spawn` / `stop` managing child actors
//! - `log` with an optional message value and label
//!
//! Any other `type` compiles to a custom action carrying its remaining
//! fields as evaluated params.

use crate::definition::ActionDef;
use crate::error::CoreError;
use crate::event::Event;
use crate::value::DynValue;
use serde_json::Value;

/// A delay: fixed milliseconds or a named delay resolved through the
/// implementations map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delay {
    Ms(u64),
    Named(String),
}

impl Delay {
    /// Compiles a delay from a definition value (number or string).
    pub fn compile(raw: &Value) -> Result<Self, CoreError> {
        match raw {
            Value::Number(n) => n.as_u64().map(Delay::Ms).ok_or_else(|| {
                CoreError::InvalidDefinition {
                    reason: format!("delay must be a non-negative integer, got {n}"),
                }
            }),
            Value::String(name) => Ok(Delay::parse_key(name)),
            other => Err(CoreError::InvalidDefinition {
                reason: format!("delay must be a number or string, got {other}"),
            }),
        }
    }

    /// Parses an `after` map key: all-digit keys are milliseconds,
    /// anything else is a named delay.
    pub fn parse_key(key: &str) -> Self {
        if !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit()) {
            match key.parse::<u64>() {
                Ok(ms) => Delay::Ms(ms),
                Err(_) => Delay::Named(key.to_string()),
            }
        } else {
            Delay::Named(key.to_string())
        }
    }

    /// The stable key used in `after.<delay>.<id>` event types and for
    /// timer cancellation.
    pub fn key(&self) -> String {
        match self {
            Delay::Ms(ms) => ms.to_string(),
            Delay::Named(name) => name.clone(),
        }
    }
}

/// An event built at execution time from literal and computed fields.
#[derive(Debug, Clone)]
pub struct EventTemplate {
    pub event_type: String,
    pub payload: Vec<(String, DynValue)>,
}

impl EventTemplate {
    /// Compiles an event template from a definition value: a bare type
    /// string or an object with a `type` field plus payload fields.
    pub fn compile(raw: &Value) -> Result<Self, CoreError> {
        match raw {
            Value::String(event_type) => Ok(EventTemplate {
                event_type: event_type.clone(),
                payload: Vec::new(),
            }),
            Value::Object(map) => {
                let event_type = map
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::InvalidDefinition {
                        reason: "event object requires a string 'type' field".to_string(),
                    })?
                    .to_string();
                let mut payload = Vec::new();
                for (key, value) in map {
                    if key == "type" {
                        continue;
                    }
                    payload.push((key.clone(), DynValue::compile(value)?));
                }
                Ok(EventTemplate { event_type, payload })
            }
            other => Err(CoreError::InvalidDefinition {
                reason: format!("event must be a string or object, got {other}"),
            }),
        }
    }

    /// Builds the concrete event against the current context and the
    /// event being processed.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> Event {
        let mut built = Event::new(self.event_type.as_str());
        for (key, value) in &self.payload {
            built
                .payload
                .insert(key.clone(), value.evaluate(ctx, event));
        }
        built
    }
}

/// Where a `send` delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDest {
    SelfActor,
    Parent,
    Child(String),
}

/// How an `assign` computes the next context.
#[derive(Debug, Clone)]
pub enum AssignSpec {
    /// Dotted-path/value pairs. All values evaluate against the context
    /// as it was before this assign; writes land together.
    Set(Vec<(String, DynValue)>),
    /// A registered updater function, called with context and event.
    Updater(String),
}

/// A compiled action, executed by the macrostep engine.
#[derive(Debug, Clone)]
pub enum Action {
    Assign(AssignSpec),
    Raise {
        event: EventTemplate,
        delay: Option<Delay>,
        id: Option<String>,
    },
    Send {
        to: SendDest,
        event: EventTemplate,
        delay: Option<Delay>,
        id: Option<String>,
    },
    Cancel {
        send_id: String,
    },
    Spawn {
        src: String,
        id: Option<String>,
        input: Option<DynValue>,
    },
    Stop {
        child: String,
    },
    Log {
        label: Option<String>,
        message: Option<DynValue>,
    },
    Custom {
        name: String,
        params: Option<DynValue>,
    },
}

impl Action {
    /// Compiles one definition action.
    pub fn compile(def: &ActionDef) -> Result<Self, CoreError> {
        match def {
            ActionDef::Name(name) => Ok(Action::Custom {
                name: name.clone(),
                params: None,
            }),
            ActionDef::Object(map) => {
                let kind = map
                    .get("type")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CoreError::InvalidDefinition {
                        reason: "action object requires a string 'type' field".to_string(),
                    })?;
                match kind {
                    "assign" => Self::compile_assign(map),
                    "raise" => Ok(Action::Raise {
                        event: Self::required_event(map, "raise")?,
                        delay: Self::optional_delay(map)?,
                        id: Self::optional_str(map, "id"),
                    }),
                    "send" => Ok(Action::Send {
                        to: match map.get("to").and_then(Value::as_str) {
                            None => SendDest::SelfActor,
                            Some("parent") => SendDest::Parent,
                            Some(child) => SendDest::Child(child.to_string()),
                        },
                        event: Self::required_event(map, "send")?,
                        delay: Self::optional_delay(map)?,
                        id: Self::optional_str(map, "id"),
                    }),
                    "cancel" => Ok(Action::Cancel {
                        send_id: Self::required_str(map, "sendId", "cancel")?,
                    }),
                    "spawn" => Ok(Action::Spawn {
                        src: Self::required_str(map, "src", "spawn")?,
                        id: Self::optional_str(map, "id"),
                        input: map
                            .get("input")
                            .map(DynValue::compile)
                            .transpose()?,
                    }),
                    "stop" => Ok(Action::Stop {
                        child: Self::required_str(map, "child", "stop")?,
                    }),
                    "log" => Ok(Action::Log {
                        label: Self::optional_str(map, "label"),
                        message: map
                            .get("message")
                            .map(DynValue::compile)
                            .transpose()?,
                    }),
                    name => {
                        let mut rest = map.clone();
                        rest.remove("type");
                        let params = if rest.is_empty() {
                            None
                        } else {
                            Some(DynValue::compile(&Value::Object(rest))?)
                        };
                        Ok(Action::Custom {
                            name: name.to_string(),
                            params,
                        })
                    }
                }
            }
        }
    }

    /// Compiles a whole action list.
    pub fn compile_list(defs: &[ActionDef]) -> Result<Vec<Self>, CoreError> {
        defs.iter().map(Self::compile).collect()
    }

    /// A short name for error reporting.
    pub fn name(&self) -> &str {
        match self {
            Action::Assign(_) => "assign",
            Action::Raise { .. } => "raise",
            Action::Send { .. } => "send",
            Action::Cancel { .. } => "cancel",
            Action::Spawn { .. } => "spawn",
            Action::Stop { .. } => "stop",
            Action::Log { .. } => "log",
            Action::Custom { name, .. } => name,
        }
    }

    fn compile_assign(map: &serde_json::Map<String, Value>) -> Result<Action, CoreError> {
        let set = map.get("set");
        let updater = map.get("updater").and_then(Value::as_str);
        match (set, updater) {
            (Some(Value::Object(fields)), None) => {
                let mut entries = Vec::with_capacity(fields.len());
                for (path, raw) in fields {
                    entries.push((path.clone(), DynValue::compile(raw)?));
                }
                Ok(Action::Assign(AssignSpec::Set(entries)))
            }
            (Some(_), None) => Err(CoreError::InvalidDefinition {
                reason: "assign 'set' must be an object of path/value pairs".to_string(),
            }),
            (None, Some(name)) => Ok(Action::Assign(AssignSpec::Updater(name.to_string()))),
            (Some(_), Some(_)) => Err(CoreError::InvalidDefinition {
                reason: "assign takes either 'set' or 'updater', not both".to_string(),
            }),
            (None, None) => Err(CoreError::InvalidDefinition {
                reason: "assign requires a 'set' map or an 'updater' name".to_string(),
            }),
        }
    }

    fn required_event(
        map: &serde_json::Map<String, Value>,
        action: &str,
    ) -> Result<EventTemplate, CoreError> {
        let raw = map.get("event").ok_or_else(|| CoreError::InvalidDefinition {
            reason: format!("{action} requires an 'event' field"),
        })?;
        EventTemplate::compile(raw)
    }

    fn optional_delay(map: &serde_json::Map<String, Value>) -> Result<Option<Delay>, CoreError> {
        map.get("delay").map(Delay::compile).transpose()
    }

    fn required_str(
        map: &serde_json::Map<String, Value>,
        key: &str,
        action: &str,
    ) -> Result<String, CoreError> {
        map.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| CoreError::InvalidDefinition {
                reason: format!("{action} requires a string '{key}' field"),
            })
    }

    fn optional_str(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
        map.get(key).and_then(Value::as_str).map(str::to_string)
    }
}
