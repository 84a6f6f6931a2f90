//! Machine definition documents.
//!
//! Definitions use a JSON DSL (YAML parses to the same shape):
//!
//! ```json
//! {
//!   "id": "light",
//!   "initial": "green",
//!   "context": {"cycles": 0},
//!   "states": {
//!     "green":  {"on": {"TIMER": "yellow"}},
//!     "yellow": {"on": {"TIMER": "red"}},
//!     "red":    {"on": {"TIMER": "green"}, "after": {"30000": "green"}}
//!   }
//! }
//! ```
//!
//! Transitions accept a bare target string, a full object, or a list of
//! objects (tried in order, first passing guard wins). Entry/exit/actions
//! and invoke accept a single item or a list. The `states`, `on`, and
//! `after` mappings preserve document order; declaration order is
//! priority order.
//!
//! This module only parses; structural validation happens when the
//! definition is compiled into a [`crate::machine::Machine`].

use crate::error::CoreError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A full machine document: a root state plus the initial context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineDef {
    /// Initial context; entries may be `{"$expr": ...}` computed values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    /// The root state node.
    #[serde(flatten)]
    pub root: StateDef,
}

impl MachineDef {
    /// Parses a definition from a JSON value.
    pub fn from_json(json: &Value) -> Result<Self, CoreError> {
        Ok(serde_json::from_value(json.clone())?)
    }

    /// Parses a definition from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// One state node in the definition tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDef {
    /// Custom global id; defaults to the dot-joined path from the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Node type: atomic, compound, parallel, history, final.
    /// Defaults to compound when `states` is present, else atomic.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Initial child key (compound nodes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,

    /// Child states, in document order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub states: IndexMap<String, StateDef>,

    /// Event transitions, in document order.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub on: IndexMap<String, TransitionList>,

    /// Eventless transitions, evaluated after every microstep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always: Option<TransitionList>,

    /// Delayed transitions: key is a millisecond count or a named delay.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub after: IndexMap<String, TransitionList>,

    /// Actions run when the state is entered.
    #[serde(default, skip_serializing_if = "ActionList::is_empty")]
    pub entry: ActionList,

    /// Actions run when the state is exited.
    #[serde(default, skip_serializing_if = "ActionList::is_empty")]
    pub exit: ActionList,

    /// Actors started on entry and stopped on exit.
    #[serde(default, skip_serializing_if = "InvokeList::is_empty")]
    pub invoke: InvokeList,

    /// Transition taken when this compound/parallel state completes.
    #[serde(rename = "onDone", default, skip_serializing_if = "Option::is_none")]
    pub on_done: Option<TransitionList>,

    /// History resolution kind for history nodes: shallow (default) or deep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,

    /// Output mapping for final nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Free-form metadata, carried but not interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// One transition in the definition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDef {
    /// Target state reference(s); absent or null means a targetless
    /// (action-only) transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetDef>,

    /// Guard specification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Value>,

    /// Transition actions, in order.
    #[serde(default, skip_serializing_if = "ActionList::is_empty")]
    pub actions: ActionList,

    /// Internal transitions do not exit/re-enter their source.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub internal: bool,
}

impl TransitionDef {
    /// The normalized target list (empty for targetless transitions).
    pub fn targets(&self) -> Vec<String> {
        match &self.target {
            None => Vec::new(),
            Some(TargetDef::One(target)) => vec![target.clone()],
            Some(TargetDef::Many(targets)) => targets.clone(),
        }
    }
}

/// A target reference: one id or several (parallel region targets).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetDef {
    One(String),
    Many(Vec<String>),
}

/// One or more transitions for a single event descriptor.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "TransitionListRaw")]
pub struct TransitionList(pub Vec<TransitionDef>);

impl Serialize for TransitionList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransitionItem {
    Target(String),
    Def(TransitionDef),
}

impl From<TransitionItem> for TransitionDef {
    fn from(item: TransitionItem) -> Self {
        match item {
            TransitionItem::Target(target) => TransitionDef {
                target: Some(TargetDef::One(target)),
                ..TransitionDef::default()
            },
            TransitionItem::Def(def) => def,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TransitionListRaw {
    One(TransitionItem),
    Many(Vec<TransitionItem>),
}

impl From<TransitionListRaw> for TransitionList {
    fn from(raw: TransitionListRaw) -> Self {
        match raw {
            TransitionListRaw::One(item) => TransitionList(vec![item.into()]),
            TransitionListRaw::Many(items) => {
                TransitionList(items.into_iter().map(Into::into).collect())
            }
        }
    }
}

/// An action reference: a bare name or an object with a `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionDef {
    /// Named action resolved through the implementations map.
    Name(String),
    /// Built-in or parameterized action object.
    Object(serde_json::Map<String, Value>),
}

/// One or more actions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "ActionListRaw")]
pub struct ActionList(pub Vec<ActionDef>);

impl ActionList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ActionList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ActionListRaw {
    One(ActionDef),
    Many(Vec<ActionDef>),
}

impl From<ActionListRaw> for ActionList {
    fn from(raw: ActionListRaw) -> Self {
        match raw {
            ActionListRaw::One(action) => ActionList(vec![action]),
            ActionListRaw::Many(actions) => ActionList(actions),
        }
    }
}

/// An invoked actor declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeDef {
    /// Actor logic name, resolved through the runtime's logic registry.
    pub src: String,

    /// Child id; defaults to `src`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Input value passed to the child (may use `$expr`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    /// Transition on `done.invoke.<id>`.
    #[serde(rename = "onDone", default, skip_serializing_if = "Option::is_none")]
    pub on_done: Option<TransitionList>,

    /// Transition on `error.platform.<id>`.
    #[serde(rename = "onError", default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<TransitionList>,
}

impl InvokeDef {
    /// The effective child id.
    pub fn child_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.src)
    }
}

/// One or more invoke declarations.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "InvokeListRaw")]
pub struct InvokeList(pub Vec<InvokeDef>);

impl InvokeList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for InvokeList {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InvokeListRaw {
    One(InvokeDef),
    Many(Vec<InvokeDef>),
}

impl From<InvokeListRaw> for InvokeList {
    fn from(raw: InvokeListRaw) -> Self {
        match raw {
            InvokeListRaw::One(invoke) => InvokeList(vec![invoke]),
            InvokeListRaw::Many(invokes) => InvokeList(invokes),
        }
    }
}
