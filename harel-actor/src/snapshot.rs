//! Actor snapshots.
//!
//! A [`Snapshot`] is the externally visible state of an actor at a point in
//! time: its state value, context, lifecycle status, and terminal payloads.
//! Snapshots are published to subscribers once per processed event, after the
//! macrostep has settled, so observers never see intermediate microsteps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use harel_core::StateValue;

/// Lifecycle status of an actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorStatus {
    /// Created but not yet started. Events are queued, not processed.
    NotStarted,
    /// Started and processing events.
    Active,
    /// Reached a top-level final state. Terminal.
    Done,
    /// Stopped explicitly or by a parent. Terminal.
    Stopped,
    /// An action, guard, or logic failure halted the actor. Terminal.
    Error,
}

impl ActorStatus {
    /// Terminal actors drop incoming events and never publish again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActorStatus::Done | ActorStatus::Stopped | ActorStatus::Error
        )
    }
}

/// Point-in-time view of an actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// State value for machine actors; logic-defined for other kinds
    /// (promises and callbacks report `null`).
    pub value: Value,

    /// Extended state. Machine actors expose their context object, reducer
    /// actors their accumulated state.
    pub context: Value,

    /// Lifecycle status.
    pub status: ActorStatus,

    /// Output produced on completion, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure payload when the status is `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    /// Ids of currently alive child actors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,
}

impl Snapshot {
    /// Snapshot of an actor that has not been started yet.
    pub fn not_started() -> Self {
        Self {
            value: Value::Null,
            context: Value::Null,
            status: ActorStatus::NotStarted,
            output: None,
            error: None,
            children: Vec::new(),
        }
    }

    /// Active snapshot with no state value, used by logics that have no
    /// machine-like configuration.
    pub fn active() -> Self {
        Self {
            value: Value::Null,
            context: Value::Null,
            status: ActorStatus::Active,
            output: None,
            error: None,
            children: Vec::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == ActorStatus::Done
    }

    /// Tests the state value against a descriptor, with the same partial
    /// matching rules as [`StateValue::matches`]. Snapshots whose value is
    /// not a state value (promises, callbacks) never match.
    pub fn matches(&self, descriptor: &StateValue) -> bool {
        match serde_json::from_value::<StateValue>(self.value.clone()) {
            Ok(value) => value.matches(descriptor),
            Err(_) => false,
        }
    }
}
