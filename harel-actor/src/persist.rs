//! Persisted snapshots.
//!
//! A [`PersistedSnapshot`] is the durable form of an actor: everything needed
//! to rebuild it later with [`ActorSystem::restore`](crate::ActorSystem::restore),
//! including history memory and the snapshots of its children. Unlike the live
//! [`Snapshot`](crate::Snapshot), it records the logic `src` so the restoring
//! system can look the behavior back up in its registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::ActorStatus;

/// Durable actor state, serializable as JSON.
///
/// Children are keyed by child actor id. `BTreeMap` keeps the serialized
/// order deterministic, so equal trees persist to byte-equal JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Registered logic name this actor was spawned from.
    pub src: String,

    /// Lifecycle status at persist time.
    pub status: ActorStatus,

    /// State value (for machine actors) or logic-defined value.
    pub value: Value,

    /// Extended state.
    pub context: Value,

    /// Completion output, when the actor was done.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure payload, when the actor was in the error status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,

    /// Recorded history per history state id, `null` when the logic keeps
    /// no history memory.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub history: Value,

    /// Persisted children, keyed by child id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, PersistedSnapshot>,
}
