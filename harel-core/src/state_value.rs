//! Hierarchical state values.
//!
//! A state value is the JSON-friendly shape of a configuration: a bare
//! string for an atomic state (`"green"`), nested objects for compound
//! states (`{"work": "drafting"}`), and one key per region for parallel
//! states (`{"bold": "on", "italics": "off"}`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The position of a machine within its state tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// An atomic leaf, named by its state key.
    Leaf(String),
    /// A compound or parallel interior node: child key to child value.
    Compound(BTreeMap<String, StateValue>),
}

impl StateValue {
    /// Builds a leaf value.
    pub fn leaf(key: impl Into<String>) -> Self {
        StateValue::Leaf(key.into())
    }

    /// Builds a single-child compound value.
    pub fn nested(key: impl Into<String>, child: StateValue) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.into(), child);
        StateValue::Compound(map)
    }

    /// Tests whether this value matches a (possibly partial) descriptor.
    ///
    /// A leaf descriptor matches when it names this leaf or any
    /// top-level key of this value, so `matches(&"work".into())` holds
    /// while the machine is anywhere inside `work`. A compound
    /// descriptor may name a subset of parallel regions; each named
    /// region must match recursively.
    pub fn matches(&self, descriptor: &StateValue) -> bool {
        match (self, descriptor) {
            (StateValue::Leaf(a), StateValue::Leaf(b)) => a == b,
            (StateValue::Compound(map), StateValue::Leaf(key)) => map.contains_key(key),
            (StateValue::Leaf(_), StateValue::Compound(_)) => false,
            (StateValue::Compound(full), StateValue::Compound(partial)) => {
                partial.iter().all(|(key, sub)| {
                    full.get(key).map_or(false, |child| child.matches(sub))
                })
            }
        }
    }

    /// The set of dot-joined paths to the active leaves, in key order.
    pub fn leaf_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths(String::new(), &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: String, out: &mut Vec<String>) {
        match self {
            StateValue::Leaf(key) => {
                if prefix.is_empty() {
                    out.push(key.clone());
                } else {
                    out.push(format!("{prefix}.{key}"));
                }
            }
            StateValue::Compound(map) => {
                for (key, child) in map {
                    let next = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    child.collect_paths(next, out);
                }
            }
        }
    }
}

impl From<&str> for StateValue {
    fn from(key: &str) -> Self {
        StateValue::Leaf(key.to_string())
    }
}

impl From<String> for StateValue {
    fn from(key: String) -> Self {
        StateValue::Leaf(key)
    }
}
