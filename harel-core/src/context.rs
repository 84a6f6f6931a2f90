//! Initial context resolution.
//!
//! A definition's `context` block mixes literal fields with computed
//! `{"$expr": ...}` entries. Computed entries may read other context
//! fields (`ctx.*`) and the start input (`event.input`). Fields resolve
//! in dependency order regardless of declaration order; a dependency
//! cycle is a definition error.

use crate::error::CoreError;
use crate::event::Event;
use crate::value::DynValue;
use serde_json::{Map, Value};

/// Resolves the initial context of a machine.
///
/// `def` is the raw `context` block, `input` the value passed when the
/// machine starts. Returns an empty object when no context is declared.
pub fn resolve_initial_context(
    def: Option<&Value>,
    input: Option<&Value>,
) -> Result<Value, CoreError> {
    let Some(def) = def else {
        return Ok(Value::Object(Map::new()));
    };
    let Value::Object(fields) = def else {
        return Err(CoreError::InvalidDefinition {
            reason: "context must be an object".to_string(),
        });
    };

    let mut entries: Vec<ContextEntry> = Vec::with_capacity(fields.len());
    for (key, raw) in fields {
        let value = DynValue::compile(raw)?;
        let mut deps = Vec::new();
        value.ctx_dependencies(&mut deps);
        entries.push(ContextEntry {
            key: key.clone(),
            value,
            deps,
        });
    }

    let event = Event::init(input.cloned());
    let mut resolved = Map::new();
    let mut visiting = Vec::new();
    for index in 0..entries.len() {
        resolve_field(index, &entries, &mut resolved, &mut visiting, &event)?;
    }

    // Restore declaration order; resolution order depends on the
    // dependency graph.
    let mut ordered = Map::new();
    for entry in &entries {
        if let Some(value) = resolved.remove(&entry.key) {
            ordered.insert(entry.key.clone(), value);
        }
    }
    Ok(Value::Object(ordered))
}

struct ContextEntry {
    key: String,
    value: DynValue,
    deps: Vec<String>,
}

fn resolve_field(
    index: usize,
    entries: &[ContextEntry],
    resolved: &mut Map<String, Value>,
    visiting: &mut Vec<String>,
    event: &Event,
) -> Result<(), CoreError> {
    let entry = &entries[index];
    if resolved.contains_key(&entry.key) {
        return Ok(());
    }
    if visiting.iter().any(|key| *key == entry.key) {
        return Err(CoreError::ContextCycle {
            field: entry.key.clone(),
        });
    }

    visiting.push(entry.key.clone());
    for dep in &entry.deps {
        // References to fields outside the context block evaluate to
        // null; only declared fields are ordering constraints.
        if let Some(pos) = entries.iter().position(|e| e.key == *dep) {
            resolve_field(pos, entries, resolved, visiting, event)?;
        }
    }
    let value = entry.value.evaluate(&Value::Object(resolved.clone()), event);
    resolved.insert(entry.key.clone(), value);
    visiting.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_context_block() {
        let ctx = resolve_initial_context(None, None).unwrap();
        assert_eq!(ctx, json!({}));
    }

    #[test]
    fn test_literal_fields() {
        let def = json!({"count": 0, "name": "light", "tags": ["a", "b"]});
        let ctx = resolve_initial_context(Some(&def), None).unwrap();
        assert_eq!(ctx, def);
    }

    #[test]
    fn test_computed_field_reads_literal() {
        let def = json!({
            "total": {"$expr": "ctx.base + 5"},
            "base": 10
        });
        let ctx = resolve_initial_context(Some(&def), None).unwrap();
        assert_eq!(ctx["total"], json!(15));
        assert_eq!(ctx["base"], json!(10));
    }

    #[test]
    fn test_dependency_chain() {
        let def = json!({
            "c": {"$expr": "ctx.b * 2"},
            "b": {"$expr": "ctx.a + 1"},
            "a": 1
        });
        let ctx = resolve_initial_context(Some(&def), None).unwrap();
        assert_eq!(ctx["a"], json!(1));
        assert_eq!(ctx["b"], json!(2));
        assert_eq!(ctx["c"], json!(4));
    }

    #[test]
    fn test_declaration_order_preserved_in_output() {
        let def = json!({
            "z": {"$expr": "ctx.a"},
            "a": 1
        });
        let ctx = resolve_initial_context(Some(&def), None).unwrap();
        let keys: Vec<&String> = ctx.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_input_visible_as_event_input() {
        let def = json!({
            "user": {"$expr": "event.input.name"},
            "retries": {"$expr": "event.input.retries"}
        });
        let input = json!({"name": "ada", "retries": 3});
        let ctx = resolve_initial_context(Some(&def), Some(&input)).unwrap();
        assert_eq!(ctx["user"], json!("ada"));
        assert_eq!(ctx["retries"], json!(3));
    }

    #[test]
    fn test_missing_input_is_null() {
        let def = json!({"user": {"$expr": "event.input.name"}});
        let ctx = resolve_initial_context(Some(&def), None).unwrap();
        assert_eq!(ctx["user"], Value::Null);
    }

    #[test]
    fn test_cycle_detected() {
        let def = json!({
            "a": {"$expr": "ctx.b"},
            "b": {"$expr": "ctx.a"}
        });
        let err = resolve_initial_context(Some(&def), None).unwrap_err();
        assert!(matches!(err, CoreError::ContextCycle { .. }));
    }

    #[test]
    fn test_self_cycle_detected() {
        let def = json!({"a": {"$expr": "ctx.a + 1"}});
        let err = resolve_initial_context(Some(&def), None).unwrap_err();
        assert!(matches!(err, CoreError::ContextCycle { field } if field == "a"));
    }

    #[test]
    fn test_non_object_context_rejected() {
        let def = json!([1, 2, 3]);
        let err = resolve_initial_context(Some(&def), None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidDefinition { .. }));
    }

    #[test]
    fn test_reference_to_undeclared_field_is_null() {
        let def = json!({"a": {"$expr": "ctx.nope"}});
        let ctx = resolve_initial_context(Some(&def), None).unwrap();
        assert_eq!(ctx["a"], Value::Null);
    }

    #[test]
    fn test_nested_computed_values() {
        let def = json!({
            "limits": {"max": {"$expr": "ctx.base * 10"}, "min": 0},
            "base": 2
        });
        let ctx = resolve_initial_context(Some(&def), None).unwrap();
        assert_eq!(ctx["limits"], json!({"max": 20, "min": 0}));
    }
}
