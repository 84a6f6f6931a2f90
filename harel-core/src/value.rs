//! Dynamic values.
//!
//! Definition fields that produce a value at runtime (assign entries, event
//! payloads for raise/send, invoke inputs, final-state outputs, log
//! messages) accept either a plain JSON literal or `{"$expr": "..."}`,
//! evaluated against the current context and event. Objects and arrays are
//! compiled recursively, so expressions can appear at any depth:
//!
//! ```json
//! {"type": "raise", "event": {"type": "PRICED", "total": {"$expr": "ctx.net * 2"}}}
//! ```

use crate::error::CoreError;
use crate::event::Event;
use crate::expr::Expr;
use serde_json::Value;

/// A compiled dynamic value.
#[derive(Debug, Clone)]
pub enum DynValue {
    /// A literal value, returned as-is.
    Literal(Value),
    /// An expression evaluated per use.
    Expr(Expr),
    /// An object with dynamic entries.
    Object(Vec<(String, DynValue)>),
    /// An array with dynamic elements.
    Array(Vec<DynValue>),
}

impl DynValue {
    /// Compiles a raw definition value.
    pub fn compile(raw: &Value) -> Result<Self, CoreError> {
        match raw {
            Value::Object(map) => {
                if let Some(source) = map.get("$expr") {
                    if map.len() != 1 {
                        return Err(CoreError::InvalidDefinition {
                            reason: "'$expr' object must have no other keys".to_string(),
                        });
                    }
                    match source {
                        Value::String(source) => return Ok(DynValue::Expr(Expr::parse(source)?)),
                        _ => {
                            return Err(CoreError::InvalidDefinition {
                                reason: "'$expr' must be a string".to_string(),
                            })
                        }
                    }
                }
                let mut entries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    entries.push((key.clone(), DynValue::compile(value)?));
                }
                Ok(DynValue::Object(entries))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(DynValue::compile(item)?);
                }
                Ok(DynValue::Array(out))
            }
            other => Ok(DynValue::Literal(other.clone())),
        }
    }

    /// Evaluates the dynamic value against a context and event.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> Value {
        match self {
            DynValue::Literal(value) => value.clone(),
            DynValue::Expr(expr) => expr.evaluate(ctx, event),
            DynValue::Object(entries) => {
                let mut map = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    map.insert(key.clone(), value.evaluate(ctx, event));
                }
                Value::Object(map)
            }
            DynValue::Array(items) => {
                Value::Array(items.iter().map(|item| item.evaluate(ctx, event)).collect())
            }
        }
    }

    /// Collects the top-level context fields this value reads.
    pub fn ctx_dependencies(&self, out: &mut Vec<String>) {
        match self {
            DynValue::Literal(_) => {}
            DynValue::Expr(expr) => expr.ctx_dependencies(out),
            DynValue::Object(entries) => {
                for (_, value) in entries {
                    value.ctx_dependencies(out);
                }
            }
            DynValue::Array(items) => {
                for item in items {
                    item.ctx_dependencies(out);
                }
            }
        }
    }
}

/// Writes a value at a dotted path, creating intermediate objects.
///
/// A non-object intermediate value is replaced by an object; assigning
/// through `a.b` when `a` is a number overwrites `a`.
pub(crate) fn set_field(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let mut parts = path.split('.').peekable();

    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = match current.as_object_mut() {
            Some(map) => map,
            None => return,
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}
