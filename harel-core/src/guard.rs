//! Guard specifications.
//!
//! A transition guard is declared in the definition as either:
//!
//! - an inline expression string (`"ctx.count < 10"`) - anything starting
//!   with `ctx`, `event`, `!` or `(` parses as an expression
//! - a named reference (`"canRetry"`) resolved through the implementations
//!   map at evaluation time
//! - `{"$expr": "..."}` - explicit expression form
//! - `{"type": "and", "guards": [...]}` / `"or"` / `"not"` combinators
//! - `{"type": "someName"}` - explicit named reference
//!
//! Named guards resolve lazily: a missing implementation surfaces as an
//! error at the first transition attempt that needs it, not at machine
//! construction.

use crate::error::CoreError;
use crate::event::Event;
use crate::expr::Expr;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A named guard implementation.
pub type GuardFn = Arc<dyn Fn(&Value, &Event) -> bool + Send + Sync>;

/// A compiled guard specification.
#[derive(Debug, Clone)]
pub enum Guard {
    /// Inline expression.
    Expr(Expr),
    /// Reference to a named implementation.
    Named(String),
    /// All child guards must pass.
    And(Vec<Guard>),
    /// At least one child guard must pass.
    Or(Vec<Guard>),
    /// The child guard must fail.
    Not(Box<Guard>),
}

impl Guard {
    /// Compiles a guard from its raw definition value.
    pub fn compile(raw: &Value) -> Result<Self, CoreError> {
        match raw {
            Value::String(s) => {
                let s = s.trim();
                if looks_like_expr(s) {
                    Ok(Guard::Expr(Expr::parse(s)?))
                } else if s.is_empty() {
                    Err(CoreError::InvalidDefinition {
                        reason: "empty guard".to_string(),
                    })
                } else {
                    Ok(Guard::Named(s.to_string()))
                }
            }
            Value::Object(map) => {
                if let Some(Value::String(source)) = map.get("$expr") {
                    return Ok(Guard::Expr(Expr::parse(source)?));
                }
                let guard_type = match map.get("type") {
                    Some(Value::String(t)) => t.as_str(),
                    _ => {
                        return Err(CoreError::InvalidDefinition {
                            reason: "guard object requires a 'type' field".to_string(),
                        })
                    }
                };
                match guard_type {
                    "and" => Ok(Guard::And(Self::compile_list(map.get("guards"))?)),
                    "or" => Ok(Guard::Or(Self::compile_list(map.get("guards"))?)),
                    "not" => {
                        let inner = map.get("guard").ok_or_else(|| CoreError::InvalidDefinition {
                            reason: "'not' guard requires a 'guard' field".to_string(),
                        })?;
                        Ok(Guard::Not(Box::new(Self::compile(inner)?)))
                    }
                    name => Ok(Guard::Named(name.to_string())),
                }
            }
            _ => Err(CoreError::InvalidDefinition {
                reason: "guard must be a string or object".to_string(),
            }),
        }
    }

    fn compile_list(raw: Option<&Value>) -> Result<Vec<Guard>, CoreError> {
        let items = match raw {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(CoreError::InvalidDefinition {
                    reason: "combinator guard requires a 'guards' array".to_string(),
                })
            }
        };
        items.iter().map(Self::compile).collect()
    }

    /// Evaluates the guard. Named references resolve through `named`.
    pub fn evaluate(
        &self,
        ctx: &Value,
        event: &Event,
        named: &HashMap<String, GuardFn>,
    ) -> Result<bool, CoreError> {
        match self {
            Guard::Expr(expr) => Ok(expr.evaluate_bool(ctx, event)),
            Guard::Named(name) => {
                let guard = named.get(name).ok_or_else(|| CoreError::MissingGuard {
                    name: name.clone(),
                })?;
                Ok(guard(ctx, event))
            }
            Guard::And(guards) => {
                for guard in guards {
                    if !guard.evaluate(ctx, event, named)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Guard::Or(guards) => {
                for guard in guards {
                    if guard.evaluate(ctx, event, named)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Guard::Not(inner) => Ok(!inner.evaluate(ctx, event, named)?),
        }
    }
}

fn looks_like_expr(s: &str) -> bool {
    s == "ctx"
        || s == "event"
        || s.starts_with("ctx.")
        || s.starts_with("event.")
        || s.starts_with('!')
        || s.starts_with('(')
}

/// Evaluates an optional guard (absent = always passes).
pub fn evaluate_opt(
    guard: Option<&Guard>,
    ctx: &Value,
    event: &Event,
    named: &HashMap<String, GuardFn>,
) -> Result<bool, CoreError> {
    match guard {
        Some(guard) => guard.evaluate(ctx, event, named),
        None => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_named() -> HashMap<String, GuardFn> {
        HashMap::new()
    }

    #[test]
    fn test_inline_expression_guard() {
        let guard = Guard::compile(&json!("ctx.count < 10")).unwrap();
        assert!(guard
            .evaluate(&json!({"count": 5}), &Event::new("E"), &no_named())
            .unwrap());
        assert!(!guard
            .evaluate(&json!({"count": 10}), &Event::new("E"), &no_named())
            .unwrap());
    }

    #[test]
    fn test_negated_expression_guard() {
        let guard = Guard::compile(&json!("!ctx.locked")).unwrap();
        assert!(guard
            .evaluate(&json!({"locked": false}), &Event::new("E"), &no_named())
            .unwrap());
    }

    #[test]
    fn test_named_guard_resolution() {
        let guard = Guard::compile(&json!("isAdmin")).unwrap();
        assert!(matches!(guard, Guard::Named(ref name) if name == "isAdmin"));

        let mut named = no_named();
        named.insert(
            "isAdmin".to_string(),
            Arc::new(|ctx: &Value, _: &Event| ctx["role"] == json!("admin")) as GuardFn,
        );
        assert!(guard
            .evaluate(&json!({"role": "admin"}), &Event::new("E"), &named)
            .unwrap());
        assert!(!guard
            .evaluate(&json!({"role": "user"}), &Event::new("E"), &named)
            .unwrap());
    }

    #[test]
    fn test_missing_named_guard_errors_at_use() {
        let guard = Guard::compile(&json!("noSuchGuard")).unwrap();
        let result = guard.evaluate(&json!({}), &Event::new("E"), &no_named());
        assert!(matches!(result, Err(CoreError::MissingGuard { .. })));
    }

    #[test]
    fn test_and_combinator() {
        let guard = Guard::compile(&json!({
            "type": "and",
            "guards": ["ctx.a", "ctx.b > 1"]
        }))
        .unwrap();
        assert!(guard
            .evaluate(&json!({"a": true, "b": 2}), &Event::new("E"), &no_named())
            .unwrap());
        assert!(!guard
            .evaluate(&json!({"a": true, "b": 1}), &Event::new("E"), &no_named())
            .unwrap());
    }

    #[test]
    fn test_or_combinator() {
        let guard = Guard::compile(&json!({
            "type": "or",
            "guards": ["ctx.a", "ctx.b"]
        }))
        .unwrap();
        assert!(guard
            .evaluate(&json!({"a": false, "b": true}), &Event::new("E"), &no_named())
            .unwrap());
        assert!(!guard
            .evaluate(&json!({"a": false, "b": false}), &Event::new("E"), &no_named())
            .unwrap());
    }

    #[test]
    fn test_not_combinator() {
        let guard = Guard::compile(&json!({
            "type": "not",
            "guard": "ctx.closed"
        }))
        .unwrap();
        assert!(guard
            .evaluate(&json!({"closed": false}), &Event::new("E"), &no_named())
            .unwrap());
    }

    #[test]
    fn test_nested_combinators() {
        let guard = Guard::compile(&json!({
            "type": "and",
            "guards": [
                {"type": "or", "guards": ["ctx.a", "ctx.b"]},
                {"type": "not", "guard": "ctx.blocked"}
            ]
        }))
        .unwrap();
        let ctx = json!({"a": true, "b": false, "blocked": false});
        assert!(guard.evaluate(&ctx, &Event::new("E"), &no_named()).unwrap());
        let ctx = json!({"a": true, "b": false, "blocked": true});
        assert!(!guard.evaluate(&ctx, &Event::new("E"), &no_named()).unwrap());
    }

    #[test]
    fn test_explicit_expr_object() {
        let guard = Guard::compile(&json!({"$expr": "event.amount > 100"})).unwrap();
        let event = Event::with_payload("PAY", json!({"amount": 150}));
        assert!(guard.evaluate(&json!({}), &event, &no_named()).unwrap());
    }

    #[test]
    fn test_typed_named_guard() {
        let guard = Guard::compile(&json!({"type": "hasCredit"})).unwrap();
        assert!(matches!(guard, Guard::Named(ref name) if name == "hasCredit"));
    }

    #[test]
    fn test_evaluate_opt_none_passes() {
        assert!(evaluate_opt(None, &json!({}), &Event::new("E"), &no_named()).unwrap());
    }

    #[test]
    fn test_invalid_guard_shapes() {
        assert!(Guard::compile(&json!(42)).is_err());
        assert!(Guard::compile(&json!("")).is_err());
        assert!(Guard::compile(&json!({"type": "and"})).is_err());
        assert!(Guard::compile(&json!({"type": "not"})).is_err());
        assert!(Guard::compile(&json!({"guards": []})).is_err());
    }

    #[test]
    fn test_missing_guard_inside_combinator_propagates() {
        let guard = Guard::compile(&json!({
            "type": "and",
            "guards": ["ctx.ok", "unknownGuard"]
        }))
        .unwrap();
        let result = guard.evaluate(&json!({"ok": true}), &Event::new("E"), &no_named());
        assert!(matches!(result, Err(CoreError::MissingGuard { .. })));
    }
}
