//! Inline expression evaluation.
//!
//! Expressions appear in guard strings, `{"$expr": ...}` dynamic values, and
//! computed context entries. They are parsed once at machine construction
//! and evaluated against the current context and event. The language
//! supports:
//!
//! - `ctx.field` - context field access (dotted paths allowed)
//! - `event.field` - event payload access; `event.type` is the event type
//! - `ctx` / `event` - the whole context / event object
//! - literals - numbers, `'single'` or `"double"` quoted strings,
//!   `true`, `false`, `null`
//! - `==`, `!=`, `>`, `>=`, `<`, `<=` - comparisons
//! - `+`, `-`, `*`, `/`, `%` - arithmetic (`+` also concatenates strings)
//! - `!expr` - logical NOT
//! - `expr && expr` - logical AND (higher precedence than OR)
//! - `expr || expr` - logical OR
//! - `(expr)` - grouping
//!
//! Examples:
//! - `ctx.count < 10` - guard on a context field
//! - `ctx.count + 1` - assign value
//! - `event.amount > ctx.limit && !ctx.locked` - compound guard
//! - `ctx.first + ' ' + ctx.last` - string concatenation
//!
//! Evaluation is total: missing fields read as `null`, numeric operators on
//! non-numbers produce `null`, comparisons on mismatched types are `false`.
//! Integer operands stay integers through `+`, `-`, `*` and `%` so that
//! counter-style context fields do not drift into floats.

use crate::error::CoreError;
use crate::event::Event;
use serde_json::Value;

/// Which root a path reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// The machine context.
    Ctx,
    /// The current event.
    Event,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Field access; an empty path is the scope root itself.
    Path(Scope, String),
    /// A literal value.
    Lit(Value),
    /// Comparison of two sub-expressions.
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// Arithmetic on two sub-expressions.
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    /// Logical AND (short-circuit, truthiness of both sides).
    And(Box<Expr>, Box<Expr>),
    /// Logical OR (short-circuit).
    Or(Box<Expr>, Box<Expr>),
    /// Logical NOT.
    Not(Box<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidExpr {
                reason: "empty expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos != parser.input.len() {
            return Err(CoreError::InvalidExpr {
                reason: format!("unexpected trailing input: '{}'", &parser.input[parser.pos..]),
            });
        }
        Ok(expr)
    }

    /// Evaluates the expression against a context and event.
    pub fn evaluate(&self, ctx: &Value, event: &Event) -> Value {
        match self {
            Expr::Path(Scope::Ctx, path) => {
                if path.is_empty() {
                    ctx.clone()
                } else {
                    get_field(ctx, path)
                }
            }
            Expr::Path(Scope::Event, path) => event_field(event, path),
            Expr::Lit(value) => value.clone(),
            Expr::Cmp(op, left, right) => {
                let left = left.evaluate(ctx, event);
                let right = right.evaluate(ctx, event);
                Value::Bool(compare(*op, &left, &right))
            }
            Expr::Arith(op, left, right) => {
                let left = left.evaluate(ctx, event);
                let right = right.evaluate(ctx, event);
                arith(*op, &left, &right)
            }
            Expr::And(left, right) => Value::Bool(
                is_truthy(&left.evaluate(ctx, event)) && is_truthy(&right.evaluate(ctx, event)),
            ),
            Expr::Or(left, right) => Value::Bool(
                is_truthy(&left.evaluate(ctx, event)) || is_truthy(&right.evaluate(ctx, event)),
            ),
            Expr::Not(inner) => Value::Bool(!is_truthy(&inner.evaluate(ctx, event))),
        }
    }

    /// Evaluates the expression and reduces it to a truthiness check.
    pub fn evaluate_bool(&self, ctx: &Value, event: &Event) -> bool {
        is_truthy(&self.evaluate(ctx, event))
    }

    /// Collects the top-level context fields this expression reads.
    ///
    /// Used by computed-context resolution to build the dependency graph.
    pub fn ctx_dependencies(&self, out: &mut Vec<String>) {
        match self {
            Expr::Path(Scope::Ctx, path) if !path.is_empty() => {
                let head = path.split('.').next().unwrap_or(path);
                if !out.iter().any(|d| d == head) {
                    out.push(head.to_string());
                }
            }
            Expr::Path(_, _) | Expr::Lit(_) => {}
            Expr::Cmp(_, left, right) | Expr::Arith(_, left, right) => {
                left.ctx_dependencies(out);
                right.ctx_dependencies(out);
            }
            Expr::And(left, right) | Expr::Or(left, right) => {
                left.ctx_dependencies(out);
                right.ctx_dependencies(out);
            }
            Expr::Not(inner) => inner.ctx_dependencies(out),
        }
    }
}

/// Reads a dotted path out of a JSON value. Missing fields read as null.
pub(crate) fn get_field(root: &Value, path: &str) -> Value {
    let mut current = root;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part).unwrap_or(&Value::Null);
            }
            _ => return Value::Null,
        }
    }
    current.clone()
}

fn event_field(event: &Event, path: &str) -> Value {
    if path.is_empty() {
        return event.to_value();
    }
    if path == "type" {
        return Value::String(event.event_type.clone());
    }
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let value = event.get(head).cloned().unwrap_or(Value::Null);
    match rest {
        Some(rest) => get_field(&value, rest),
        None => value,
    }
}

/// JavaScript-flavored truthiness over JSON values.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> bool {
    match op {
        CmpOp::Eq => values_equal(left, right),
        CmpOp::Ne => !values_equal(left, right),
        CmpOp::Gt => as_f64(left)
            .zip(as_f64(right))
            .map(|(a, b)| a > b)
            .unwrap_or(false),
        CmpOp::Ge => as_f64(left)
            .zip(as_f64(right))
            .map(|(a, b)| a >= b)
            .unwrap_or(false),
        CmpOp::Lt => as_f64(left)
            .zip(as_f64(right))
            .map(|(a, b)| a < b)
            .unwrap_or(false),
        CmpOp::Le => as_f64(left)
            .zip(as_f64(right))
            .map(|(a, b)| a <= b)
            .unwrap_or(false),
    }
}

fn arith(op: ArithOp, left: &Value, right: &Value) -> Value {
    // String concatenation
    if op == ArithOp::Add {
        if let (Value::String(a), Value::String(b)) = (left, right) {
            return Value::String(format!("{}{}", a, b));
        }
    }

    // Integer arithmetic stays integer where possible
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        let result = match op {
            ArithOp::Add => a.checked_add(b),
            ArithOp::Sub => a.checked_sub(b),
            ArithOp::Mul => a.checked_mul(b),
            ArithOp::Div => {
                if b != 0 && a % b == 0 {
                    Some(a / b)
                } else {
                    None
                }
            }
            ArithOp::Rem => {
                if b != 0 {
                    Some(a % b)
                } else {
                    return Value::Null;
                }
            }
        };
        if let Some(result) = result {
            return Value::Number(result.into());
        }
        if op == ArithOp::Div && b == 0 {
            return Value::Null;
        }
    }

    let (a, b) = match (as_f64(left), as_f64(right)) {
        (Some(a), Some(b)) => (a, b),
        _ => return Value::Null,
    };
    let result = match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => {
            if b == 0.0 {
                return Value::Null;
            }
            a / b
        }
        ArithOp::Rem => {
            if b == 0.0 {
                return Value::Null;
            }
            a % b
        }
    };
    serde_json::Number::from_f64(result)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Simple recursive descent parser for expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            // Recursive to allow !!ctx.a
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CoreError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            CmpOp::Eq
        } else if self.peek_str("!=") {
            CmpOp::Ne
        } else if self.peek_str(">=") {
            CmpOp::Ge
        } else if self.peek_str("<=") {
            CmpOp::Le
        } else if self.peek_char() == Some('>') {
            CmpOp::Gt
        } else if self.peek_char() == Some('<') {
            CmpOp::Lt
        } else {
            return Ok(left);
        };

        self.pos += match op {
            CmpOp::Gt | CmpOp::Lt => 1,
            _ => 2,
        };
        let right = self.parse_additive()?;
        Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_multiplicative()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('+') => ArithOp::Add,
                Some('-') => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_multiplicative()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_primary()?;
        self.skip_whitespace();

        loop {
            let op = match self.peek_char() {
                Some('*') => ArithOp::Mul,
                Some('/') => ArithOp::Div,
                Some('%') => ArithOp::Rem,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_primary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        // Parenthesized expressions
        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(CoreError::InvalidExpr {
                    reason: "expected ')'".to_string(),
                });
            }
            self.pos += 1;
            return Ok(expr);
        }

        // String literals
        if matches!(self.peek_char(), Some('"') | Some('\'')) {
            return self.parse_string();
        }

        // Numbers (including a leading minus)
        if self
            .peek_char()
            .map(|c| c.is_ascii_digit() || c == '-')
            .unwrap_or(false)
        {
            let num = self.parse_number()?;
            return Ok(Expr::Lit(number_value(num)));
        }

        // Keywords and paths
        let word = self.peek_word();
        match word {
            "true" => {
                self.pos += 4;
                Ok(Expr::Lit(Value::Bool(true)))
            }
            "false" => {
                self.pos += 5;
                Ok(Expr::Lit(Value::Bool(false)))
            }
            "null" => {
                self.pos += 4;
                Ok(Expr::Lit(Value::Null))
            }
            "ctx" => {
                self.pos += 3;
                let path = self.parse_path_tail()?;
                Ok(Expr::Path(Scope::Ctx, path))
            }
            "event" => {
                self.pos += 5;
                let path = self.parse_path_tail()?;
                Ok(Expr::Path(Scope::Event, path))
            }
            _ => Err(CoreError::InvalidExpr {
                reason: format!(
                    "expected 'ctx', 'event', or a literal at position {}",
                    self.pos
                ),
            }),
        }
    }

    /// Parses the optional `.field.nested` tail after `ctx`/`event`.
    fn parse_path_tail(&mut self) -> Result<String, CoreError> {
        if self.peek_char() != Some('.') {
            return Ok(String::new());
        }
        self.pos += 1;

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
            } else {
                break;
            }
        }

        let path = &self.input[start..self.pos];
        if path.is_empty() || path.ends_with('.') {
            return Err(CoreError::InvalidExpr {
                reason: "empty field name".to_string(),
            });
        }
        Ok(path.to_string())
    }

    fn parse_string(&mut self) -> Result<Expr, CoreError> {
        let quote = match self.peek_char() {
            Some(c @ ('"' | '\'')) => c,
            _ => {
                return Err(CoreError::InvalidExpr {
                    reason: "expected string".to_string(),
                })
            }
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            if c == quote {
                self.pos += 1;
                return Ok(Expr::Lit(Value::String(out)));
            }
            if c == '\\' {
                self.pos += 1;
                match self.peek_char() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(esc) => out.push(esc),
                    None => break,
                }
                self.pos += 1;
            } else {
                out.push(c);
                self.pos += c.len_utf8();
            }
        }

        Err(CoreError::InvalidExpr {
            reason: "unterminated string".to_string(),
        })
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str.parse::<f64>().map_err(|_| CoreError::InvalidExpr {
            reason: format!("invalid number: '{}'", num_str),
        })
    }

    /// Peeks the identifier starting at the cursor, without consuming it.
    fn peek_word(&self) -> &'a str {
        let rest = &self.input[self.pos..];
        let end = rest
            .char_indices()
            .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        &rest[..end]
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn number_value(num: f64) -> Value {
    if num.fract() == 0.0 && num.abs() < i64::MAX as f64 {
        Value::Number((num as i64).into())
    } else {
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
