//! Scopes and expression evaluation.
//!
//! A [`Scope`] is a chain of binding frames over a root context object.
//! Lookups walk the frames innermost first, then the root, and finally
//! fall back to the root's `globals` object. A path that resolves to
//! nothing is *absent* (`None`), which interpolates as an empty string
//! and is falsy everywhere.

use crate::parser::{CmpOp, Expr, Path, Segment};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::cmp::Ordering;

/// Name of the fallback object consulted when a top-level key is absent.
pub const GLOBALS_KEY: &str = "globals";

/// Variables visible to an expression.
#[derive(Debug, Default)]
pub struct Scope<'a> {
    bindings: Map<String, Value>,
    parent: Option<&'a Scope<'a>>,
    root: Option<&'a Value>,
}

impl<'a> Scope<'a> {
    /// A scope over a root context object.
    pub fn root(context: &'a Value) -> Self {
        Self {
            bindings: Map::new(),
            parent: None,
            root: Some(context),
        }
    }

    /// An empty scope with no root.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A child frame that sees everything this scope sees.
    pub fn child(&'a self) -> Scope<'a> {
        Scope {
            bindings: Map::new(),
            parent: Some(self),
            root: None,
        }
    }

    /// Bind a variable in this frame, shadowing outer frames.
    pub fn bind(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.bindings.insert(key.into(), value);
        self
    }

    /// Builder-style [`bind`](Self::bind).
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.bind(key, value);
        self
    }

    /// The root context this scope chain was built over, if any.
    pub fn context(&self) -> Option<&Value> {
        match (self.root, self.parent) {
            (Some(root), _) => Some(root),
            (None, Some(parent)) => parent.context(),
            (None, None) => None,
        }
    }

    /// Look up a top-level name without the `globals` fallback.
    pub fn lookup(&self, key: &str) -> Option<&Value> {
        if let Some(v) = self.bindings.get(key) {
            return Some(v);
        }
        if let Some(v) = self.root.and_then(|r| r.get(key)) {
            return Some(v);
        }
        self.parent.and_then(|p| p.lookup(key))
    }

    /// Resolve a path, falling back through `globals` for the head.
    pub fn resolve(&self, path: &Path) -> Option<&Value> {
        let head = self.lookup(&path.head).or_else(|| {
            self.lookup(GLOBALS_KEY)
                .and_then(|globals| globals.get(&path.head))
        })?;
        walk(head, &path.segments)
    }
}

/// Follow path segments from a starting value.
pub fn walk<'v>(start: &'v Value, segments: &[Segment]) -> Option<&'v Value> {
    let mut current = start;
    for segment in segments {
        current = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key)?,
            (Segment::Index(i), Value::Array(items)) => items.get(*i)?,
            // Numeric-looking keys on arrays (`items["0"]`) still index.
            (Segment::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate an expression against a scope.
///
/// Returns `None` for absent values. Logical and comparison operators
/// always produce booleans.
pub fn evaluate<'s>(expr: &Expr, scope: &'s Scope<'_>) -> Option<Cow<'s, Value>> {
    match expr {
        Expr::Literal(v) => Some(Cow::Owned(v.clone())),
        Expr::Path(path) => scope.resolve(path).map(Cow::Borrowed),
        Expr::Not(inner) => {
            let value = evaluate(inner, scope);
            Some(Cow::Owned(Value::Bool(!is_truthy(value.as_deref()))))
        }
        Expr::And(a, b) => {
            let result = is_truthy(evaluate(a, scope).as_deref())
                && is_truthy(evaluate(b, scope).as_deref());
            Some(Cow::Owned(Value::Bool(result)))
        }
        Expr::Or(a, b) => {
            let result = is_truthy(evaluate(a, scope).as_deref())
                || is_truthy(evaluate(b, scope).as_deref());
            Some(Cow::Owned(Value::Bool(result)))
        }
        Expr::Compare(a, op, b) => {
            let left = evaluate(a, scope);
            let right = evaluate(b, scope);
            Some(Cow::Owned(Value::Bool(compare(
                left.as_deref(),
                *op,
                right.as_deref(),
            ))))
        }
    }
}

/// Evaluate an expression for its truthiness.
pub fn evaluate_bool(expr: &Expr, scope: &Scope<'_>) -> bool {
    is_truthy(evaluate(expr, scope).as_deref())
}

/// Absent, `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Present and not `null`.
pub fn exists(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

/// Present with content: non-blank strings, non-empty collections,
/// any number, and `true`.
pub fn non_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(_)) => true,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
    }
}

/// Apply a comparison operator with loose numeric coercion.
pub fn compare(left: Option<&Value>, op: CmpOp, right: Option<&Value>) -> bool {
    match op {
        CmpOp::Eq => loose_eq(left, right),
        CmpOp::NotEq => !loose_eq(left, right),
        CmpOp::Lt => ordering(left, right) == Some(Ordering::Less),
        CmpOp::Gt => ordering(left, right) == Some(Ordering::Greater),
        CmpOp::Lte => matches!(
            ordering(left, right),
            Some(Ordering::Less | Ordering::Equal)
        ),
        CmpOp::Gte => matches!(
            ordering(left, right),
            Some(Ordering::Greater | Ordering::Equal)
        ),
    }
}

fn loose_eq(left: Option<&Value>, right: Option<&Value>) -> bool {
    match (left, right) {
        (None | Some(Value::Null), None | Some(Value::Null)) => true,
        (None | Some(Value::Null), _) | (_, None | Some(Value::Null)) => false,
        (Some(Value::Number(a)), Some(Value::Number(b))) => a.as_f64() == b.as_f64(),
        (Some(Value::Number(n)), Some(Value::String(s)))
        | (Some(Value::String(s)), Some(Value::Number(n))) => {
            parse_number(s).is_some_and(|parsed| Some(parsed) == n.as_f64())
        }
        (Some(a), Some(b)) => a == b,
    }
}

fn ordering(left: Option<&Value>, right: Option<&Value>) -> Option<Ordering> {
    match (left?, right?) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(n), Value::String(s)) => n.as_f64()?.partial_cmp(&parse_number(s)?),
        (Value::String(s), Value::Number(n)) => parse_number(s)?.partial_cmp(&n.as_f64()?),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok()
}

/// Interpolation text for a value.
///
/// Strings render verbatim, whole numbers without a fraction, `null` and
/// absent as nothing, collections as compact JSON.
pub fn stringify(value: Option<&Value>) -> Cow<'_, str> {
    match value {
        None | Some(Value::Null) => Cow::Borrowed(""),
        Some(Value::String(s)) => Cow::Borrowed(s.as_str()),
        Some(Value::Bool(b)) => Cow::Borrowed(if *b { "true" } else { "false" }),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                Cow::Owned(format!("{}", f as i64))
            }
            _ => Cow::Owned(n.to_string()),
        },
        Some(other) => Cow::Owned(other.to_string()),
    }
}

/// Compare two values for sorting: numbers numerically, strings
/// lexically, absent/null first, mixed kinds by kind rank.
pub fn sort_order(left: Option<&Value>, right: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }
    match (left, right) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        _ => rank(left).cmp(&rank(right)),
    }
}
