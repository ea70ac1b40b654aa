use serde::{Deserialize, Serialize};

use crate::memory::SharedMemory;

/// A transition from one node to another.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeSpec {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must hold to traverse this edge.
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// Condition for traversing an edge, evaluated against shared memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EdgeCondition {
    /// Always traverse this edge.
    #[default]
    Always,
    /// Traverse if a simple expression matches.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Conditional { expr: String },
    /// Traverse if `key` holds a non-null value.
    KeyPresent { key: String },
}

impl EdgeSpec {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Always,
        }
    }

    /// Create a conditional edge.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::Conditional { expr: expr.into() },
        }
    }

    pub fn key_present(
        from: impl Into<String>,
        to: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: EdgeCondition::KeyPresent { key: key.into() },
        }
    }

    /// Whether this edge may be taken given the current memory.
    pub fn matches(&self, memory: &SharedMemory) -> bool {
        match &self.condition {
            EdgeCondition::Always => true,
            EdgeCondition::Conditional { expr } => evaluate_condition(expr, memory),
            EdgeCondition::KeyPresent { key } => memory.is_present(key),
        }
    }
}

/// Evaluate a simple conditional expression against shared memory.
///
/// Supported expressions:
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Non-string values are compared through their JSON text, so
/// `approved == "true"` matches a boolean. Returns `false` for unparseable
/// expressions and missing keys.
pub fn evaluate_condition(expr: &str, memory: &SharedMemory) -> bool {
    let expr = expr.trim();
    let lookup = |key: &str| -> Option<String> {
        memory.read(key).filter(|v| !v.is_null()).map(|v| match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    if let Some((key, substr)) = parse_operator(expr, "contains") {
        return lookup(key).is_some_and(|s| s.contains(substr));
    }

    if let Some((key, value)) = parse_operator(expr, "!=") {
        return lookup(key).is_some_and(|s| s != value);
    }

    if let Some((key, value)) = parse_operator(expr, "==") {
        return lookup(key).is_some_and(|s| s == value);
    }

    false
}

/// Parse `key OP "value"` expressions, returning (key, value).
/// The key must be a single bare word.
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) || key.contains('"') {
        return None;
    }
    let val = val.trim().trim_matches('"');
    Some((key, val))
}
