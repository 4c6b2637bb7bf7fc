//! Structural event filter patterns.
//!
//! A pattern is a JSON object whose keys name record fields. Each value is
//! either a list of acceptable leaf conditions (OR'd), a nested object that is
//! matched against the nested record object, or, under the reserved `$or` key,
//! a list of sub-patterns evaluated against the same record. All keys of a
//! pattern must hold (AND).
//!
//! Leaf conditions are literals (string, number, bool, `null`) or single-key
//! operator objects: `exists`, `prefix`, `suffix`, `numeric`, `anything-but`,
//! `equals-ignore-case`. Anything the matcher cannot interpret (absent field,
//! type mismatch, unknown operator) evaluates to `false`; matching never fails.
//!
//! Unknown operators are not rejected when criteria are parsed. A condition
//! using one, such as a misspelt `prefx`, never admits a record, so a filter
//! built only from it drops every message it sees.

use serde_json::{Map, Value};

/// Reserved key that turns a list into a disjunction of sub-patterns.
pub const OR_KEY: &str = "$or";

/// Errors raised while parsing filter criteria. Matching itself never errors.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("filter pattern is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("filter pattern must be a JSON object, got {kind}")]
    NotAnObject { kind: &'static str },
}

/// Returns `true` when `record` satisfies every key of `pattern`.
///
/// Pure function: identical arguments always yield identical results.
#[must_use]
pub fn matches(pattern: &Value, record: &Value) -> bool {
    match pattern {
        Value::Object(pattern) => matches_object(pattern, record),
        _ => false,
    }
}

fn matches_object(pattern: &Map<String, Value>, record: &Value) -> bool {
    pattern.iter().all(|(key, condition)| match condition {
        Value::Array(alternatives) if key == OR_KEY => {
            alternatives.iter().any(|sub| matches(sub, record))
        }
        Value::Array(alternatives) => alternatives
            .iter()
            .any(|leaf| matches_leaf(record, key, leaf)),
        Value::Object(nested) => match field(record, key) {
            Some(child @ Value::Object(_)) => matches_object(nested, child),
            _ => false,
        },
        _ => false,
    })
}

fn field<'a>(record: &'a Value, key: &str) -> Option<&'a Value> {
    record.as_object().and_then(|obj| obj.get(key))
}

fn matches_leaf(record: &Value, key: &str, leaf: &Value) -> bool {
    let value = field(record, key);
    match leaf {
        Value::Null => matches!(value, Some(Value::Null)),
        Value::String(_) | Value::Bool(_) => value == Some(leaf),
        Value::Number(expected) => match value {
            Some(Value::Number(actual)) => actual.as_f64() == expected.as_f64(),
            _ => false,
        },
        Value::Object(operators) if !operators.is_empty() => operators
            .iter()
            .all(|(name, operand)| apply_operator(name, operand, record, key)),
        _ => false,
    }
}

fn apply_operator(name: &str, operand: &Value, record: &Value, key: &str) -> bool {
    let value = field(record, key);
    match name {
        "exists" => match operand {
            // A nested object is a path, not a leaf, so it does not "exist" here.
            Value::Bool(true) => value.is_some_and(|v| !v.is_object()),
            Value::Bool(false) => value.is_none(),
            _ => false,
        },
        "prefix" => string_test(value, operand, |v, p| v.starts_with(p)),
        "suffix" => string_test(value, operand, |v, s| v.ends_with(s)),
        "equals-ignore-case" => match (value, operand) {
            (Some(Value::String(v)), Value::String(expected)) => {
                v.to_lowercase() == expected.to_lowercase()
            }
            _ => false,
        },
        "numeric" => match (value.and_then(Value::as_f64), operand.as_array()) {
            (Some(actual), Some(terms)) => numeric_range(actual, terms),
            _ => false,
        },
        "anything-but" => anything_but(value, operand),
        // Unrecognised operators never match.
        _ => false,
    }
}

fn string_test(value: Option<&Value>, operand: &Value, test: fn(&str, &str) -> bool) -> bool {
    match (value, operand) {
        (Some(Value::String(v)), Value::String(needle)) if !v.is_empty() => test(v, needle),
        _ => false,
    }
}

/// Evaluates `[op, n]` or `[op, n, op, n]`; both comparisons must hold.
fn numeric_range(actual: f64, terms: &[Value]) -> bool {
    if terms.len() != 2 && terms.len() != 4 {
        return false;
    }
    terms.chunks(2).all(|pair| match (&pair[0], pair[1].as_f64()) {
        (Value::String(op), Some(bound)) => compare(op, actual, bound),
        _ => false,
    })
}

#[allow(clippy::float_cmp)]
fn compare(op: &str, actual: f64, bound: f64) -> bool {
    match op {
        "=" => actual == bound,
        ">" => actual > bound,
        ">=" => actual >= bound,
        "<" => actual < bound,
        "<=" => actual <= bound,
        _ => false,
    }
}

fn anything_but(value: Option<&Value>, operand: &Value) -> bool {
    let Some(value @ (Value::String(_) | Value::Number(_))) = value else {
        return false;
    };
    match operand {
        Value::Array(excluded) => !excluded.iter().any(|x| same_scalar(x, value)),
        scalar => !same_scalar(scalar, value),
    }
}

#[allow(clippy::float_cmp)]
fn same_scalar(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

// ---------------------------------------------------------------------------
// FilterCriteria
// ---------------------------------------------------------------------------

/// A set of alternative patterns attached to an event source.
///
/// A record passes when at least one pattern matches. Empty criteria let
/// every record through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterCriteria {
    patterns: Vec<Value>,
}

impl FilterCriteria {
    /// Builds criteria from already-decoded pattern objects.
    ///
    /// # Errors
    ///
    /// Returns `PatternError::NotAnObject` if any pattern is not a JSON object.
    pub fn new(patterns: Vec<Value>) -> Result<Self, PatternError> {
        for pattern in &patterns {
            if !pattern.is_object() {
                return Err(PatternError::NotAnObject {
                    kind: json_kind(pattern),
                });
            }
        }
        Ok(Self { patterns })
    }

    /// Parses criteria from pattern strings as stored in an event source
    /// mapping configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a string is not valid JSON or not an object.
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let decoded = patterns
            .iter()
            .map(|p| serde_json::from_str::<Value>(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(decoded)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    #[must_use]
    pub fn patterns(&self) -> &[Value] {
        &self.patterns
    }

    /// Returns `true` if the record passes the criteria.
    #[must_use]
    pub fn accepts(&self, record: &Value) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| matches(p, record))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
