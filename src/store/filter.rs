// src/store/filter.rs
// Closed filter grammar for store queries.
//
// Only conjunctions of typed conditions cross the trust boundary. Raw
// filter strings from callers are never accepted; free text is embedded
// and searched, not pasted into filters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    In,
    Gt,
    Lt,
    Contains,
}

/// One `{key, op, value}` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub key: String,
    pub op: FilterOp,
    pub value: Value,
}

/// A conjunction of conditions. Empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn and(mut self, key: &str, op: FilterOp, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            key: key.to_string(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, key: &str, value: impl Into<Value>) -> Self {
        self.and(key, FilterOp::Eq, value)
    }

    pub fn contains(self, key: &str, value: impl Into<Value>) -> Self {
        self.and(key, FilterOp::Contains, value)
    }

    pub fn gt(self, key: &str, value: impl Into<Value>) -> Self {
        self.and(key, FilterOp::Gt, value)
    }

    pub fn lt(self, key: &str, value: impl Into<Value>) -> Self {
        self.and(key, FilterOp::Lt, value)
    }

    /// Evaluate against a payload. Used by the in-memory backend; the
    /// Qdrant driver translates conditions to native filters instead.
    pub fn matches(&self, payload: &serde_json::Map<String, Value>) -> bool {
        self.conditions.iter().all(|c| condition_matches(c, payload))
    }
}

fn condition_matches(condition: &Condition, payload: &serde_json::Map<String, Value>) -> bool {
    let Some(actual) = payload.get(&condition.key) else {
        return false;
    };
    match condition.op {
        FilterOp::Eq => actual == &condition.value,
        FilterOp::In => condition
            .value
            .as_array()
            .map(|candidates| candidates.contains(actual))
            .unwrap_or(false),
        FilterOp::Gt => match (as_f64(actual), as_f64(&condition.value)) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        FilterOp::Lt => match (as_f64(actual), as_f64(&condition.value)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        FilterOp::Contains => match (actual, &condition.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        },
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}
