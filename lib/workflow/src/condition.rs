//! Step and filter condition evaluation.
//!
//! Numbers compare numerically and strings lexically. Comparing values of
//! different types, or a field that does not resolve, yields `false`.

use crate::definition::Condition;
use crate::template::lookup;
use serde_json::{Number, Value as JsonValue};
use std::cmp::Ordering;

/// A parsed comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    In,
    NotIn,
    Contains,
    Exists,
    NotExists,
}

impl ConditionOperator {
    /// Parses a symbolic or named operator.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "==" | "eq" | "equals" => Some(Self::Eq),
            "!=" | "ne" | "not_equals" => Some(Self::Ne),
            ">" | "gt" => Some(Self::Gt),
            "<" | "lt" => Some(Self::Lt),
            ">=" | "gte" => Some(Self::Gte),
            "<=" | "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            "not_in" => Some(Self::NotIn),
            "contains" => Some(Self::Contains),
            "exists" => Some(Self::Exists),
            "not_exists" => Some(Self::NotExists),
            _ => None,
        }
    }
}

/// Evaluates `condition` against `context`. Unknown operators are false.
#[must_use]
pub fn evaluate(condition: &Condition, context: &JsonValue) -> bool {
    let Some(operator) = ConditionOperator::parse(&condition.operator) else {
        return false;
    };
    let actual = lookup(context, &condition.field);
    compare(operator, actual, &condition.value)
}

/// Applies `operator` to a resolved value and the expected value.
#[must_use]
pub fn compare(operator: ConditionOperator, actual: Option<&JsonValue>, expected: &JsonValue) -> bool {
    let present = actual.filter(|v| !v.is_null());
    match operator {
        ConditionOperator::Exists => present.is_some(),
        ConditionOperator::NotExists => present.is_none(),
        ConditionOperator::Eq => actual.is_some_and(|a| values_equal(a, expected)),
        ConditionOperator::Ne => actual.is_some_and(|a| !values_equal(a, expected)),
        ConditionOperator::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::Lt => ordering(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Gte => matches!(
            ordering(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::Lte => matches!(
            ordering(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ConditionOperator::In => actual.is_some_and(|a| contains(expected, a)),
        ConditionOperator::NotIn => {
            actual.is_some_and(|a| expected.is_array() && !contains(expected, a))
        }
        ConditionOperator::Contains => actual.is_some_and(|a| contains(a, expected)),
    }
}

fn values_equal(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => {
            compare_numbers(x, y) == Some(Ordering::Equal)
        }
        _ => a == b,
    }
}

/// Integers compare exactly; floats only when either side is one.
fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Some(x.cmp(&y));
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return Some(x.cmp(&y));
    }
    // One side is a u64 above i64::MAX, the other a negative i64.
    if a.is_u64() && b.is_i64() {
        return Some(Ordering::Greater);
    }
    if a.is_i64() && b.is_u64() {
        return Some(Ordering::Less);
    }
    a.as_f64()?.partial_cmp(&b.as_f64()?)
}

fn ordering(actual: Option<&JsonValue>, expected: &JsonValue) -> Option<Ordering> {
    match (actual?, expected) {
        (JsonValue::Number(a), JsonValue::Number(b)) => compare_numbers(a, b),
        (JsonValue::String(a), JsonValue::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Membership: element of an array, substring of a string, or key of an object.
fn contains(haystack: &JsonValue, needle: &JsonValue) -> bool {
    match haystack {
        JsonValue::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        JsonValue::String(text) => needle.as_str().is_some_and(|n| text.contains(n)),
        JsonValue::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}
