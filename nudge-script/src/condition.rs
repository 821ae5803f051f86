//! Boolean predicate evaluation over the state-variable map.
//!
//! A condition block is a map of `variable key → clause`, evaluated as a
//! conjunction. The reserved keys `AND` and `OR` hold lists of nested
//! condition maps, enabling arbitrary boolean trees. Clause forms:
//!
//! - exact equality: `"user.plan": "premium"`
//! - set membership: `"task.kind": ["run", "walk"]`
//! - range: `"session.streak": { "min": 5 }` (missing bound = unbounded)
//! - negation: `"user.paused": { "not": true }`
//!
//! A clause referencing an absent variable evaluates against that type's
//! zero value (`false`, `0`, `""`, `[]`) instead of failing. This makes
//! "absent" indistinguishable from "explicitly empty" — a documented
//! authoring ambiguity that is preserved deliberately.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{Value, VariableMap};

/// Reserved combinator key: every nested map must hold.
pub const KEY_AND: &str = "AND";
/// Reserved combinator key: at least one nested map must hold.
pub const KEY_OR: &str = "OR";

/// An ordered condition block. `BTreeMap` keeps evaluation order stable
/// for reproducible logs.
pub type ConditionMap = BTreeMap<String, Clause>;

// ---------------------------------------------------------------------------
// Clause forms
// ---------------------------------------------------------------------------

/// A numeric range clause; a missing bound is unbounded. Bounds are closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RangeClause {
    /// Inclusive lower bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Inclusive upper bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Negation wrapper around any other clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotClause {
    /// The clause to invert.
    pub not: Box<Clause>,
}

/// One per-key predicate.
///
/// Deserialized untagged; variant order matters because serde tries them
/// top to bottom. Combinator payloads (lists of nested maps) only make
/// sense under the `AND` / `OR` keys and are rejected elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Clause {
    /// `{ "not": … }`.
    Not(NotClause),
    /// `{ "min": …, "max": … }`.
    Range(RangeClause),
    /// Nested condition maps under a combinator key.
    Nested(Vec<ConditionMap>),
    /// Set membership: actual value must equal one of the listed scalars.
    OneOf(Vec<Value>),
    /// Exact equality against a scalar.
    Equals(Value),
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a condition block against the variable map.
///
/// An empty block is vacuously true.
#[must_use]
pub fn evaluate(conditions: &ConditionMap, variables: &VariableMap) -> bool {
    conditions.iter().all(|(key, clause)| match key.as_str() {
        KEY_AND => match clause {
            Clause::Nested(blocks) => blocks.iter().all(|b| evaluate(b, variables)),
            other => {
                tracing::warn!(clause = ?other, "AND combinator requires a list of condition maps");
                false
            }
        },
        KEY_OR => match clause {
            Clause::Nested(blocks) => blocks.iter().any(|b| evaluate(b, variables)),
            other => {
                tracing::warn!(clause = ?other, "OR combinator requires a list of condition maps");
                false
            }
        },
        _ => evaluate_clause(clause, variables.get(key)),
    })
}

/// Evaluate one clause against an (optionally absent) variable.
fn evaluate_clause(clause: &Clause, actual: Option<&Value>) -> bool {
    match clause {
        Clause::Not(inner) => !evaluate_clause(&inner.not, actual),
        Clause::Range(range) => {
            // Absent numeric variable reads as 0.
            let n = actual.and_then(Value::as_number).unwrap_or(0.0);
            range.min.is_none_or(|min| n >= min) && range.max.is_none_or(|max| n <= max)
        }
        Clause::OneOf(allowed) => allowed.iter().any(|v| values_equal(actual, v)),
        Clause::Equals(expected) => values_equal(actual, expected),
        Clause::Nested(_) => {
            tracing::warn!("nested condition list outside AND/OR never matches");
            false
        }
    }
}

/// Equality with zero-value defaulting for absent variables.
fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(v) => scalar_eq(v, expected),
        // Absent compares against the zero value of the *expected* type.
        None => scalar_eq(&expected.zero_like(), expected),
    }
}

/// Scalar equality with numeric coercion (`"5"` equals `5`).
fn scalar_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
