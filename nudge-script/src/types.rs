//! Core type definitions for the Nudge script engine.
//!
//! Everything here is serializable: conversation state (including a
//! suspended flow) must survive a process restart.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Scalar variable values
// ---------------------------------------------------------------------------

/// A scalar state-variable value.
///
/// Variables are never typed beyond this closed union. Keys are stable
/// strings namespaced by domain (`session.*`, `user.*`, `task.*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Numeric value (all script numbers are f64).
    Number(f64),
    /// Text value.
    Text(String),
    /// Ordered list of scalars.
    Array(Vec<Value>),
}

impl Value {
    /// The zero value for this value's type.
    ///
    /// Conditions referencing an absent variable evaluate against the zero
    /// value of the clause's expected type rather than failing. This makes
    /// "absent" indistinguishable from "explicitly empty" — known authoring
    /// ambiguity, preserved on purpose.
    #[must_use]
    pub fn zero_like(&self) -> Value {
        match self {
            Value::Bool(_) => Value::Bool(false),
            Value::Number(_) => Value::Number(0.0),
            Value::Text(_) => Value::Text(String::new()),
            Value::Array(_) => Value::Array(Vec::new()),
        }
    }

    /// Numeric view: numbers as-is, booleans as 0/1, numeric strings parsed.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Array(_) => None,
        }
    }

    /// Truthiness: `false`, `0`, `""` and `[]` are falsy.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            // Render integral numbers without a trailing ".0".
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// The state-variable map every component reads and the flow mutates.
pub type VariableMap = std::collections::HashMap<String, Value>;

// ---------------------------------------------------------------------------
// Message taxonomy
// ---------------------------------------------------------------------------

/// Who a message appears to come from.
///
/// Closed union; unknown sender tags in old script versions map to
/// [`Sender::Bot`] rather than failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sender {
    /// The coach persona.
    #[default]
    Bot,
    /// Echoed user content.
    User,
    /// System / meta notices.
    System,
}

impl Sender {
    /// Explicit string→tag lookup, failing closed to [`Sender::Bot`].
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "user" => Sender::User,
            "system" => Sender::System,
            _ => Sender::Bot,
        }
    }

    /// Stable wire tag.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Sender::Bot => "bot",
            Sender::User => "user",
            Sender::System => "system",
        }
    }
}

impl Serialize for Sender {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for Sender {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(de)?;
        Ok(Sender::from_tag(&tag))
    }
}

/// The kind of a script message.
///
/// Closed union; unknown kind tags map to [`MessageKind::Text`] so old
/// clients keep working against newer scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageKind {
    /// Plain display text.
    #[default]
    Text,
    /// Text plus a list of tappable options; suspends the flow.
    Options,
    /// Free-text input request; suspends the flow.
    Input,
    /// A `|||`-style multi-part sequence emitted as separate bubbles.
    Sequence,
}

impl MessageKind {
    /// Explicit string→tag lookup, failing closed to [`MessageKind::Text`].
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "options" => MessageKind::Options,
            "input" => MessageKind::Input,
            "sequence" => MessageKind::Sequence,
            _ => MessageKind::Text,
        }
    }

    /// Stable wire tag.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Options => "options",
            MessageKind::Input => "input",
            MessageKind::Sequence => "sequence",
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> std::result::Result<S::Ok, S::Error> {
        ser.serialize_str(self.tag())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(de)?;
        Ok(MessageKind::from_tag(&tag))
    }
}

// ---------------------------------------------------------------------------
// Semantic keys
// ---------------------------------------------------------------------------

/// A dot-delimited content key: `actor.action.subject[.modifier]*`.
///
/// Semantic keys are the authoring handle for reusable content; the
/// resolver walks them down a specificity ladder (see `content`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SemanticKey(pub String);

impl SemanticKey {
    /// Build a key, normalising separators.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key's dot-separated segments.
    #[must_use]
    pub fn segments(&self) -> Vec<&str> {
        self.0.split('.').filter(|s| !s.is_empty()).collect()
    }

    /// A copy of this key with extra modifiers appended.
    #[must_use]
    pub fn with_tags(&self, tags: &[&str]) -> Self {
        if tags.is_empty() {
            return self.clone();
        }
        let mut s = self.0.clone();
        for tag in tags {
            s.push('.');
            s.push_str(tag);
        }
        Self(s)
    }
}

impl fmt::Display for SemanticKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SemanticKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integral_numbers_display_without_fraction() {
        assert_eq!(Value::Number(7.0).to_string(), "7");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
    }

    #[test]
    fn truthiness_of_zero_values() {
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::Text(String::new()).is_truthy());
        assert!(!Value::Array(vec![]).is_truthy());
        assert!(Value::Number(0.1).is_truthy());
    }

    #[test]
    fn unknown_tags_fail_closed() {
        assert_eq!(Sender::from_tag("narrator"), Sender::Bot);
        assert_eq!(MessageKind::from_tag("carousel"), MessageKind::Text);
    }

    #[test]
    fn semantic_key_tags_append_as_modifiers() {
        let key = SemanticKey::new("bot.acknowledge.completion");
        let tagged = key.with_tags(&["positive", "first_time"]);
        assert_eq!(tagged.0, "bot.acknowledge.completion.positive.first_time");
        assert_eq!(tagged.segments().len(), 5);
    }
}
