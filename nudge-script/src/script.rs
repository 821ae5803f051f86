//! Script document model — the declarative source of the coach's
//! personality and flow.
//!
//! A [`Script`] is deserialized from a versioned JSON document, validated,
//! and never mutated afterwards; a newer version supersedes it wholesale.
//! The engine shares it behind an `Arc`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::condition::ConditionMap;
use crate::error::{Result, ScriptError};
use crate::types::{MessageKind, Sender, VariableMap};

// ---------------------------------------------------------------------------
// Document root
// ---------------------------------------------------------------------------

/// An immutable, versioned script document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    /// Document id (stable across versions).
    pub id: String,
    /// Document version; compared verbatim, newest wins.
    pub version: String,
    /// Language this document was authored/localized for.
    #[serde(default)]
    pub language: String,
    /// Default values merged into a fresh conversation's variable map.
    #[serde(default)]
    pub global_variables: VariableMap,
    /// Recurring, condition-gated interactions in authoring order.
    #[serde(default)]
    pub daily_events: Vec<DailyEvent>,
    /// One-time narrative content keyed by `day_<n>`.
    #[serde(default)]
    pub plot_days: HashMap<String, PlotDay>,
    /// Named message templates keyed by template key.
    #[serde(default)]
    pub templates: HashMap<String, MessageTemplate>,
}

impl Script {
    /// Parse a JSON document and validate it.
    ///
    /// # Errors
    /// `ScriptError::Serialization` on malformed JSON,
    /// `ScriptError::Validation` listing every problem found.
    pub fn from_json(json: &str) -> Result<Self> {
        let script: Script =
            serde_json::from_str(json).map_err(|e| ScriptError::Serialization(e.to_string()))?;
        script.validate()?;
        Ok(script)
    }

    /// Validate the document, collecting all problems rather than
    /// stopping at the first.
    ///
    /// # Errors
    /// `ScriptError::Validation` if any problem is found.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("script id is empty".to_string());
        }
        if self.version.trim().is_empty() {
            problems.push("script version is empty".to_string());
        }

        for event in &self.daily_events {
            if event.id.trim().is_empty() {
                problems.push("daily event with empty id".to_string());
            }
            if event.variants.is_empty() {
                problems.push(format!("daily event '{}' has no variants", event.id));
            }
            for variant in &event.variants {
                if variant.weight < 0.0 {
                    problems.push(format!(
                        "variant '{}' of event '{}' has negative weight {}",
                        variant.id, event.id, variant.weight
                    ));
                }
                if variant.messages.is_empty() {
                    problems.push(format!(
                        "variant '{}' of event '{}' has no messages",
                        variant.id, event.id
                    ));
                }
            }
        }

        for (day_key, day) in &self.plot_days {
            if !day_key.starts_with("day_") || day_key[4..].parse::<u32>().is_err() {
                problems.push(format!("plot day key '{day_key}' is not of the form day_<n>"));
            }
            for event in &day.events {
                if event.messages.is_empty() {
                    problems.push(format!(
                        "plot event '{}' on {day_key} has no messages",
                        event.id
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ScriptError::Validation {
                script_id: self.id.clone(),
                version: self.version.clone(),
                problems,
            })
        }
    }

    /// Look up a daily event by id (used when branching via
    /// `next_event_id`).
    #[must_use]
    pub fn daily_event(&self, id: &str) -> Option<&DailyEvent> {
        self.daily_events.iter().find(|e| e.id == id)
    }

    /// Plot content for a journey day, if authored.
    #[must_use]
    pub fn plot_day(&self, day_in_journey: u32) -> Option<&PlotDay> {
        self.plot_days.get(&format!("day_{day_in_journey}"))
    }

    /// The hard-coded last-resort script: one generic check-in event,
    /// always eligible, so the product never fully breaks even when the
    /// bundled document itself fails to parse.
    #[must_use]
    pub fn minimal() -> Self {
        Script {
            id: "minimal".to_string(),
            version: "0".to_string(),
            language: "en".to_string(),
            global_variables: VariableMap::new(),
            daily_events: vec![DailyEvent {
                id: "generic_check_in".to_string(),
                trigger: Trigger {
                    kind: "time_window".to_string(),
                    start: Some("00:00".to_string()),
                    end: Some("23:59".to_string()),
                    conditions: ConditionMap::new(),
                },
                variants: vec![EventVariant {
                    id: "default".to_string(),
                    weight: 1.0,
                    conditions: ConditionMap::new(),
                    messages: vec![ScriptMessage {
                        id: "generic_check_in_msg".to_string(),
                        kind: MessageKind::Text,
                        sender: Sender::Bot,
                        content: Some("How is your habit going today?".to_string()),
                        content_key: None,
                        properties: serde_json::Map::new(),
                        delay_ms: None,
                        options: Vec::new(),
                        input: None,
                    }],
                    set_variables: VariableMap::new(),
                }],
                responses: HashMap::new(),
                priority: 0,
            }],
            plot_days: HashMap::new(),
            templates: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A recurring, condition-gated interaction (e.g. a check-in).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyEvent {
    /// Stable event id.
    pub id: String,
    /// When this event may fire.
    pub trigger: Trigger,
    /// Concrete renderings in authoring order.
    #[serde(default)]
    pub variants: Vec<EventVariant>,
    /// Consequences per option id, merged over the option's own fields.
    #[serde(default)]
    pub responses: HashMap<String, EventResponse>,
    /// Higher fires first; ties keep authoring order.
    #[serde(default)]
    pub priority: i32,
}

/// Firing gate for a daily event.
///
/// `time_window` is the one kind the engine interprets; any other tag is
/// an opaque extension point that never fires here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    /// Trigger kind tag.
    #[serde(rename = "type", default = "default_trigger_kind")]
    pub kind: String,
    /// Window start, local time of day, `HH:MM`.
    #[serde(default)]
    pub start: Option<String>,
    /// Window end, local time of day, `HH:MM` (inclusive).
    #[serde(default)]
    pub end: Option<String>,
    /// Condition map gating the trigger regardless of kind.
    #[serde(default)]
    pub conditions: ConditionMap,
}

fn default_trigger_kind() -> String {
    "time_window".to_string()
}

/// One weighted, condition-gated rendering of an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventVariant {
    /// Variant id, unique within its event.
    pub id: String,
    /// Relative probability mass, `>= 0`. A zero-weight variant is only
    /// selectable as the sole condition survivor.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Gate conditions.
    #[serde(default)]
    pub conditions: ConditionMap,
    /// Messages emitted in order.
    #[serde(default)]
    pub messages: Vec<ScriptMessage>,
    /// Applied once, after the message list drains uninterrupted.
    #[serde(default)]
    pub set_variables: VariableMap,
}

fn default_weight() -> f64 {
    1.0
}

/// One-time narrative content for a single journey day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotDay {
    /// Day-level gate applied before any event on this day.
    #[serde(default)]
    pub conditions: ConditionMap,
    /// Plot events in narrative order.
    #[serde(default)]
    pub events: Vec<PlotEvent>,
}

/// A single plot beat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotEvent {
    /// Stable event id (used to mark completion).
    pub id: String,
    /// Per-event gate.
    #[serde(default)]
    pub conditions: ConditionMap,
    /// Messages emitted in order.
    #[serde(default)]
    pub messages: Vec<ScriptMessage>,
    /// Applied once after the event drains uninterrupted.
    #[serde(default)]
    pub set_variables: VariableMap,
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One authored message.
///
/// Either `content` (literal text, also the hard-coded fallback when a
/// `content_key` is present) or `content_key` drives the displayed text.
/// `properties` is opaque to the engine and passed through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptMessage {
    /// Message id, unique within its event.
    pub id: String,
    /// Kind tag; unknown tags read as plain text.
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Sender tag; unknown tags read as the bot.
    #[serde(default)]
    pub sender: Sender,
    /// Literal text / hard-coded fallback.
    #[serde(default)]
    pub content: Option<String>,
    /// Semantic key resolved through the content ladder.
    #[serde(default)]
    pub content_key: Option<String>,
    /// Visual/timing bag for the presentation layer; never interpreted.
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Pre-display pacing delay; never used for logic.
    #[serde(default)]
    pub delay_ms: Option<u64>,
    /// Choice list; non-empty means this message suspends the flow.
    #[serde(default)]
    pub options: Vec<MessageOption>,
    /// Free-text input request; present means this message suspends.
    #[serde(default)]
    pub input: Option<InputConfig>,
}

impl ScriptMessage {
    /// Whether emitting this message suspends the flow until the user
    /// responds.
    #[must_use]
    pub fn requires_response(&self) -> bool {
        matches!(self.kind, MessageKind::Options | MessageKind::Input)
            || !self.options.is_empty()
            || self.input.is_some()
    }
}

/// A tappable choice attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageOption {
    /// Option id, matched against the event's `responses`.
    pub id: String,
    /// Literal label.
    #[serde(default)]
    pub label: Option<String>,
    /// Semantic key for the label.
    #[serde(default)]
    pub label_key: Option<String>,
    /// Branch target processed from the top instead of resuming.
    #[serde(default)]
    pub next_event_id: Option<String>,
    /// Applied immediately on selection.
    #[serde(default)]
    pub set_variables: VariableMap,
    /// Achievement unlocked on selection (bookkeeping collaborator).
    #[serde(default)]
    pub achievement_id: Option<String>,
}

/// Free-text input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// Variable key the submitted text is stored under; the engine's
    /// configured default applies when absent.
    #[serde(default)]
    pub variable_key: Option<String>,
    /// Placeholder for the presentation layer; passed through.
    #[serde(default)]
    pub placeholder: Option<String>,
}

/// Consequence of selecting an option, authored on the owning event.
///
/// Merged with the option's own fields on selection; response values win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventResponse {
    /// Branch target processed from the top instead of resuming.
    #[serde(default)]
    pub next_event_id: Option<String>,
    /// Applied immediately on selection.
    #[serde(default)]
    pub set_variables: VariableMap,
    /// Achievement unlocked on selection.
    #[serde(default)]
    pub achievement_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Message templates
// ---------------------------------------------------------------------------

/// A named template string with declared variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    /// The template text, in the engine's `{{…}}` syntax.
    pub template: String,
    /// Declared variable names (authoring documentation; extra supplied
    /// values are fine, missing ones render empty).
    #[serde(default)]
    pub variables: Vec<String>,
}

impl MessageTemplate {
    /// Substitute `values` into the template.
    #[must_use]
    pub fn apply(&self, values: &VariableMap) -> String {
        crate::template::apply(&self.template, values)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
