//! Flow control — walking an event's message list, suspending on
//! interactive messages, and resuming on user responses.
//!
//! The controller is a cooperative state machine:
//!
//! ```text
//! Idle → Emitting → AwaitingResponse → Emitting (resumed) → Idle
//! ```
//!
//! Suspension state lives inside [`ConversationState`] (the awaited
//! message, the not-yet-emitted remainder, deferred variable mutations),
//! so an `AwaitingResponse` conversation survives a process restart and
//! may be resumed after arbitrary real time. The controller is never
//! re-entered concurrently for the same state: all mutations flow
//! through it (single writer).

use chrono::NaiveDateTime;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::content::ContentLibrary;
use crate::scheduler::{self, Eligible};
use crate::script::{
    DailyEvent, EventResponse, MessageOption, PlotEvent, Script, ScriptMessage,
};
use crate::state::{ConversationState, Suspension};
use crate::template;
use crate::types::{MessageKind, SemanticKey, Sender, Value, VariableMap};

/// Hard cap on events processed in one synchronous pass; a correctly
/// authored script drains long before this.
const MAX_EVENTS_PER_PASS: usize = 64;

/// Variable key an unlocked achievement id is appended under, for the
/// bookkeeping collaborator to consume.
pub const ACHIEVEMENTS_KEY: &str = "session.achievements";

// ---------------------------------------------------------------------------
// Outbound messages
// ---------------------------------------------------------------------------

/// A fully resolved message handed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Message id; interactive responses reference it.
    pub id: String,
    /// Resolved sender.
    pub sender: Sender,
    /// Resolved kind.
    pub kind: MessageKind,
    /// Final display text (content ladder + templating applied).
    pub text: String,
    /// Pre-display pacing delay, passed through untouched.
    pub delay_ms: Option<u64>,
    /// Opaque visual/timing bag, passed through untouched.
    pub properties: serde_json::Map<String, serde_json::Value>,
    /// Resolved choice labels, if interactive.
    pub options: Vec<OutboundOption>,
}

/// A resolved choice shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundOption {
    /// Option id fed back through `select_option`.
    pub id: String,
    /// Final display label.
    pub label: String,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The flow controller. Borrows everything it needs per call; owning
/// wiring lives in `engine`.
pub struct FlowController<'a, R: Rng> {
    script: &'a Script,
    content: &'a ContentLibrary,
    state: &'a mut ConversationState,
    rng: &'a mut R,
    default_input_key: &'a str,
    max_template_passes: usize,
}

impl<'a, R: Rng> FlowController<'a, R> {
    /// New controller over the given script, content set, and state.
    pub fn new(
        script: &'a Script,
        content: &'a ContentLibrary,
        state: &'a mut ConversationState,
        rng: &'a mut R,
        default_input_key: &'a str,
        max_template_passes: usize,
    ) -> Self {
        Self {
            script,
            content,
            state,
            rng,
            default_input_key,
            max_template_passes,
        }
    }

    /// Process eligible events at `now` until the queue drains or the
    /// flow suspends on an interactive message.
    ///
    /// While `AwaitingResponse`, no events are evaluated and this
    /// returns empty.
    pub fn run(&mut self, now: NaiveDateTime) -> Vec<OutboundMessage> {
        if self.state.suspension.is_some() {
            debug!("flow awaiting a response, skipping event evaluation");
            return Vec::new();
        }

        let mut out = Vec::new();
        for _ in 0..MAX_EVENTS_PER_PASS {
            let next = scheduler::eligible_events(self.script, self.state, now)
                .first()
                .copied()
                .map(|e| match e {
                    Eligible::Plot(p) => OwnedEligible::Plot(p.clone()),
                    Eligible::Daily(d) => OwnedEligible::Daily(d.clone()),
                });
            let Some(event) = next else { break };

            match event {
                OwnedEligible::Plot(plot) => self.process_plot_event(&plot, &mut out),
                OwnedEligible::Daily(daily) => {
                    self.state.fired_today.insert(daily.id.clone());
                    self.process_daily_event(&daily, &mut out);
                }
            }
            if self.state.suspension.is_some() {
                break;
            }
        }
        out
    }

    /// Resolve a selected option on the awaited message.
    ///
    /// A stale or unknown `message_id`/`option_id` is a logged no-op.
    /// Option-level and event-level response fields are merged, response
    /// values winning; its mutations apply immediately. A `next_event_id`
    /// branches into that event from the top instead of resuming the
    /// pending messages.
    pub fn select_option(&mut self, message_id: &str, option_id: &str) -> Vec<OutboundMessage> {
        let Some(suspension) = self.state.suspension.as_ref() else {
            warn!(message_id, option_id, "option selected while nothing is awaited");
            return Vec::new();
        };
        if suspension.message.id != message_id {
            warn!(
                message_id,
                awaited = %suspension.message.id,
                "stale response, ignoring"
            );
            return Vec::new();
        }
        let Some(option) = suspension
            .message
            .options
            .iter()
            .find(|o| o.id == option_id)
            .cloned()
        else {
            warn!(message_id, option_id, "unknown option id, ignoring");
            return Vec::new();
        };

        // Commit: take the suspension and resolve the merged response.
        let suspension = self
            .state
            .suspension
            .take()
            .unwrap_or_else(|| unreachable!("checked above"));
        let event_response = suspension
            .event_id
            .as_deref()
            .and_then(|id| self.script.daily_event(id))
            .and_then(|event| event.responses.get(option_id).cloned())
            .unwrap_or_default();
        let merged = merge_response(&option, &event_response);

        // Response mutations apply immediately on selection.
        for (key, value) in &merged.set_variables {
            self.state.variables.insert(key.clone(), value.clone());
        }
        if let Some(achievement) = &merged.achievement_id {
            self.record_achievement(achievement);
        }

        let mut out = Vec::new();
        match merged.next_event_id.as_deref() {
            Some(next_id) => {
                self.abandon_pending(&suspension);
                self.branch_into(next_id, &mut out);
            }
            None => self.resume(suspension, &mut out),
        }
        out
    }

    /// Store submitted free text and resume the pending messages.
    ///
    /// Symmetric to [`Self::select_option`]; stale ids are a logged no-op.
    pub fn submit_input(&mut self, message_id: &str, text: &str) -> Vec<OutboundMessage> {
        let Some(suspension) = self.state.suspension.as_ref() else {
            warn!(message_id, "input submitted while nothing is awaited");
            return Vec::new();
        };
        if suspension.message.id != message_id {
            warn!(
                message_id,
                awaited = %suspension.message.id,
                "stale input, ignoring"
            );
            return Vec::new();
        }

        let suspension = self
            .state
            .suspension
            .take()
            .unwrap_or_else(|| unreachable!("checked above"));
        let key = suspension
            .message
            .input
            .as_ref()
            .and_then(|i| i.variable_key.clone())
            .unwrap_or_else(|| self.default_input_key.to_string());
        self.state
            .variables
            .insert(key, Value::Text(text.to_string()));

        let mut out = Vec::new();
        self.resume(suspension, &mut out);
        out
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    fn process_daily_event(&mut self, event: &DailyEvent, out: &mut Vec<OutboundMessage>) {
        if !self.state.active_branches.insert(event.id.clone()) {
            warn!(event = %event.id, "event already open in this pass, skipping");
            return;
        }
        let Some(variant) = crate::variant::select(&event.variants, &self.state.variables, self.rng)
        else {
            // Silent skip: no variant's conditions were satisfied.
            debug!(event = %event.id, "no eligible variant");
            self.state.active_branches.remove(&event.id);
            return;
        };
        debug!(event = %event.id, variant = %variant.id, "emitting daily event");
        self.emit_list(
            &event.id,
            Some(event.id.clone()),
            &variant.messages,
            variant.set_variables.clone(),
            None,
            out,
        );
    }

    fn process_plot_event(&mut self, event: &PlotEvent, out: &mut Vec<OutboundMessage>) {
        if !self.state.active_branches.insert(event.id.clone()) {
            warn!(event = %event.id, "plot event already open, skipping");
            return;
        }
        debug!(event = %event.id, day = self.state.day_in_journey, "emitting plot event");
        self.emit_list(
            &event.id,
            None,
            &event.messages,
            event.set_variables.clone(),
            Some(event.id.clone()),
            out,
        );
    }

    /// Branch into a daily event from the top, guarding against
    /// re-entering an event still open in this synchronous resume.
    fn branch_into(&mut self, event_id: &str, out: &mut Vec<OutboundMessage>) {
        if self.state.active_branches.contains(event_id) {
            warn!(event = %event_id, "branch target already open, refusing re-entry");
            return;
        }
        let Some(event) = self.script.daily_event(event_id).cloned() else {
            warn!(event = %event_id, "branch target not found in script");
            return;
        };
        // Branched invocations bypass the trigger and do not count as the
        // event's daily firing.
        self.process_daily_event(&event, out);
    }

    /// Resume the snapshot taken at suspension time.
    fn resume(&mut self, suspension: Suspension, out: &mut Vec<OutboundMessage>) {
        let owner = suspension
            .complete_plot_event
            .clone()
            .or_else(|| suspension.event_id.clone())
            .unwrap_or_default();
        self.emit_list(
            &owner,
            suspension.event_id,
            &suspension.pending_messages,
            suspension.deferred_set_variables,
            suspension.complete_plot_event,
            out,
        );
    }

    /// Discard a suspension without resuming it (branching replaces the
    /// pending remainder). The abandoned event's deferred mutations are
    /// dropped: its message list never drained.
    fn abandon_pending(&mut self, suspension: &Suspension) {
        let owner = suspension
            .complete_plot_event
            .as_deref()
            .or(suspension.event_id.as_deref())
            .unwrap_or_default();
        debug!(event = %owner, pending = suspension.pending_messages.len(), "branching away from pending messages");
        if !owner.is_empty() {
            self.state.active_branches.remove(owner);
        }
    }

    /// Emit messages in order until the list drains or a message
    /// requires a response. On drain: deferred mutations apply exactly
    /// once, plot completion is recorded, and the branch closes.
    fn emit_list(
        &mut self,
        owner_id: &str,
        event_id: Option<String>,
        messages: &[ScriptMessage],
        deferred: VariableMap,
        complete_plot_event: Option<String>,
        out: &mut Vec<OutboundMessage>,
    ) {
        for (index, message) in messages.iter().enumerate() {
            out.extend(self.render_message(message));
            if message.requires_response() {
                self.state.suspension = Some(Suspension {
                    message: message.clone(),
                    event_id,
                    pending_messages: messages[index + 1..].to_vec(),
                    deferred_set_variables: deferred,
                    complete_plot_event,
                });
                debug!(message = %message.id, "awaiting response");
                return;
            }
        }

        // Drained uninterrupted: apply deferred mutations once.
        for (key, value) in deferred {
            self.state.variables.insert(key, value);
        }
        if let Some(plot_id) = complete_plot_event {
            self.state.completed_plot_events.insert(plot_id);
        }
        self.state.active_branches.remove(owner_id);
    }

    // ------------------------------------------------------------------
    // Rendering
    // ------------------------------------------------------------------

    /// Resolve one script message into one or more outbound messages
    /// (a `|||` content sequence fans out; the final part carries the
    /// message id and any interactive payload).
    fn render_message(&mut self, message: &ScriptMessage) -> Vec<OutboundMessage> {
        let literal = message.content.clone().unwrap_or_default();
        let parts = match &message.content_key {
            Some(key) => {
                self.content
                    .resolve(&SemanticKey::new(key.clone()), &[], &literal, self.rng)
            }
            None => vec![literal],
        };

        let last = parts.len().saturating_sub(1);
        parts
            .iter()
            .enumerate()
            .map(|(i, part)| {
                let text =
                    template::apply_with(part, &self.state.variables, self.max_template_passes);
                if i < last {
                    OutboundMessage {
                        id: format!("{}.part{}", message.id, i + 1),
                        sender: message.sender,
                        kind: MessageKind::Text,
                        text,
                        delay_ms: message.delay_ms,
                        properties: message.properties.clone(),
                        options: Vec::new(),
                    }
                } else {
                    OutboundMessage {
                        id: message.id.clone(),
                        sender: message.sender,
                        kind: message.kind,
                        text,
                        delay_ms: message.delay_ms,
                        properties: message.properties.clone(),
                        options: message
                            .options
                            .iter()
                            .map(|o| self.render_option(o))
                            .collect(),
                    }
                }
            })
            .collect()
    }

    fn render_option(&mut self, option: &MessageOption) -> OutboundOption {
        let literal = option.label.clone().unwrap_or_else(|| option.id.clone());
        let label = match &option.label_key {
            Some(key) => self.content.resolve_text(
                &SemanticKey::new(key.clone()),
                &[],
                &literal,
                self.rng,
            ),
            None => literal,
        };
        OutboundOption {
            id: option.id.clone(),
            label: template::apply_with(&label, &self.state.variables, self.max_template_passes),
        }
    }

    fn record_achievement(&mut self, achievement_id: &str) {
        let entry = self
            .state
            .variables
            .entry(ACHIEVEMENTS_KEY.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = entry {
            items.push(Value::Text(achievement_id.to_string()));
        }
        debug!(achievement = achievement_id, "achievement recorded");
    }
}

/// Owned copy of a scheduled event; processing mutates state while the
/// script stays borrowed, so the scheduler's borrow must end first.
enum OwnedEligible {
    Plot(PlotEvent),
    Daily(DailyEvent),
}

/// Merge an option's own fields with the owning event's response for
/// that option id; response values take precedence.
fn merge_response(option: &MessageOption, response: &EventResponse) -> EventResponse {
    let mut set_variables = option.set_variables.clone();
    for (key, value) in &response.set_variables {
        set_variables.insert(key.clone(), value.clone());
    }
    EventResponse {
        next_event_id: response
            .next_event_id
            .clone()
            .or_else(|| option.next_event_id.clone()),
        set_variables,
        achievement_id: response
            .achievement_id
            .clone()
            .or_else(|| option.achievement_id.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
