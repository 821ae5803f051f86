//! Trigger scheduling — which events are eligible at a given instant.
//!
//! Plot events come first: the `day_<n>` key for the current journey day,
//! gated by the day-level conditions, then each event's own conditions,
//! skipping events already completed. Daily events follow: the trigger
//! kind must be one the engine interprets (`time_window`), the instant
//! must fall inside the window, the trigger's conditions must pass, and
//! events that already fired today are skipped. Eligible daily events are
//! sorted descending by priority with a stable sort, so ties keep
//! authoring order.

use chrono::{NaiveDateTime, NaiveTime};
use tracing::debug;

use crate::condition;
use crate::script::{DailyEvent, PlotEvent, Script, Trigger};
use crate::state::ConversationState;

/// One schedulable unit, in firing order.
#[derive(Debug, Clone, Copy)]
pub enum Eligible<'a> {
    /// A one-time plot beat for the current journey day.
    Plot(&'a PlotEvent),
    /// A recurring daily event.
    Daily(&'a DailyEvent),
}

impl Eligible<'_> {
    /// The underlying event id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Eligible::Plot(e) => &e.id,
            Eligible::Daily(e) => &e.id,
        }
    }
}

/// Events eligible to fire at `now`, plot first, then daily events in
/// descending priority.
#[must_use]
pub fn eligible_events<'a>(
    script: &'a Script,
    state: &ConversationState,
    now: NaiveDateTime,
) -> Vec<Eligible<'a>> {
    let mut eligible = Vec::new();

    if let Some(day) = script.plot_day(state.day_in_journey) {
        if condition::evaluate(&day.conditions, &state.variables) {
            for event in &day.events {
                if state.completed_plot_events.contains(&event.id) {
                    continue;
                }
                if condition::evaluate(&event.conditions, &state.variables) {
                    eligible.push(Eligible::Plot(event));
                }
            }
        }
    }

    let mut daily: Vec<&DailyEvent> = script
        .daily_events
        .iter()
        .filter(|event| !state.fired_today.contains(&event.id))
        .filter(|event| trigger_fires(&event.trigger, now))
        .filter(|event| condition::evaluate(&event.trigger.conditions, &state.variables))
        .collect();
    // Stable: ties keep authoring order.
    daily.sort_by_key(|event| std::cmp::Reverse(event.priority));
    eligible.extend(daily.into_iter().map(Eligible::Daily));

    eligible
}

/// Whether the trigger's own gate (ignoring conditions) admits `now`.
fn trigger_fires(trigger: &Trigger, now: NaiveDateTime) -> bool {
    match trigger.kind.as_str() {
        "time_window" => {
            let (Some(start), Some(end)) = (
                parse_local_time(trigger.start.as_deref()),
                parse_local_time(trigger.end.as_deref()),
            ) else {
                debug!(kind = %trigger.kind, "time_window trigger missing or unparsable bounds");
                return false;
            };
            let t = now.time();
            if start <= end {
                t >= start && t <= end
            } else {
                // Overnight window, e.g. 22:00-02:00: wraps midnight.
                t >= start || t <= end
            }
        }
        // Opaque extension point: unknown kinds never fire here.
        other => {
            debug!(kind = %other, "unknown trigger kind, skipping");
            false
        }
    }
}

fn parse_local_time(s: Option<&str>) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s?, "%H:%M").ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
