//! Engine facade — owns the wiring the flow controller borrows.
//!
//! One engine per user/session. Each entry point advances the journey
//! day if a calendar day rolled over, drives the flow controller, logs
//! the traffic to history, and persists the conversation state before
//! returning. After a response resumes the flow, newly satisfied events
//! run in the same call, so a response can chain straight into the next
//! event's messages.

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::config::NudgeConfig;
use crate::content::ContentLibrary;
use crate::error::Result;
use crate::flow::{FlowController, OutboundMessage};
use crate::script::Script;
use crate::state::{ConversationState, HistoryEntry, StateStore};

/// The conversation engine.
pub struct ConversationEngine {
    config: NudgeConfig,
    script: Arc<Script>,
    content: ContentLibrary,
    store: StateStore,
    state: ConversationState,
    rng: StdRng,
}

impl ConversationEngine {
    /// Wire up an engine over an already-loaded script and content set.
    ///
    /// Restores persisted conversation state when present (adopting any
    /// new script defaults without clobbering earned values), otherwise
    /// starts fresh at journey day 1.
    ///
    /// # Errors
    /// [`crate::ScriptError::Database`] if the persisted state cannot be
    /// read.
    pub fn new(
        config: NudgeConfig,
        script: Arc<Script>,
        content: ContentLibrary,
        store: StateStore,
    ) -> Result<Self> {
        let state = match store.load_conversation()? {
            Some(mut state) => {
                if state.script_version != script.version {
                    info!(
                        from = %state.script_version,
                        to = %script.version,
                        "script version changed, adopting new defaults"
                    );
                    state.adopt_script(&script);
                }
                state
            }
            None => {
                info!(script = %script.id, version = %script.version, "starting fresh conversation");
                ConversationState::fresh(&script)
            }
        };
        let rng = match config.engine.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            script,
            content,
            store,
            state,
            rng,
        })
    }

    /// Process everything due at `now`: day rollover, then eligible
    /// events until the queue drains or the flow suspends.
    ///
    /// # Errors
    /// [`crate::ScriptError::Database`] if persisting fails; the emitted
    /// messages are lost in that case, by design of the single writer.
    pub fn tick(&mut self, now: NaiveDateTime) -> Result<Vec<OutboundMessage>> {
        self.state.advance_day_if_needed(now);
        let out = self.flow().run(now);
        self.finish(now, &out)?;
        Ok(out)
    }

    /// Resolve a selected option, then run any events the mutated
    /// variables newly satisfy.
    ///
    /// # Errors
    /// [`crate::ScriptError::Database`] if persisting fails.
    pub fn select_option(
        &mut self,
        message_id: &str,
        option_id: &str,
        now: NaiveDateTime,
    ) -> Result<Vec<OutboundMessage>> {
        self.state.advance_day_if_needed(now);
        self.store
            .append_history(&HistoryEntry::new("user", "option", option_id))?;
        let mut out = self.flow().select_option(message_id, option_id);
        out.extend(self.flow().run(now));
        self.finish(now, &out)?;
        Ok(out)
    }

    /// Store submitted free text, then run any events the mutated
    /// variables newly satisfy.
    ///
    /// # Errors
    /// [`crate::ScriptError::Database`] if persisting fails.
    pub fn submit_input(
        &mut self,
        message_id: &str,
        text: &str,
        now: NaiveDateTime,
    ) -> Result<Vec<OutboundMessage>> {
        self.state.advance_day_if_needed(now);
        self.store
            .append_history(&HistoryEntry::new("user", "input", text))?;
        let mut out = self.flow().submit_input(message_id, text);
        out.extend(self.flow().run(now));
        self.finish(now, &out)?;
        Ok(out)
    }

    /// Discard all conversation state and start over at day 1.
    ///
    /// # Errors
    /// [`crate::ScriptError::Database`] if persisting fails.
    pub fn reset(&mut self) -> Result<()> {
        info!("conversation state reset");
        self.state = ConversationState::fresh(&self.script);
        self.store.save_conversation(&self.state)
    }

    /// Read-only view of the current state.
    #[must_use]
    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    /// The script currently driving the conversation.
    #[must_use]
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// The most recent history entries, newest first.
    ///
    /// # Errors
    /// [`crate::ScriptError::Database`] on SQLite failures.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.store.history(limit)
    }

    fn flow(&mut self) -> FlowController<'_, StdRng> {
        FlowController::new(
            &self.script,
            &self.content,
            &mut self.state,
            &mut self.rng,
            &self.config.engine.default_input_key,
            self.config.template.max_passes,
        )
    }

    /// Log outbound traffic, stamp the interaction, persist.
    fn finish(&mut self, now: NaiveDateTime, out: &[OutboundMessage]) -> Result<()> {
        for message in out {
            self.store.append_history(&HistoryEntry::new(
                message.sender.tag(),
                message.kind.tag(),
                &message.text,
            ))?;
        }
        self.state.last_interaction = Some(DateTime::from_naive_utc_and_offset(now, Utc));
        self.store.save_conversation(&self.state)?;
        debug!(emitted = out.len(), "interaction persisted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use chrono::NaiveDate;

    const SCRIPT: &str = r#"{
        "id": "coach", "version": "1",
        "global_variables": { "session.streak": 0 },
        "daily_events": [ {
            "id": "check_in", "priority": 1,
            "trigger": { "type": "time_window", "start": "06:00", "end": "12:00" },
            "variants": [ {
                "id": "v",
                "messages": [
                    { "id": "m1", "content": "Morning!" },
                    { "id": "m2", "content": "Done yet?",
                      "options": [ { "id": "yes", "label": "Yes",
                                     "set_variables": { "session.streak": 1 } } ] }
                ]
            } ]
        } ]
    }"#;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 8, day)
            .expect("date")
            .and_hms_opt(hour, 0, 0)
            .expect("time")
    }

    fn engine() -> ConversationEngine {
        let mut config = NudgeConfig::default();
        config.engine.rng_seed = Some(3);
        let script = Arc::new(Script::from_json(SCRIPT).expect("script"));
        let store = StateStore::open_in_memory(&PersistenceConfig::default()).expect("store");
        ConversationEngine::new(config, script, ContentLibrary::new("shared.default"), store)
            .expect("engine")
    }

    #[test]
    fn tick_respond_and_daily_dedup() {
        let mut engine = engine();
        let out = engine.tick(at(20, 8)).expect("tick");
        assert_eq!(out.len(), 2);
        assert!(engine.state().suspension.is_some());

        let resumed = engine.select_option("m2", "yes", at(20, 8)).expect("respond");
        assert!(resumed.is_empty());
        assert_eq!(engine.state().variables["session.streak"], 1.into());

        // Already fired today.
        assert!(engine.tick(at(20, 9)).expect("tick").is_empty());
    }

    #[test]
    fn first_tick_stays_on_day_one_regardless_of_machine_clock() {
        // The caller's clock, not the clock at state creation, anchors
        // the journey. A first tick dated far from "now" is still day 1.
        let mut engine = engine();
        let far = NaiveDate::from_ymd_opt(2100, 1, 1)
            .expect("date")
            .and_hms_opt(8, 0, 0)
            .expect("time");
        let out = engine.tick(far).expect("tick");
        assert_eq!(engine.state().day_in_journey, 1);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn template_pass_cap_applies_to_rendering() {
        const NESTED: &str = r#"{
            "id": "s", "version": "1",
            "global_variables": { "a": "{{b}}", "b": "done" },
            "daily_events": [ {
                "id": "e",
                "trigger": { "type": "time_window", "start": "00:00", "end": "23:59" },
                "variants": [ { "id": "v",
                                "messages": [ { "id": "m", "content": "{{a}}" } ] } ]
            } ]
        }"#;
        let build = |max_passes: usize| {
            let mut config = NudgeConfig::default();
            config.engine.rng_seed = Some(1);
            config.template.max_passes = max_passes;
            let script = Arc::new(Script::from_json(NESTED).expect("script"));
            let store =
                StateStore::open_in_memory(&PersistenceConfig::default()).expect("store");
            ConversationEngine::new(config, script, ContentLibrary::new("shared.default"), store)
                .expect("engine")
        };

        // "{{a}}" resolves to "{{b}}" on the first pass; the nested token
        // needs a second one.
        let out = build(8).tick(at(20, 8)).expect("tick");
        assert_eq!(out[0].text, "done");
        let out = build(1).tick(at(20, 8)).expect("tick");
        assert_eq!(out[0].text, "{{b}}");
    }

    #[test]
    fn day_rolls_over_and_event_refires() {
        let mut engine = engine();
        engine.tick(at(20, 8)).expect("tick");
        engine.select_option("m2", "yes", at(20, 8)).expect("respond");

        let out = engine.tick(at(21, 8)).expect("next day");
        assert_eq!(out.len(), 2);
        assert_eq!(engine.state().day_in_journey, 2);
    }

    #[test]
    fn history_records_both_directions() {
        let mut engine = engine();
        engine.tick(at(20, 8)).expect("tick");
        engine.select_option("m2", "yes", at(20, 8)).expect("respond");

        let entries = engine.history(10).expect("history");
        assert!(entries.iter().any(|e| e.sender == "user" && e.body == "yes"));
        assert!(entries.iter().any(|e| e.sender == "bot" && e.body == "Morning!"));
    }

    #[test]
    fn reset_returns_to_day_one() {
        let mut engine = engine();
        engine.tick(at(20, 8)).expect("tick");
        engine.select_option("m2", "yes", at(20, 8)).expect("respond");
        engine.tick(at(21, 8)).expect("tick");
        assert_eq!(engine.state().day_in_journey, 2);

        engine.reset().expect("reset");
        assert_eq!(engine.state().day_in_journey, 1);
        assert_eq!(engine.state().variables["session.streak"], 0.into());
    }
}
