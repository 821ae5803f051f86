//! Integration tests — end-to-end conversation flows.
//!
//! These exercise complete scenarios across modules: scripted days with
//! suspension and resume, process restarts over the same database file,
//! content-ladder resolution into live messages, and the repository
//! feeding the engine offline.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

use nudge_script::config::{NudgeConfig, PersistenceConfig};
use nudge_script::content::ContentLibrary;
use nudge_script::engine::ConversationEngine;
use nudge_script::repository::{NoRemote, ScriptRepository};
use nudge_script::script::Script;
use nudge_script::state::StateStore;

const SCRIPT: &str = r#"{
    "id": "coach", "version": "1",
    "global_variables": { "session.streak": 0, "user.name": "Alex" },
    "daily_events": [
        {
            "id": "morning_check_in", "priority": 10,
            "trigger": { "type": "time_window", "start": "06:00", "end": "12:00" },
            "variants": [ {
                "id": "v",
                "messages": [
                    { "id": "m1", "content_key": "bot.greet.morning",
                      "content": "Morning, {{user.name}}!" },
                    { "id": "m2", "content": "Warming up..." },
                    { "id": "m3", "content": "Did you do your habit?",
                      "options": [
                          { "id": "yes", "label": "Yes!" },
                          { "id": "no", "label": "Not yet" }
                      ] },
                    { "id": "m4", "content": "{{session.streak:1 day|{{session.streak}} days}} strong." },
                    { "id": "m5", "content": "See you tomorrow!" }
                ],
                "set_variables": { "session.checked_in": true }
            } ],
            "responses": {
                "yes": { "set_variables": { "session.streak": 1 } }
            }
        }
    ],
    "plot_days": {
        "day_1": {
            "events": [
                { "id": "welcome",
                  "messages": [ { "id": "w1", "content": "Welcome, {{user.name}}!" } ] }
            ]
        },
        "day_2": {
            "conditions": { "session.checked_in": true },
            "events": [
                { "id": "day_two_beat",
                  "messages": [ { "id": "d2", "content": "Day two. It gets easier." } ] }
            ]
        }
    }
}"#;

fn at(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 8, day)
        .expect("date")
        .and_hms_opt(hour, 0, 0)
        .expect("time")
}

fn config() -> NudgeConfig {
    let mut config = NudgeConfig::default();
    config.engine.rng_seed = Some(99);
    config
}

fn engine_over(store: StateStore, content: ContentLibrary) -> ConversationEngine {
    let script = Arc::new(Script::from_json(SCRIPT).expect("script"));
    ConversationEngine::new(config(), script, content, store).expect("engine")
}

fn memory_engine() -> ConversationEngine {
    let store = StateStore::open_in_memory(&PersistenceConfig::default()).expect("store");
    engine_over(store, ContentLibrary::new("shared.default"))
}

// ---------------------------------------------------------------------------
// Suspension and resume across a full scripted morning
// ---------------------------------------------------------------------------

#[test]
fn five_message_event_suspends_and_resumes() {
    let mut engine = memory_engine();

    // Day 1 plot beat first, then the daily event up to its question.
    let out = engine.tick(at(20, 8)).expect("tick");
    let ids: Vec<&str> = out.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["w1", "m1", "m2", "m3"]);
    assert_eq!(out[0].text, "Welcome, Alex!");

    // Awaiting: nothing new fires, repeatedly.
    assert!(engine.tick(at(20, 9)).expect("tick").is_empty());
    assert!(engine.tick(at(20, 10)).expect("tick").is_empty());

    // The answer mutates streak before the remainder renders.
    let out = engine.select_option("m3", "yes", at(20, 10)).expect("respond");
    let ids: Vec<&str> = out.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m4", "m5"]);
    assert_eq!(out[0].text, "1 day strong.");

    // The variant's deferred mutation landed exactly once.
    assert_eq!(
        engine.state().variables["session.checked_in"],
        true.into()
    );
}

#[test]
fn variant_mutations_never_apply_while_suspended() {
    let mut engine = memory_engine();
    engine.tick(at(20, 8)).expect("tick");

    assert!(engine.state().suspension.is_some());
    assert!(!engine.state().variables.contains_key("session.checked_in"));
}

// ---------------------------------------------------------------------------
// Restart durability
// ---------------------------------------------------------------------------

#[test]
fn suspended_flow_survives_process_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nudge.db");
    let persistence = PersistenceConfig::default();

    {
        let store = StateStore::open(&db_path, &persistence).expect("open");
        let mut engine = engine_over(store, ContentLibrary::new("shared.default"));
        let out = engine.tick(at(20, 8)).expect("tick");
        assert_eq!(out.last().expect("messages").id, "m3");
    } // engine dropped, "process" gone

    let store = StateStore::open(&db_path, &persistence).expect("reopen");
    let mut engine = engine_over(store, ContentLibrary::new("shared.default"));

    // The awaited question is still pending; a stale id is ignored and
    // the real one resumes exactly where the flow stopped.
    assert!(engine.select_option("m1", "yes", at(20, 9)).expect("stale").is_empty());
    let out = engine.select_option("m3", "yes", at(20, 9)).expect("resume");
    let ids: Vec<&str> = out.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m4", "m5"]);

    // History spans both "processes".
    let entries = engine.history(50).expect("history");
    assert!(entries.iter().any(|e| e.body == "Welcome, Alex!"));
    assert!(entries.iter().any(|e| e.sender == "user" && e.body == "yes"));
}

// ---------------------------------------------------------------------------
// Journey days
// ---------------------------------------------------------------------------

#[test]
fn journey_advances_and_gated_plot_day_fires() {
    let mut engine = memory_engine();
    engine.tick(at(20, 8)).expect("day 1");
    engine.select_option("m3", "yes", at(20, 8)).expect("respond");
    assert_eq!(engine.state().day_in_journey, 1);

    // Next calendar day: day 2's gate (checked_in) holds, so its beat
    // fires before the daily event re-runs.
    let out = engine.tick(at(21, 8)).expect("day 2");
    assert_eq!(engine.state().day_in_journey, 2);
    let ids: Vec<&str> = out.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids[0], "d2");
    assert!(ids.contains(&"m3"));

    // Plot beats are one-time; day 2 content never repeats.
    engine.select_option("m3", "no", at(21, 9)).expect("respond");
    assert!(engine.tick(at(21, 10)).expect("tick").is_empty());
}

#[test]
fn multiple_ticks_same_day_never_advance_journey() {
    let mut engine = memory_engine();
    engine.tick(at(20, 8)).expect("tick");
    engine.select_option("m3", "yes", at(20, 8)).expect("respond");
    engine.tick(at(20, 11)).expect("tick");
    engine.tick(at(20, 23)).expect("tick");
    assert_eq!(engine.state().day_in_journey, 1);
}

// ---------------------------------------------------------------------------
// Content ladder feeding live messages
// ---------------------------------------------------------------------------

#[test]
fn content_directory_resolves_into_messages() {
    let dir = tempfile::tempdir().expect("tempdir");
    let greet_dir = dir.path().join("bot/greet");
    std::fs::create_dir_all(&greet_dir).expect("mkdir");
    std::fs::write(greet_dir.join("morning.txt"), "Rise and shine, {{user.name}}!\n")
        .expect("write");

    let content = ContentLibrary::from_dir(dir.path(), "shared.default").expect("content");
    let store = StateStore::open_in_memory(&PersistenceConfig::default()).expect("store");
    let mut engine = engine_over(store, content);

    let out = engine.tick(at(20, 8)).expect("tick");
    let m1 = out.iter().find(|m| m.id == "m1").expect("m1");
    assert_eq!(m1.text, "Rise and shine, Alex!");
}

#[test]
fn missing_content_falls_back_to_literal() {
    let mut engine = memory_engine();
    let out = engine.tick(at(20, 8)).expect("tick");
    let m1 = out.iter().find(|m| m.id == "m1").expect("m1");
    assert_eq!(m1.text, "Morning, Alex!");
}

// ---------------------------------------------------------------------------
// Repository feeding the engine offline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn offline_repository_still_yields_a_runnable_script() {
    let store = StateStore::open_in_memory(&PersistenceConfig::default()).expect("store");
    let mut repo = ScriptRepository::new(NoRemote, nudge_script::config::RepositoryConfig::default());
    let script = repo.load(&store, "en", false).await;

    let mut engine = ConversationEngine::new(
        config(),
        script,
        ContentLibrary::new("shared.default"),
        store,
    )
    .expect("engine");

    // The bundled script's day-1 welcome plus its morning check-in.
    let out = engine.tick(at(20, 8)).expect("tick");
    assert!(!out.is_empty());
    assert!(out.iter().any(|m| !m.options.is_empty()));
}

// ---------------------------------------------------------------------------
// Script version upgrades
// ---------------------------------------------------------------------------

#[test]
fn new_script_version_adopts_defaults_without_clobbering() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nudge.db");
    let persistence = PersistenceConfig::default();

    {
        let store = StateStore::open(&db_path, &persistence).expect("open");
        let mut engine = engine_over(store, ContentLibrary::new("shared.default"));
        engine.tick(at(20, 8)).expect("tick");
        engine.select_option("m3", "yes", at(20, 8)).expect("respond");
    }

    // Version 2 ships a higher default streak and a new flag.
    let upgraded = SCRIPT
        .replacen("\"version\": \"1\"", "\"version\": \"2\"", 1)
        .replacen(
            "\"session.streak\": 0",
            "\"session.streak\": 10, \"user.plan\": \"free\"",
            1,
        );
    let script = Arc::new(Script::from_json(&upgraded).expect("script"));
    let store = StateStore::open(&db_path, &persistence).expect("reopen");
    let engine = ConversationEngine::new(
        config(),
        script,
        ContentLibrary::new("shared.default"),
        store,
    )
    .expect("engine");

    // Earned streak kept, brand-new key adopted.
    assert_eq!(engine.state().script_version, "2");
    assert_eq!(engine.state().variables["session.streak"], 1.into());
    assert_eq!(engine.state().variables["user.plan"], "free".into());
}
