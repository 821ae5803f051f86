//! # Nudge Script Engine
//!
//! Data-driven conversation engine for a chat-first habit coach. Product
//! people author versioned JSON scripts; this crate interprets them:
//!
//! - **Scripts** — daily events, plot days, variants, messages
//! - **Content** — semantic-key text buckets with a fallback ladder
//! - **Templates** — `{{variable}}` substitution with formatters,
//!   fallbacks, pluralization, and boolean fragments
//! - **Conditions** — declarative JSON predicates over the variable map
//! - **Flow** — a suspendable state machine over an event's messages
//! - **State** — one durable SQLite-backed record per user/session
//! - **Repository** — tiered script loading that never fails
//!
//! The engine is timezone-naive by contract: callers pass local wall
//! clock instants and the engine never converts them.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod condition;
pub mod config;
pub mod content;
pub mod engine;
pub mod error;
pub mod flow;
pub mod repository;
pub mod scheduler;
pub mod script;
pub mod state;
pub mod template;
pub mod types;
pub mod variant;

pub use config::NudgeConfig;
pub use content::ContentLibrary;
pub use engine::ConversationEngine;
pub use error::ScriptError;
pub use flow::{OutboundMessage, OutboundOption};
pub use repository::{RemoteScriptSource, ScriptManifest, ScriptRepository};
pub use script::Script;
pub use state::{ConversationState, StateStore};
pub use types::*;
