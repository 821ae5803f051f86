//! Durable conversational state and its SQLite store.
//!
//! The store is a plain key/value table plus an append-only message
//! history and cache-expiry metadata:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS kv_state (
//!     key        TEXT PRIMARY KEY,
//!     value      TEXT NOT NULL,
//!     updated_at TEXT NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS history (
//!     id     TEXT PRIMARY KEY,
//!     at     TEXT NOT NULL,
//!     sender TEXT NOT NULL,
//!     kind   TEXT NOT NULL,
//!     body   TEXT NOT NULL
//! );
//! CREATE TABLE IF NOT EXISTS cache_meta (
//!     key         TEXT PRIMARY KEY,
//!     saved_at    TEXT NOT NULL,
//!     ttl_seconds INTEGER NOT NULL
//! );
//! ```
//!
//! JSON inside TEXT columns keeps the schema stable across state-shape
//! changes (forward-compatible); WAL mode allows concurrent reads while
//! the single writer (the flow controller's owner) mutates.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PersistenceConfig;
use crate::error::{Result, ScriptError};
use crate::script::{Script, ScriptMessage};
use crate::types::VariableMap;

/// Well-known key the conversation state is persisted under.
pub const STATE_KEY: &str = "conversation_state";

// ---------------------------------------------------------------------------
// Conversation state
// ---------------------------------------------------------------------------

/// A flow suspended on user input, serialized so it survives restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suspension {
    /// The interactive message whose response is awaited.
    pub message: ScriptMessage,
    /// Owning daily event (for `responses` merging); `None` for plot events.
    pub event_id: Option<String>,
    /// Not-yet-emitted messages of the current event/variant.
    pub pending_messages: Vec<ScriptMessage>,
    /// Variant/event mutations deferred until the list drains.
    pub deferred_set_variables: VariableMap,
    /// Plot event to mark completed once the list drains.
    pub complete_plot_event: Option<String>,
}

/// The durable record every engine component reads and the flow mutates.
///
/// Owned by exactly one user/session; created on first run, mutated on
/// every event and response, never deleted except by an explicit reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    /// Version of the script this state last ran against.
    pub script_version: String,
    /// Journey-day counter, `>= 1`; advances at most once per calendar
    /// day of real use.
    pub day_in_journey: u32,
    /// Event ids currently open (re-entry guard for branching).
    #[serde(default)]
    pub active_branches: HashSet<String>,
    /// The arbitrary key/value variable map.
    #[serde(default)]
    pub variables: VariableMap,
    /// Plot events that already ran (one-time content).
    #[serde(default)]
    pub completed_plot_events: HashSet<String>,
    /// Daily events that already fired today; cleared on day advance.
    #[serde(default)]
    pub fired_today: HashSet<String>,
    /// Suspended flow, if any.
    #[serde(default)]
    pub suspension: Option<Suspension>,
    /// Instant of the last processed interaction, stored on the caller's
    /// clock; `None` until the first interaction anchors it.
    #[serde(default)]
    pub last_interaction: Option<DateTime<Utc>>,
}

impl ConversationState {
    /// Fresh state for a first run against `script`, seeded with the
    /// script's global variable defaults.
    #[must_use]
    pub fn fresh(script: &Script) -> Self {
        Self {
            script_version: script.version.clone(),
            day_in_journey: 1,
            active_branches: HashSet::new(),
            variables: script.global_variables.clone(),
            completed_plot_events: HashSet::new(),
            fired_today: HashSet::new(),
            suspension: None,
            last_interaction: None,
        }
    }

    /// Advance the journey day if `now` falls on a later calendar day
    /// than the last interaction. At most one advance per real day;
    /// resets the daily-event dedup set.
    ///
    /// The very first call anchors the journey clock to the caller's
    /// `now` instead of advancing: the first day of use is day 1 no
    /// matter what the machine clock reads when the state was created.
    pub fn advance_day_if_needed(&mut self, now: NaiveDateTime) {
        match self.last_interaction {
            None => {
                self.last_interaction = Some(DateTime::from_naive_utc_and_offset(now, Utc));
                debug!("journey clock anchored to first interaction");
            }
            Some(last) if now.date() > last.naive_utc().date() => {
                self.day_in_journey += 1;
                self.fired_today.clear();
                debug!(day = self.day_in_journey, "journey day advanced");
            }
            Some(_) => {}
        }
    }

    /// Merge newer script defaults without clobbering earned state:
    /// only keys the user has never touched are adopted.
    pub fn adopt_script(&mut self, script: &Script) {
        for (key, value) in &script.global_variables {
            self.variables.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self.script_version = script.version.clone();
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One row of the append-only conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row id.
    pub id: Uuid,
    /// When the message was emitted/received.
    pub at: DateTime<Utc>,
    /// Sender tag.
    pub sender: String,
    /// Message kind tag.
    pub kind: String,
    /// Final display text.
    pub body: String,
}

impl HistoryEntry {
    /// New entry stamped now.
    #[must_use]
    pub fn new(sender: &str, kind: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            sender: sender.to_string(),
            kind: kind.to_string(),
            body: body.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// StateStore
// ---------------------------------------------------------------------------

/// Handle to the open SQLite database behind the state-store contract.
pub struct StateStore {
    conn: Connection,
    config: PersistenceConfig,
    db_path: PathBuf,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("db_path", &self.db_path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS kv_state (
        key        TEXT PRIMARY KEY,
        value      TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS history (
        id     TEXT PRIMARY KEY,
        at     TEXT NOT NULL,
        sender TEXT NOT NULL,
        kind   TEXT NOT NULL,
        body   TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS cache_meta (
        key         TEXT PRIMARY KEY,
        saved_at    TEXT NOT NULL,
        ttl_seconds INTEGER NOT NULL
    );
";

impl StateStore {
    /// Open (or create) the database at `path`, creating the schema and
    /// enabling WAL when configured.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), wal = config.wal_mode, "state store opened");

        Ok(Self {
            conn,
            config: config.clone(),
            db_path,
        })
    }

    /// Open an in-memory database (useful for tests).
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &PersistenceConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            config: config.clone(),
            db_path: PathBuf::from(":memory:"),
        })
    }

    // ------------------------------------------------------------------
    // Key/value state
    // ------------------------------------------------------------------

    /// Fetch a stored JSON value.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures. A row whose JSON no
    /// longer parses is treated as absent (corrupt cache = cache miss)
    /// and logged, not surfaced.
    pub fn get_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM kv_state WHERE key = ?1")?;
        let raw: Option<String> = stmt
            .query_row(params![key], |row| row.get(0))
            .optional()?;

        match raw {
            None => Ok(None),
            Some(text) => match serde_json::from_str(&text) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(key, error = %e, "corrupt stored value, treating as miss");
                    Ok(None)
                }
            },
        }
    }

    /// Upsert a JSON value.
    ///
    /// # Errors
    /// [`ScriptError::Serialization`] or [`ScriptError::Database`].
    pub fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let text = serde_json::to_string(value)
            .map_err(|e| ScriptError::Serialization(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO kv_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![key, text, now],
        )?;
        Ok(())
    }

    /// Delete a key. Returns whether a row existed.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn delete_state(&self, key: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    /// Load the persisted [`ConversationState`], if any.
    ///
    /// Corrupt state is logged and reads as absent; first-run code paths
    /// then create a fresh state rather than crash.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn load_conversation(&self) -> Result<Option<ConversationState>> {
        let Some(value) = self.get_state(STATE_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(error = %e, "conversation state no longer deserializes, resetting");
                Ok(None)
            }
        }
    }

    /// Persist the [`ConversationState`].
    ///
    /// # Errors
    /// [`ScriptError::Serialization`] or [`ScriptError::Database`].
    pub fn save_conversation(&self, state: &ConversationState) -> Result<()> {
        let value = serde_json::to_value(state)
            .map_err(|e| ScriptError::Serialization(e.to_string()))?;
        self.save_state(STATE_KEY, &value)
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Append one entry to the conversation log.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        self.conn.execute(
            "INSERT INTO history (id, at, sender, kind, body)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id.to_string(),
                entry.at.to_rfc3339(),
                entry.sender,
                entry.kind,
                entry.body
            ],
        )?;
        Ok(())
    }

    /// The most recent `limit` entries, newest first, capped by the
    /// configured query cap.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>> {
        let limit = limit.min(self.config.history_query_cap);
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, at, sender, kind, body FROM history
             ORDER BY at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let id: String = row.get(0)?;
            let at: String = row.get(1)?;
            Ok((id, at, row.get::<_, String>(2)?, row.get::<_, String>(3)?, row.get::<_, String>(4)?))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, at, sender, kind, body) = row?;
            let (Ok(id), Ok(at)) = (Uuid::parse_str(&id), DateTime::parse_from_rfc3339(&at))
            else {
                warn!(id, "skipping history row with invalid id or timestamp");
                continue;
            };
            entries.push(HistoryEntry {
                id,
                at: at.with_timezone(&Utc),
                sender,
                kind,
                body,
            });
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Cache metadata
    // ------------------------------------------------------------------

    /// Whether a cached entry exists and its TTL has not elapsed.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn is_cache_valid(&self, key: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT saved_at, ttl_seconds FROM cache_meta WHERE key = ?1")?;
        let row: Option<(String, i64)> = stmt
            .query_row(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;

        let Some((saved_at, ttl_seconds)) = row else {
            return Ok(false);
        };
        let Ok(saved_at) = DateTime::parse_from_rfc3339(&saved_at) else {
            warn!(key, "unparsable cache timestamp, treating as expired");
            return Ok(false);
        };
        let age = Utc::now().signed_duration_since(saved_at.with_timezone(&Utc));
        Ok(age.num_seconds() >= 0 && age.num_seconds() <= ttl_seconds)
    }

    /// Record a cache write with its TTL.
    ///
    /// # Errors
    /// [`ScriptError::Database`] on SQLite failures.
    pub fn save_cache_metadata(
        &self,
        key: &str,
        saved_at: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO cache_meta (key, saved_at, ttl_seconds)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                saved_at = excluded.saved_at,
                ttl_seconds = excluded.ttl_seconds",
            params![key, saved_at.to_rfc3339(), ttl.num_seconds()],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Path to the database file (or `:memory:`).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run SQLite's integrity check; `Ok(false)` means corruption.
    ///
    /// # Errors
    /// [`ScriptError::Database`] if the check itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        let result: String = self
            .conn
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }

    /// Back up the database to `dest_path` using SQLite's online-backup
    /// API; safe while the database is in use.
    ///
    /// # Errors
    /// [`ScriptError::Database`] or [`ScriptError::Io`].
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let mut dest = Connection::open(dest_path.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dest)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;
        info!(dest = %dest_path.as_ref().display(), "state store backup completed");
        Ok(())
    }

    /// Create a numbered backup next to the database file, rotating so
    /// at most `config.backup_count` are kept.
    ///
    /// # Errors
    /// [`ScriptError::Database`] or [`ScriptError::Io`].
    pub fn create_rotating_backup(&self) -> Result<()> {
        if self.db_path.as_os_str() == ":memory:" {
            return Ok(());
        }
        let max = self.config.backup_count;
        if max == 0 {
            return Ok(());
        }

        for i in (1..max).rev() {
            let src = self.backup_path(i);
            let dst = self.backup_path(i + 1);
            if src.exists() {
                std::fs::rename(&src, &dst)?;
            }
        }
        let oldest = self.backup_path(max + 1);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }
        self.backup(self.backup_path(1))?;
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut p = self.db_path.clone();
        let ext = format!(
            "{}.bak.{n}",
            p.extension()
                .map_or(String::new(), |e| e.to_string_lossy().into_owned())
        );
        p.set_extension(ext);
        p
    }
}

/// Extension trait adding an `.optional()` combinator to `rusqlite::Result`.
trait OptionalExt<T> {
    /// Convert `QueryReturnedNoRows` into `Ok(None)`.
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
