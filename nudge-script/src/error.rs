//! Error types for the Nudge script engine.

use thiserror::Error;

/// Top-level error type for all script-engine operations.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// A script document failed validation and was rejected.
    ///
    /// The repository keeps serving the previous valid version when this
    /// happens; the rejected version is never cached.
    #[error("Script validation failed for {script_id} v{version}: {problems:?}")]
    Validation {
        /// Document id.
        script_id: String,
        /// Rejected version.
        version: String,
        /// Every problem found, not just the first.
        problems: Vec<String>,
    },

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote script delivery failure.
    ///
    /// Wrapped at the repository boundary; `ScriptRepository::load` never
    /// surfaces this to callers, it degrades to the next cache tier.
    #[error("Remote source error: {0}")]
    Remote(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, ScriptError>;
