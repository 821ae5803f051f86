//! Configuration for the Nudge script engine.
//!
//! Maps directly to `nudge.toml`.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NudgeConfig {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,
    /// Script repository cache tiers and remote gating.
    #[serde(default)]
    pub repository: RepositoryConfig,
    /// Content library settings.
    #[serde(default)]
    pub content: ContentConfig,
    /// Template engine settings.
    #[serde(default)]
    pub template: TemplateConfig,
    /// State store / persistence settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Flow / engine runtime settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl NudgeConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ScriptError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> crate::error::Result<Self> {
        toml::from_str(toml_str).map_err(|e| crate::ScriptError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// General system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Whether the conversation engine is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: "info".to_string(),
        }
    }
}

/// Script repository cache tiers (see `repository` module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Local persistent script cache TTL in days.
    #[serde(default = "default_7")]
    pub local_cache_ttl_days: u32,
    /// Remote version-check TTL in hours (bounds metadata traffic).
    #[serde(default = "default_24")]
    pub version_check_ttl_hours: u32,
    /// Language requested when the caller's language is unavailable.
    #[serde(default = "default_language")]
    pub default_language: String,
    /// Max entries in the in-process script cache.
    #[serde(default = "default_4_usize")]
    pub in_process_cache_size: usize,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            local_cache_ttl_days: 7,
            version_check_ttl_hours: 24,
            default_language: "en".to_string(),
            in_process_cache_size: 4,
        }
    }
}

/// Content library settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    /// Root directory of per-bucket content files.
    #[serde(default = "default_content_dir")]
    pub dir: String,
    /// Globally shared legacy/default bucket, the last ladder rung before
    /// the caller-supplied literal.
    #[serde(default = "default_shared_bucket")]
    pub shared_bucket: String,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            dir: "content".to_string(),
            shared_bucket: "shared.default".to_string(),
        }
    }
}

/// Template engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Iteration cap for the substitution fixpoint loop.
    #[serde(default = "default_8_usize")]
    pub max_passes: usize,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self { max_passes: 8 }
    }
}

/// State store / persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// Number of rotating backups to keep.
    #[serde(default = "default_3")]
    pub backup_count: u32,
    /// Cap on history rows returned by a single query.
    #[serde(default = "default_200_usize")]
    pub history_query_cap: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            wal_mode: true,
            backup_count: 3,
            history_query_cap: 200,
        }
    }
}

/// Flow / engine runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed RNG seed for deterministic runs; `None` seeds from entropy.
    #[serde(default)]
    pub rng_seed: Option<u64>,
    /// Variable key free-text input is stored under when the message's
    /// input config does not declare one.
    #[serde(default = "default_input_key")]
    pub default_input_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rng_seed: None,
            default_input_key: "session.last_input".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_language() -> String { "en".to_string() }
fn default_content_dir() -> String { "content".to_string() }
fn default_shared_bucket() -> String { "shared.default".to_string() }
fn default_input_key() -> String { "session.last_input".to_string() }
fn default_3() -> u32 { 3 }
fn default_7() -> u32 { 7 }
fn default_24() -> u32 { 24 }
fn default_4_usize() -> usize { 4 }
fn default_8_usize() -> usize { 8 }
fn default_200_usize() -> usize { 200 }

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = NudgeConfig::default();
        assert_eq!(config.repository.local_cache_ttl_days, 7);
        assert_eq!(config.repository.version_check_ttl_hours, 24);
        assert_eq!(config.repository.default_language, "en");
        assert_eq!(config.engine.default_input_key, "session.last_input");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = NudgeConfig::from_toml(
            r#"
            [repository]
            default_language = "de"
            "#,
        )
        .expect("parse");
        assert_eq!(config.repository.default_language, "de");
        assert_eq!(config.repository.local_cache_ttl_days, 7);
        assert!(config.general.enabled);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = NudgeConfig::from_toml("repository = 3").unwrap_err();
        assert!(matches!(err, crate::ScriptError::Config(_)));
    }
}
