//! Script repository — tiered loading with remote refresh.
//!
//! `load` never fails. It walks the tiers in order and always hands the
//! engine a usable script:
//!
//! 1. in-process LRU cache (per language);
//! 2. the persistent local cache, while its TTL holds;
//! 3. a remote version check, itself TTL-gated so metadata traffic stays
//!    bounded, reusing the stored script when the version is unchanged;
//! 4. a full remote fetch, falling back to the default language when the
//!    requested one is unavailable;
//! 5. the stored script even past its TTL (stale beats bundled);
//! 6. the bundled asset compiled into the binary;
//! 7. [`Script::minimal`], a hard-coded check-in script.
//!
//! A fetched script that fails validation is rejected and the previous
//! tier's copy stays in service.

use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use lru::LruCache;
use tracing::{debug, info, warn};

use crate::config::RepositoryConfig;
use crate::error::Result;
use crate::script::Script;
use crate::state::StateStore;

/// Script bundled into the binary, the next-to-last fallback tier.
const BUNDLED_SCRIPT: &str = include_str!("../assets/bundled_script.json");

/// Remote metadata answering "what version would a full fetch return".
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScriptManifest {
    /// Version of the script the remote currently serves.
    pub version: String,
}

/// Source of scripts over the wire. The HTTP implementation lives in a
/// separate crate; tests fake it in-process.
#[async_trait]
pub trait RemoteScriptSource: Send + Sync {
    /// Fetch the current manifest for a language.
    async fn fetch_manifest(&self, language: &str) -> Result<ScriptManifest>;

    /// Fetch the full script JSON for a language.
    async fn fetch_script(&self, language: &str) -> Result<String>;
}

/// A source that is never available; for offline/embedded deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRemote;

#[async_trait]
impl RemoteScriptSource for NoRemote {
    async fn fetch_manifest(&self, _language: &str) -> Result<ScriptManifest> {
        Err(crate::ScriptError::Remote(
            "no remote script source configured".to_string(),
        ))
    }

    async fn fetch_script(&self, _language: &str) -> Result<String> {
        Err(crate::ScriptError::Remote(
            "no remote script source configured".to_string(),
        ))
    }
}

/// The tiered script repository.
pub struct ScriptRepository<R: RemoteScriptSource> {
    remote: R,
    config: RepositoryConfig,
    cache: LruCache<String, Arc<Script>>,
}

impl<R: RemoteScriptSource> ScriptRepository<R> {
    /// New repository over the given remote source.
    #[must_use]
    pub fn new(remote: R, config: RepositoryConfig) -> Self {
        let capacity = NonZeroUsize::new(config.in_process_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            remote,
            config,
            cache: LruCache::new(capacity),
        }
    }

    /// Load the script for `language`, walking the tiers. Infallible by
    /// contract: the worst case is the hard-coded minimal script.
    ///
    /// `force_refresh` skips the read-side caches and goes straight to
    /// the remote, still falling back through the lower tiers on failure.
    pub async fn load(
        &mut self,
        store: &StateStore,
        language: &str,
        force_refresh: bool,
    ) -> Arc<Script> {
        if !force_refresh {
            if let Some(script) = self.cache.get(language) {
                debug!(language, "script served from in-process cache");
                return Arc::clone(script);
            }
            if store.is_cache_valid(&cache_key(language)).unwrap_or(false) {
                if let Some(script) = self.stored_script(store, language) {
                    debug!(language, version = %script.version, "script served from local cache");
                    let script = Arc::new(script);
                    self.cache.put(language.to_string(), Arc::clone(&script));
                    return script;
                }
            }
        }

        match self.refresh(store, language, force_refresh).await {
            Ok(script) => {
                info!(language, version = %script.version, "script refreshed");
                let script = Arc::new(script);
                self.cache.put(language.to_string(), Arc::clone(&script));
                return script;
            }
            Err(e) => warn!(language, error = %e, "script refresh failed, falling back"),
        }

        // Stale local copy beats the bundled asset.
        if let Some(script) = self.stored_script(store, language) {
            warn!(language, version = %script.version, "serving stale cached script");
            let script = Arc::new(script);
            self.cache.put(language.to_string(), Arc::clone(&script));
            return script;
        }

        match Script::from_json(BUNDLED_SCRIPT) {
            Ok(script) => {
                warn!(language, "serving bundled fallback script");
                Arc::new(script)
            }
            Err(e) => {
                // Last resort; should be unreachable with a sane build.
                warn!(error = %e, "bundled script unusable, serving minimal script");
                Arc::new(Script::minimal())
            }
        }
    }

    /// Consult the remote: a TTL-gated version check first, then a full
    /// fetch (with language fallback) when the version moved or nothing
    /// usable is stored.
    async fn refresh(
        &mut self,
        store: &StateStore,
        language: &str,
        force_refresh: bool,
    ) -> Result<Script> {
        let stored = self.stored_script(store, language);

        if !force_refresh {
            if let Some(stored) = &stored {
                if store.is_cache_valid(&version_key(language))? {
                    // Version verified recently; renew the stored copy.
                    debug!(language, "version check still fresh, renewing local cache");
                    self.renew_local(store, language)?;
                    return Ok(stored.clone());
                }
                let manifest = self.remote.fetch_manifest(language).await?;
                store.save_cache_metadata(
                    &version_key(language),
                    Utc::now(),
                    Duration::hours(i64::from(self.config.version_check_ttl_hours)),
                )?;
                if manifest.version == stored.version {
                    debug!(language, version = %stored.version, "remote version unchanged");
                    self.renew_local(store, language)?;
                    return Ok(stored.clone());
                }
                info!(
                    language,
                    stored = %stored.version,
                    remote = %manifest.version,
                    "remote script version changed"
                );
            }
        }

        let raw = match self.remote.fetch_script(language).await {
            Ok(raw) => raw,
            Err(e) if language != self.config.default_language => {
                warn!(
                    language,
                    fallback = %self.config.default_language,
                    error = %e,
                    "language unavailable, fetching default language"
                );
                self.remote.fetch_script(&self.config.default_language).await?
            }
            Err(e) => return Err(e),
        };

        // Validation failure rejects the fetch; the caller keeps the
        // previous tier.
        let script = Script::from_json(&raw)?;
        self.persist(store, language, &script)?;
        Ok(script)
    }

    /// The stored script for a language, TTL ignored (staleness is the
    /// caller's concern). Corrupt rows read as absent.
    fn stored_script(&self, store: &StateStore, language: &str) -> Option<Script> {
        let value = store.get_state(&cache_key(language)).ok().flatten()?;
        match serde_json::from_value::<Script>(value) {
            Ok(script) => Some(script),
            Err(e) => {
                warn!(language, error = %e, "stored script no longer deserializes");
                None
            }
        }
    }

    fn persist(&self, store: &StateStore, language: &str, script: &Script) -> Result<()> {
        let value = serde_json::to_value(script)
            .map_err(|e| crate::ScriptError::Serialization(e.to_string()))?;
        store.save_state(&cache_key(language), &value)?;
        self.renew_local(store, language)?;
        store.save_cache_metadata(
            &version_key(language),
            Utc::now(),
            Duration::hours(i64::from(self.config.version_check_ttl_hours)),
        )?;
        Ok(())
    }

    fn renew_local(&self, store: &StateStore, language: &str) -> Result<()> {
        store.save_cache_metadata(
            &cache_key(language),
            Utc::now(),
            Duration::days(i64::from(self.config.local_cache_ttl_days)),
        )
    }
}

fn cache_key(language: &str) -> String {
    format!("script_cache.{language}")
}

fn version_key(language: &str) -> String {
    format!("script_version_check.{language}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use std::sync::Mutex;

    const REMOTE_SCRIPT: &str = r#"{
        "id": "remote", "version": "2.0",
        "daily_events": [ {
            "id": "check_in",
            "trigger": { "type": "time_window", "start": "08:00", "end": "10:00" },
            "variants": [ { "id": "v", "messages": [ { "id": "m", "content": "hi" } ] } ]
        } ]
    }"#;

    /// In-process fake remote recording call counts.
    #[derive(Default)]
    struct FakeRemote {
        version: String,
        script: String,
        languages: Vec<String>,
        manifest_calls: Mutex<usize>,
        fetch_calls: Mutex<usize>,
        fail_all: bool,
    }

    impl FakeRemote {
        fn serving(version: &str, script: &str, languages: &[&str]) -> Self {
            Self {
                version: version.to_string(),
                script: script.to_string(),
                languages: languages.iter().map(|s| (*s).to_string()).collect(),
                ..Self::default()
            }
        }

        fn unavailable() -> Self {
            Self {
                fail_all: true,
                ..Self::default()
            }
        }

        fn manifest_calls(&self) -> usize {
            *self.manifest_calls.lock().expect("lock")
        }

        fn fetch_calls(&self) -> usize {
            *self.fetch_calls.lock().expect("lock")
        }
    }

    #[async_trait]
    impl RemoteScriptSource for &FakeRemote {
        async fn fetch_manifest(&self, _language: &str) -> Result<ScriptManifest> {
            *self.manifest_calls.lock().expect("lock") += 1;
            if self.fail_all {
                return Err(crate::ScriptError::Remote("down".to_string()));
            }
            Ok(ScriptManifest {
                version: self.version.clone(),
            })
        }

        async fn fetch_script(&self, language: &str) -> Result<String> {
            *self.fetch_calls.lock().expect("lock") += 1;
            if self.fail_all || !self.languages.iter().any(|l| l == language) {
                return Err(crate::ScriptError::Remote(format!(
                    "no script for {language}"
                )));
            }
            Ok(self.script.clone())
        }
    }

    fn store() -> StateStore {
        StateStore::open_in_memory(&PersistenceConfig::default()).expect("open")
    }

    fn repo<R: RemoteScriptSource>(remote: R) -> ScriptRepository<R> {
        ScriptRepository::new(remote, RepositoryConfig::default())
    }

    #[tokio::test]
    async fn fetches_persists_and_then_serves_from_memory() {
        let remote = FakeRemote::serving("2.0", REMOTE_SCRIPT, &["en"]);
        let store = store();
        let mut repo = repo(&remote);

        let script = repo.load(&store, "en", false).await;
        assert_eq!(script.version, "2.0");
        assert_eq!(remote.fetch_calls(), 1);

        // Second load hits the in-process cache; no remote traffic.
        let again = repo.load(&store, "en", false).await;
        assert_eq!(again.version, "2.0");
        assert_eq!(remote.fetch_calls(), 1);
        assert_eq!(remote.manifest_calls(), 0);
    }

    #[tokio::test]
    async fn local_cache_survives_repository_restart() {
        let remote = FakeRemote::serving("2.0", REMOTE_SCRIPT, &["en"]);
        let store = store();
        repo(&remote).load(&store, "en", false).await;

        // A fresh repository (empty LRU) reads the persisted copy
        // without touching the remote.
        let script = repo(&remote).load(&store, "en", false).await;
        assert_eq!(script.version, "2.0");
        assert_eq!(remote.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_caches() {
        let remote = FakeRemote::serving("2.0", REMOTE_SCRIPT, &["en"]);
        let store = store();
        let mut repo = repo(&remote);

        repo.load(&store, "en", false).await;
        repo.load(&store, "en", true).await;
        assert_eq!(remote.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn language_falls_back_to_default() {
        let remote = FakeRemote::serving("2.0", REMOTE_SCRIPT, &["en"]);
        let store = store();
        let mut repo = repo(&remote);

        let script = repo.load(&store, "de", false).await;
        assert_eq!(script.version, "2.0");
        // One failed "de" fetch, one successful "en" fetch.
        assert_eq!(remote.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn offline_with_nothing_stored_serves_bundled() {
        let store = store();
        let mut repo = repo(NoRemote);
        let script = repo.load(&store, "en", false).await;
        assert_eq!(script.id, "bundled_fallback");
    }

    #[tokio::test]
    async fn offline_with_stale_store_serves_stale() {
        let store = store();
        let fetched = {
            let remote = FakeRemote::serving("2.0", REMOTE_SCRIPT, &["en"]);
            repo(&remote).load(&store, "en", false).await
        };
        assert_eq!(fetched.version, "2.0");

        // Expire the local cache, then lose the network.
        store
            .save_cache_metadata(
                &cache_key("en"),
                Utc::now() - Duration::days(30),
                Duration::days(7),
            )
            .expect("expire");
        let remote = FakeRemote::unavailable();
        let script = repo(&remote).load(&store, "en", false).await;
        assert_eq!(script.version, "2.0");
    }

    #[tokio::test]
    async fn unchanged_version_renews_without_full_fetch() {
        let store = store();
        let remote = FakeRemote::serving("2.0", REMOTE_SCRIPT, &["en"]);
        repo(&remote).load(&store, "en", false).await;

        // Expire both TTLs so the next load must version-check.
        store
            .save_cache_metadata(
                &cache_key("en"),
                Utc::now() - Duration::days(30),
                Duration::days(7),
            )
            .expect("expire");
        store
            .save_cache_metadata(
                &version_key("en"),
                Utc::now() - Duration::days(30),
                Duration::hours(24),
            )
            .expect("expire");

        let script = repo(&remote).load(&store, "en", false).await;
        assert_eq!(script.version, "2.0");
        assert_eq!(remote.manifest_calls(), 1);
        // No second full fetch: the version matched.
        assert_eq!(remote.fetch_calls(), 1);
        // And the local cache was renewed.
        assert!(store.is_cache_valid(&cache_key("en")).expect("check"));
    }

    #[tokio::test]
    async fn invalid_remote_script_keeps_previous_copy() {
        let store = store();
        let good = FakeRemote::serving("2.0", REMOTE_SCRIPT, &["en"]);
        repo(&good).load(&store, "en", false).await;

        // Expire the caches and serve a structurally broken script.
        store
            .save_cache_metadata(
                &cache_key("en"),
                Utc::now() - Duration::days(30),
                Duration::days(7),
            )
            .expect("expire");
        store
            .save_cache_metadata(
                &version_key("en"),
                Utc::now() - Duration::days(30),
                Duration::hours(24),
            )
            .expect("expire");
        let bad = FakeRemote::serving(
            "3.0",
            r#"{ "id": "remote", "version": "3.0", "daily_events": [
                { "id": "broken",
                  "trigger": { "type": "time_window", "start": "08:00", "end": "10:00" },
                  "variants": [] } ] }"#,
            &["en"],
        );
        let script = repo(&bad).load(&store, "en", false).await;
        assert_eq!(script.version, "2.0");
    }

    #[tokio::test]
    async fn bundled_asset_is_valid() {
        let script = Script::from_json(BUNDLED_SCRIPT).expect("bundled script parses");
        assert!(!script.daily_events.is_empty());
        assert!(script.plot_day(1).is_some());
    }
}
