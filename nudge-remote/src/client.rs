//! HTTP script source — fetches manifests and script documents from the
//! delivery endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use nudge_script::repository::{RemoteScriptSource, ScriptManifest};

use crate::error::RemoteError;

/// Default per-request timeout.
const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// HTTP implementation of the repository's remote seam.
///
/// Endpoints, relative to `base_url`:
///
/// - `GET /scripts/{language}/manifest` → `{ "version": "…" }`
/// - `GET /scripts/{language}` → the full script JSON document
pub struct HttpScriptSource {
    http: Client,
    base_url: String,
    max_retries: u32,
    timeout_ms: u64,
}

impl HttpScriptSource {
    /// New source against a delivery endpoint.
    #[must_use]
    pub fn new(base_url: impl Into<String>, max_retries: u32) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_retries,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Override the per-request timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// GET a path with retries, returning the raw body text.
    async fn get_text(&self, path: &str) -> Result<String, RemoteError> {
        let url = format!("{}{path}", self.base_url);

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                debug!(url = %url, attempt = attempt + 1, "retrying script fetch");
            }

            let start = Instant::now();
            let result = self
                .http
                .get(&url)
                .timeout(Duration::from_millis(self.timeout_ms))
                .send()
                .await;
            let latency_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(resp) => {
                    if resp.status().is_success() {
                        debug!(url = %url, latency_ms, "script fetch succeeded");
                        return resp
                            .text()
                            .await
                            .map_err(|e| RemoteError::Parse(e.to_string()));
                    }
                    last_error = format!("HTTP {}", resp.status());
                    warn!(url = %url, status = %resp.status(), "script endpoint returned error");
                }
                Err(e) => {
                    // Classified by the From impl; the timeout variant
                    // gets the configured budget stamped in.
                    let err = match RemoteError::from(e) {
                        RemoteError::Timeout(_) => RemoteError::Timeout(self.timeout_ms),
                        other => other,
                    };
                    warn!(url = %url, error = %err, "script fetch failed");
                    last_error = err.to_string();
                }
            }
        }

        Err(RemoteError::RetriesExhausted {
            attempts: self.max_retries + 1,
            last_error,
        })
    }
}

#[async_trait]
impl RemoteScriptSource for HttpScriptSource {
    async fn fetch_manifest(&self, language: &str) -> nudge_script::error::Result<ScriptManifest> {
        let body = self.get_text(&format!("/scripts/{language}/manifest")).await?;
        let manifest: ScriptManifest = serde_json::from_str(&body)
            .map_err(|e| RemoteError::Parse(e.to_string()))?;
        Ok(manifest)
    }

    async fn fetch_script(&self, language: &str) -> nudge_script::error::Result<String> {
        Ok(self.get_text(&format!("/scripts/{language}")).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_normalised() {
        let source = HttpScriptSource::new("https://scripts.example.com/", 2);
        assert_eq!(source.base_url, "https://scripts.example.com");
    }

    #[tokio::test]
    async fn unreachable_endpoint_exhausts_retries() {
        // Reserved TEST-NET-1 address; connections fail fast.
        let source = HttpScriptSource::new("http://192.0.2.1:9", 1).with_timeout_ms(200);
        let err = source.fetch_script("en").await.unwrap_err();
        assert!(matches!(err, nudge_script::ScriptError::Remote(_)));
    }

    #[tokio::test]
    async fn timeouts_report_the_configured_budget() {
        // A listener that accepts and never answers forces a request
        // timeout on every attempt.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if let Ok((conn, _)) = listener.accept().await {
                    held.push(conn);
                }
            }
        });

        let source = HttpScriptSource::new(format!("http://{addr}"), 1).with_timeout_ms(100);
        let err = source.fetch_script("en").await.unwrap_err();
        server.abort();

        let text = err.to_string();
        assert!(text.contains("after 2 tries"), "{text}");
        assert!(text.contains("timed out after 100ms"), "{text}");
    }
}
