//! Content library and the semantic-key fallback ladder.
//!
//! Content lives in per-bucket UTF-8 text files: one candidate line per
//! variant, blank lines ignored, and an optional `|||` delimiter splitting
//! one line into an ordered sequence of separately-paced sub-messages.
//! The file `bot/acknowledge/completion.txt` backs the semantic key
//! `bot.acknowledge.completion`.
//!
//! Resolution walks the authoring fallback ladder, most specific first:
//!
//! 1. the exact key (context tags appended as extra modifiers);
//! 2. the key with trailing modifiers dropped one at a time, down to
//!    `actor.action.subject`;
//! 3. a generic-subject variant (the subject's qualifier dropped —
//!    heuristically everything after the subject's head word);
//! 4. `actor.action`;
//! 5. `actor`;
//! 6. the globally shared default bucket;
//! 7. the caller-supplied literal (always present, caller's duty).
//!
//! A bucket holding several candidates is picked from uniformly at
//! random; given a fixed RNG seed resolution is deterministic.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, trace};

use crate::error::Result;
use crate::types::SemanticKey;

/// One candidate rendering: one or more `|||`-separated parts.
pub type Candidate = Vec<String>;

/// In-memory content set, keyed by semantic bucket.
#[derive(Debug, Clone, Default)]
pub struct ContentLibrary {
    buckets: HashMap<String, Vec<Candidate>>,
    shared_bucket: String,
}

impl ContentLibrary {
    /// An empty library with the given shared default bucket key.
    #[must_use]
    pub fn new(shared_bucket: impl Into<String>) -> Self {
        Self {
            buckets: HashMap::new(),
            shared_bucket: shared_bucket.into(),
        }
    }

    /// Load every `.txt` file under `root`, mapping relative paths to
    /// bucket keys (`bot/acknowledge/completion.txt` →
    /// `bot.acknowledge.completion`).
    ///
    /// # Errors
    /// I/O errors reading the tree. A missing root is not an error; it
    /// yields an empty library (the literal fallback still works).
    pub fn from_dir(root: &Path, shared_bucket: impl Into<String>) -> Result<Self> {
        let mut library = Self::new(shared_bucket);
        if !root.exists() {
            debug!(root = %root.display(), "content root missing, starting empty");
            return Ok(library);
        }

        let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries: Vec<_> =
                std::fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
            entries.sort_by_key(std::fs::DirEntry::path);
            for entry in entries {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == "txt") {
                    let rel = path
                        .strip_prefix(root)
                        .unwrap_or(&path)
                        .with_extension("");
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join(".");
                    let text = std::fs::read_to_string(&path)?;
                    library.insert_bucket(&key, &text);
                }
            }
        }

        debug!(buckets = library.buckets.len(), "content library loaded");
        Ok(library)
    }

    /// Load the library described by `config`: every `.txt` file under
    /// its content root, with its shared default bucket.
    ///
    /// # Errors
    /// I/O errors reading the tree; a missing root yields an empty
    /// library, as with [`Self::from_dir`].
    pub fn from_config(config: &crate::config::ContentConfig) -> Result<Self> {
        Self::from_dir(Path::new(&config.dir), config.shared_bucket.clone())
    }

    /// Parse bucket file text and register it under `key`.
    pub fn insert_bucket(&mut self, key: &str, text: &str) {
        let candidates: Vec<Candidate> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.split("|||")
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect()
            })
            .filter(|parts: &Candidate| !parts.is_empty())
            .collect();
        if !candidates.is_empty() {
            self.buckets.insert(key.to_string(), candidates);
        }
    }

    /// Number of loaded buckets.
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Resolve a semantic key down the fallback ladder.
    ///
    /// `context_tags` are appended as extra modifiers before laddering.
    /// `literal` is the hard-coded fallback and must always be supplied;
    /// it is returned (as a single part) when nothing resolves.
    pub fn resolve<R: Rng>(
        &self,
        key: &SemanticKey,
        context_tags: &[&str],
        literal: &str,
        rng: &mut R,
    ) -> Candidate {
        let tagged = key.with_tags(context_tags);
        for rung in self.ladder(&tagged) {
            if let Some(candidates) = self.buckets.get(&rung) {
                let pick = rng.gen_range(0..candidates.len());
                trace!(key = %tagged, rung = %rung, pick, "content resolved");
                return candidates[pick].clone();
            }
        }
        trace!(key = %tagged, "content miss, using literal fallback");
        vec![literal.to_string()]
    }

    /// Single-string convenience for labels: the first part of the
    /// resolved candidate.
    pub fn resolve_text<R: Rng>(
        &self,
        key: &SemanticKey,
        context_tags: &[&str],
        literal: &str,
        rng: &mut R,
    ) -> String {
        self.resolve(key, context_tags, literal, rng)
            .into_iter()
            .next()
            .unwrap_or_else(|| literal.to_string())
    }

    /// The ordered rungs checked for a key, strictly descending in
    /// specificity.
    fn ladder(&self, key: &SemanticKey) -> Vec<String> {
        let segments = key.segments();
        let mut rungs = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut push = |rung: String| {
            if !rung.is_empty() && seen.insert(rung.clone()) {
                rungs.push(rung);
            }
        };

        if segments.is_empty() {
            push(self.shared_bucket.clone());
            return rungs;
        }

        // Full key, then drop trailing modifiers down to actor.action.subject.
        let base_len = segments.len().min(3);
        for n in (base_len..=segments.len()).rev() {
            push(segments[..n].join("."));
        }

        // Generic subject: drop the qualifier after the subject's head word.
        if segments.len() >= 3 {
            let head = segments[2].split('_').next().unwrap_or(segments[2]);
            if head != segments[2] {
                push(format!("{}.{}.{head}", segments[0], segments[1]));
            }
        }

        // Action-level, then actor-level defaults.
        if segments.len() >= 2 {
            push(segments[..2].join("."));
        }
        push(segments[0].to_string());

        // Globally shared legacy/default bucket.
        push(self.shared_bucket.clone());

        rungs
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
