//! # nudge-remote — HTTP script delivery
//!
//! Implements the script repository's remote seam over HTTP:
//! version manifests and full script documents, with timeouts and
//! bounded retries. The repository in `nudge-script` degrades through
//! its cache tiers when this source fails, so every error here is
//! recoverable by design.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod error;

pub use client::HttpScriptSource;
pub use error::RemoteError;
