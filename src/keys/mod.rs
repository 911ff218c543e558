//! Authorized key model and the key-source contract.
//!
//! Keys arrive as a JSON list of `{ "type", "key", "alias" }` objects from a
//! provider chosen by URI scheme. They are rendered one per line as
//! `type material alias`, de-duplicated and sorted, so the remote file can be
//! compared by content.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use thiserror::Error;

mod source;
mod step;

pub use source::{KeyLocation, UriKeySource};
pub use step::AuthorizedKeysStep;

/// One public key entry.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct AuthorizedKey {
    /// Algorithm, for example `ssh-ed25519`.
    #[serde(rename = "type")]
    pub key_type: String,
    /// Base64 key material.
    #[serde(rename = "key")]
    pub material: String,
    /// Comment identifying the key owner.
    #[serde(default)]
    pub alias: String,
}

impl AuthorizedKey {
    /// Renders the `authorized_keys` line.
    #[must_use]
    pub fn line(&self) -> String {
        let alias = self.alias.trim();
        if alias.is_empty() {
            format!("{} {}", self.key_type.trim(), self.material.trim())
        } else {
            format!("{} {} {alias}", self.key_type.trim(), self.material.trim())
        }
    }
}

impl fmt::Display for AuthorizedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line())
    }
}

/// Errors raised while fetching or decoding keys.
#[derive(Debug, Error)]
pub enum KeySourceError {
    /// Raised when the URI uses an unknown scheme or is malformed.
    #[error("unsupported key source {uri}: {reason}")]
    InvalidUri {
        /// URI as given.
        uri: String,
        /// What is wrong with it.
        reason: String,
    },
    /// Raised when a local key file cannot be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// Local path.
        path: String,
        /// I/O error text.
        message: String,
    },
    /// Raised when the HTTP client cannot be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    /// Raised when an HTTP request fails.
    #[error("failed to download {url}: {source}")]
    Http {
        /// Requested URL.
        url: String,
        /// Client error.
        #[source]
        source: reqwest::Error,
    },
    /// Raised when an HTTP response is not successful.
    #[error("download of {url} returned HTTP {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// Response status code.
        status: u16,
    },
    /// Raised when the payload is not a key list.
    #[error("key document is not a JSON list of keys: {0}")]
    Decode(#[from] serde_json::Error),
    /// Raised when the document holds no keys.
    #[error("key document contains no keys")]
    Empty,
}

/// Fetches the keys a host should trust.
pub trait KeySource {
    /// Fetches and decodes the keys at `uri`.
    ///
    /// # Errors
    ///
    /// Returns [`KeySourceError`] when the keys cannot be retrieved.
    fn fetch(&self, uri: &str) -> Result<Vec<AuthorizedKey>, KeySourceError>;
}

/// Fixed in-memory key list, handy when keys are already known.
#[derive(Clone, Debug, Default)]
pub struct StaticKeys(pub Vec<AuthorizedKey>);

impl KeySource for StaticKeys {
    fn fetch(&self, _uri: &str) -> Result<Vec<AuthorizedKey>, KeySourceError> {
        if self.0.is_empty() {
            return Err(KeySourceError::Empty);
        }
        Ok(self.0.clone())
    }
}

/// Decodes a JSON key document.
///
/// # Errors
///
/// Returns [`KeySourceError::Decode`] for malformed JSON and
/// [`KeySourceError::Empty`] for an empty list.
pub fn parse_key_document(body: &str) -> Result<Vec<AuthorizedKey>, KeySourceError> {
    let keys: Vec<AuthorizedKey> = serde_json::from_str(body)?;
    if keys.is_empty() {
        return Err(KeySourceError::Empty);
    }
    Ok(keys)
}

/// How fetched keys combine with keys already on the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// The file becomes exactly the fetched set.
    #[default]
    Replace,
    /// Existing lines are kept alongside the fetched set.
    Union,
}

/// Sorted, de-duplicated, trimmed non-empty lines.
#[must_use]
pub fn normalise_lines<'a, I>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    lines
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Lines the remote file should contain.
#[must_use]
pub fn desired_lines(existing: &str, keys: &[AuthorizedKey], policy: MergePolicy) -> Vec<String> {
    let fetched: Vec<String> = keys.iter().map(AuthorizedKey::line).collect();
    match policy {
        MergePolicy::Replace => normalise_lines(fetched.iter().map(String::as_str)),
        MergePolicy::Union => normalise_lines(
            existing
                .lines()
                .chain(fetched.iter().map(String::as_str)),
        ),
    }
}
