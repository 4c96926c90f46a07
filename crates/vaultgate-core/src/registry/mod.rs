//! Signature registry: the catalogue of known artifact identities.
//!
//! Each row carries up to three identities, consulted by the matcher in
//! priority order:
//!
//! - **Exact**: the SHA-256 digest, unique among non-null values.
//! - **Fuzzy**: a context-triggered piecewise [`SimilarityDigest`].
//! - **Rule**: text patterns under `meta.regex_patterns`, evaluated against
//!   the artifact's lossily decoded text.
//!
//! # Tamper Evidence
//!
//! Rows are signed at insertion (Ed25519 over the canonical JSON of every
//! field except `id` and `signature`) and are never updated or deleted.
//! A registry is opened with the registrar's public key, provisioned
//! alongside the signing key. Lookups ignore rows not signed by that key,
//! including rows that carry a different key and verify under it.
//!
//! # Ordering
//!
//! Fuzzy and rule lookups walk candidates in insertion (`id`) order and
//! return the first hit, so results are reproducible for a fixed snapshot.

mod entry;
pub mod similarity;
mod storage;


use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;

pub use entry::{
    MAX_RULE_PATTERN_SIZE, MAX_RULE_PATTERNS, NewRegistryEntry, RULE_PATTERNS_KEY, RegistryEntry,
};
pub use similarity::SimilarityDigest;
pub use storage::{MAX_RULE_SCAN_BYTES, SqliteRegistry};
use thiserror::Error;

/// Default fuzzy-match threshold on the `0..=100` score scale.
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 60;

/// Errors raised by registry operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// An entry with the same exact digest already exists.
    #[error("duplicate digest: {digest}")]
    DuplicateDigest {
        /// The conflicting digest.
        digest: String,
    },

    /// The entry failed field validation.
    #[error("invalid registry entry: {reason}")]
    InvalidEntry {
        /// What was wrong.
        reason: String,
    },

    /// The artifact under lookup could not be read.
    #[error("failed to read artifact {path}: {source}")]
    Artifact {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored metadata could not be encoded or decoded.
    #[error("metadata encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The inserting signer is not the registry's trusted registrar.
    #[error("signer {public_key} is not the trusted registrar")]
    UntrustedSigner {
        /// Hex public key of the rejected signer.
        public_key: String,
    },

    /// The writer mutex was poisoned by a panicking thread.
    #[error("registry lock poisoned")]
    LockPoisoned,
}

/// Fuzzy lookup hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarMatch {
    /// Matching entry.
    pub entry: RegistryEntry,
    /// Similarity score, above the threshold.
    pub score: u32,
}

/// Rule lookup hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    /// Matching entry.
    pub entry: RegistryEntry,
    /// The pattern that matched.
    pub pattern: String,
}

/// Re-checks that `trusted` signed `entry`.
#[must_use]
pub fn verify_entry(entry: &RegistryEntry, trusted: &VerifyingKey) -> bool {
    entry.verify_signature(trusted)
}

/// Read-only registry capability handed to the gate.
///
/// Implementations must allow concurrent calls.
pub trait Registry: Send + Sync {
    /// Finds the entry whose `sha256` equals `digest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unavailable.
    fn lookup_exact(&self, digest: &str) -> Result<Option<RegistryEntry>, RegistryError>;

    /// Finds the first entry whose similarity digest scores above the
    /// threshold against the artifact.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact or the store cannot be read.
    fn lookup_similar(&self, artifact: &Path) -> Result<Option<SimilarMatch>, RegistryError>;

    /// Finds the first entry with a rule pattern matching the artifact text.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact or the store cannot be read.
    fn lookup_rule(&self, artifact: &Path) -> Result<Option<RuleMatch>, RegistryError>;
}
