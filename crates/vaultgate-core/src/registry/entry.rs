//! Registry entry types and their signed payload.

use std::collections::BTreeMap;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};

use super::RegistryError;
use super::similarity::SimilarityDigest;
use crate::content_hash::normalize_digest;
use crate::crypto::{canonical_json, decode_signature, verify_detached};

/// Key under `meta` holding an entry's rule patterns (array of strings).
pub const RULE_PATTERNS_KEY: &str = "regex_patterns";

/// Maximum number of rule patterns on one entry.
pub const MAX_RULE_PATTERNS: usize = 64;

/// Compiled-size limit for a single rule pattern.
pub const MAX_RULE_PATTERN_SIZE: usize = 1 << 20;

/// Registrar input for a new entry. The registry stamps the timestamp,
/// signer key and signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewRegistryEntry {
    /// Human-readable name of the known artifact.
    pub name: String,
    /// Exact SHA-256 digest (hex).
    pub sha256: Option<String>,
    /// Similarity digest (`blocksize:digest1:digest2`).
    pub similarity_digest: Option<String>,
    /// Tag marking the entry as a rule entry.
    pub rule_tag: Option<String>,
    /// Registrar that vouched for the entry.
    pub author: String,
    /// Free-form metadata; rule patterns live under [`RULE_PATTERNS_KEY`].
    pub meta: BTreeMap<String, serde_json::Value>,
}

impl NewRegistryEntry {
    /// Creates an entry with only a name and author set.
    #[must_use]
    pub fn new(name: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            author: author.into(),
            ..Self::default()
        }
    }

    /// Sets the exact digest.
    #[must_use]
    pub fn with_sha256(mut self, digest: impl Into<String>) -> Self {
        self.sha256 = Some(digest.into());
        self
    }

    /// Sets the similarity digest.
    #[must_use]
    pub fn with_similarity_digest(mut self, digest: impl Into<String>) -> Self {
        self.similarity_digest = Some(digest.into());
        self
    }

    /// Sets the rule tag and its patterns.
    #[must_use]
    pub fn with_rule<I, S>(mut self, tag: impl Into<String>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rule_tag = Some(tag.into());
        let patterns: Vec<serde_json::Value> = patterns
            .into_iter()
            .map(|p| serde_json::Value::String(p.into()))
            .collect();
        self.meta
            .insert(RULE_PATTERNS_KEY.to_string(), serde_json::Value::Array(patterns));
        self
    }

    /// Checks field formats and normalises the digest to lowercase.
    pub(super) fn validate(mut self) -> Result<Self, RegistryError> {
        let invalid = |reason: String| RegistryError::InvalidEntry { reason };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".into()));
        }
        if self.sha256.is_none() && self.similarity_digest.is_none() && self.rule_tag.is_none() {
            return Err(invalid(
                "entry needs at least one of sha256, similarity_digest, rule_tag".into(),
            ));
        }
        if let Some(sha) = self.sha256.take() {
            let normalized = normalize_digest(&sha)
                .ok_or_else(|| invalid(format!("sha256 {sha:?} is not 64 hex characters")))?;
            self.sha256 = Some(normalized);
        }
        if let Some(digest) = &self.similarity_digest {
            digest
                .parse::<SimilarityDigest>()
                .map_err(|e| invalid(e.to_string()))?;
        }
        if self.rule_tag.is_some() {
            let patterns = rule_patterns(&self.meta).ok_or_else(|| {
                invalid(format!("meta.{RULE_PATTERNS_KEY} must be a string array"))
            })?;
            if patterns.is_empty() || patterns.len() > MAX_RULE_PATTERNS {
                return Err(invalid(format!(
                    "rule entries need 1..={MAX_RULE_PATTERNS} patterns, got {}",
                    patterns.len()
                )));
            }
            for pattern in patterns {
                compile_rule(pattern).map_err(|e| invalid(format!("pattern {pattern:?}: {e}")))?;
            }
        }
        Ok(self)
    }
}

/// One stored registry row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Row id; insertion order.
    pub id: i64,
    /// Human-readable name.
    pub name: String,
    /// Exact digest, unique among non-null values.
    pub sha256: Option<String>,
    /// Similarity digest.
    pub similarity_digest: Option<String>,
    /// Rule tag.
    pub rule_tag: Option<String>,
    /// Registrar that vouched for the entry.
    pub author: String,
    /// Insertion time, RFC 3339 UTC.
    pub created_at: String,
    /// Hex Ed25519 key that signed the entry.
    pub signer_public_key: String,
    /// Base64 signature over [`RegistryEntry::signing_payload`].
    pub signature: String,
    /// Free-form metadata.
    pub meta: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    name: &'a str,
    sha256: Option<&'a str>,
    similarity_digest: Option<&'a str>,
    rule_tag: Option<&'a str>,
    author: &'a str,
    created_at: &'a str,
    signer_public_key: &'a str,
    meta: &'a BTreeMap<String, serde_json::Value>,
}

impl RegistryEntry {
    /// Canonical JSON of every field except `id` and `signature`.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `meta` cannot be encoded.
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical_json(&SignedFields {
            name: &self.name,
            sha256: self.sha256.as_deref(),
            similarity_digest: self.similarity_digest.as_deref(),
            rule_tag: self.rule_tag.as_deref(),
            author: &self.author,
            created_at: &self.created_at,
            signer_public_key: &self.signer_public_key,
            meta: &self.meta,
        })
    }

    /// Checks that `trusted` signed the entry.
    ///
    /// The recorded `signer_public_key` must name `trusted`; a row carrying
    /// any other key fails even if it is self-consistent.
    #[must_use]
    pub fn verify_signature(&self, trusted: &VerifyingKey) -> bool {
        if !self
            .signer_public_key
            .eq_ignore_ascii_case(&hex::encode(trusted.as_bytes()))
        {
            return false;
        }
        let Ok(signature) = decode_signature(&self.signature) else {
            return false;
        };
        let Ok(payload) = self.signing_payload() else {
            return false;
        };
        verify_detached(trusted, &payload, &signature).is_ok()
    }

    /// Rule patterns stored under `meta`, empty if none.
    #[must_use]
    pub fn rule_patterns(&self) -> Vec<&str> {
        rule_patterns(&self.meta).unwrap_or_default()
    }
}

fn rule_patterns(meta: &BTreeMap<String, serde_json::Value>) -> Option<Vec<&str>> {
    match meta.get(RULE_PATTERNS_KEY) {
        None => Some(Vec::new()),
        Some(serde_json::Value::Array(items)) => {
            items.iter().map(serde_json::Value::as_str).collect()
        },
        Some(_) => None,
    }
}

/// Compiles a rule pattern under the size limit.
pub(super) fn compile_rule(pattern: &str) -> Result<regex::Regex, regex::Error> {
    regex::RegexBuilder::new(pattern)
        .size_limit(MAX_RULE_PATTERN_SIZE)
        .build()
}
