//! Priority-ordered identity matching over a [`Registry`].
//!
//! Exact identity is tried first, then fuzzy similarity, then text rules.
//! The first hit wins and later strategies are never consulted.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::{Registry, RegistryEntry, RegistryError, RuleMatch, SimilarMatch};

/// Strategy that produced a match, or `none`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStrategy {
    /// Digest equality.
    Exact,
    /// Similarity score above threshold.
    Fuzzy,
    /// Text pattern hit.
    Rule,
    /// No strategy matched.
    None,
}

impl MatchStrategy {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
            Self::Rule => "rule",
            Self::None => "none",
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`match_artifact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// The artifact digest is registered.
    Exact {
        /// Matching entry.
        entry: RegistryEntry,
    },
    /// The artifact is similar to a registered one.
    Fuzzy {
        /// Matching entry.
        entry: RegistryEntry,
        /// Similarity score.
        score: u32,
    },
    /// A registered pattern matched the artifact text.
    Rule {
        /// Matching entry.
        entry: RegistryEntry,
        /// The pattern that matched.
        pattern: String,
    },
    /// Nothing matched.
    None,
}

impl MatchResult {
    /// Strategy that produced this result.
    #[must_use]
    pub const fn strategy(&self) -> MatchStrategy {
        match self {
            Self::Exact { .. } => MatchStrategy::Exact,
            Self::Fuzzy { .. } => MatchStrategy::Fuzzy,
            Self::Rule { .. } => MatchStrategy::Rule,
            Self::None => MatchStrategy::None,
        }
    }

    /// The matching entry, if any.
    #[must_use]
    pub const fn entry(&self) -> Option<&RegistryEntry> {
        match self {
            Self::Exact { entry } | Self::Fuzzy { entry, .. } | Self::Rule { entry, .. } => {
                Some(entry)
            },
            Self::None => None,
        }
    }

    /// Strategy-specific detail: the fuzzy score or the matched pattern.
    #[must_use]
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Fuzzy { score, .. } => Some(score.to_string()),
            Self::Rule { pattern, .. } => Some(pattern.clone()),
            Self::Exact { .. } | Self::None => None,
        }
    }
}

/// Runs exact, fuzzy and rule lookups in that order, stopping at the first
/// hit.
///
/// # Errors
///
/// Propagates the first registry error; later strategies are not tried.
pub fn match_artifact(
    registry: &dyn Registry,
    digest: &str,
    artifact: &Path,
) -> Result<MatchResult, RegistryError> {
    if let Some(entry) = registry.lookup_exact(digest)? {
        debug!(%digest, entry_id = entry.id, "exact match");
        return Ok(MatchResult::Exact { entry });
    }
    if let Some(SimilarMatch { entry, score }) = registry.lookup_similar(artifact)? {
        debug!(%digest, entry_id = entry.id, score, "fuzzy match");
        return Ok(MatchResult::Fuzzy { entry, score });
    }
    if let Some(RuleMatch { entry, pattern }) = registry.lookup_rule(artifact)? {
        debug!(%digest, entry_id = entry.id, %pattern, "rule match");
        return Ok(MatchResult::Rule { entry, pattern });
    }
    debug!(%digest, "no registry match");
    Ok(MatchResult::None)
}

#[cfg(test)]
mod unit_tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn entry(id: i64) -> RegistryEntry {
        RegistryEntry {
            id,
            name: format!("entry-{id}"),
            sha256: None,
            similarity_digest: None,
            rule_tag: None,
            author: "test".into(),
            created_at: "2026-01-01T00:00:00.000Z".into(),
            signer_public_key: String::new(),
            signature: String::new(),
            meta: BTreeMap::new(),
        }
    }

    /// Scripted registry that counts how many lookups were made.
    #[derive(Default)]
    struct Scripted {
        exact: Option<RegistryEntry>,
        similar: Option<SimilarMatch>,
        rule: Option<RuleMatch>,
        calls: AtomicUsize,
    }

    impl Registry for Scripted {
        fn lookup_exact(&self, _: &str) -> Result<Option<RegistryEntry>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.exact.clone())
        }

        fn lookup_similar(&self, _: &Path) -> Result<Option<SimilarMatch>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.similar.clone())
        }

        fn lookup_rule(&self, _: &Path) -> Result<Option<RuleMatch>, RegistryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rule.clone())
        }
    }

    #[test]
    fn exact_short_circuits() {
        let registry = Scripted {
            exact: Some(entry(1)),
            similar: Some(SimilarMatch {
                entry: entry(2),
                score: 99,
            }),
            ..Scripted::default()
        };
        let result = match_artifact(&registry, "d", Path::new("a")).unwrap();
        assert_eq!(result.strategy(), MatchStrategy::Exact);
        assert_eq!(result.entry().map(|e| e.id), Some(1));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fuzzy_beats_rule() {
        let registry = Scripted {
            similar: Some(SimilarMatch {
                entry: entry(2),
                score: 75,
            }),
            rule: Some(RuleMatch {
                entry: entry(3),
                pattern: "x".into(),
            }),
            ..Scripted::default()
        };
        let result = match_artifact(&registry, "d", Path::new("a")).unwrap();
        assert_eq!(result.strategy(), MatchStrategy::Fuzzy);
        assert_eq!(result.detail().as_deref(), Some("75"));
        assert_eq!(registry.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rule_is_last_resort() {
        let registry = Scripted {
            rule: Some(RuleMatch {
                entry: entry(3),
                pattern: "needle".into(),
            }),
            ..Scripted::default()
        };
        let result = match_artifact(&registry, "d", Path::new("a")).unwrap();
        assert_eq!(result.strategy(), MatchStrategy::Rule);
        assert_eq!(result.detail().as_deref(), Some("needle"));
    }

    #[test]
    fn total_miss_is_none() {
        let registry = Scripted::default();
        let result = match_artifact(&registry, "d", Path::new("a")).unwrap();
        assert_eq!(result, MatchResult::None);
        assert!(result.entry().is_none());
        assert_eq!(registry.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn strategy_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&MatchStrategy::Fuzzy).unwrap(), "\"fuzzy\"");
        assert_eq!(MatchStrategy::None.to_string(), "none");
    }
}
