//! The admission gate: the state machine that turns a submitted
//! `(manifest, signature, content)` triple into one terminal decision.
//!
//! # Phase Ordering
//!
//! ```text
//! RECEIVED -> MANIFEST_VERIFIED -> HASH_CHECKED -> MATCHED -> ALLOWED
//!     |               |                 |             \----> QUARANTINED
//!     \---------------+-----------------+-----------------> REJECTED
//! ```
//!
//! - `RECEIVED -> MANIFEST_VERIFIED`: the signature is checked over the raw
//!   manifest bytes before any manifest field is trusted.
//! - `MANIFEST_VERIFIED -> HASH_CHECKED`: the streamed content digest must
//!   equal the declared digest (constant-time comparison).
//! - `HASH_CHECKED -> MATCHED`: exact, fuzzy, then rule lookup.
//! - `MATCHED -> ALLOWED` on any hit (reason is the strategy) or
//!   `MATCHED -> QUARANTINED` on a total miss. The quarantine store re-hashes
//!   the bytes it takes custody of; if they no longer match, the admission
//!   ends `REJECTED` with [`reason::HASH_MISMATCH`].
//!
//! # Audit Guarantee
//!
//! Every admission holds a scoped pending-decision guard. Each exit path
//! concludes it with exactly one audit write; if the admission unwinds
//! without concluding, the guard's `Drop` records a `reject` with reason
//! [`reason::ADMISSION_ABORTED`].
//!
//! A decision is only returned once its audit line is durable. When the audit
//! write fails the caller gets [`AdmitError::AuditWriteFailed`], never a
//! decision.
//!
//! # Fault Classes
//!
//! Malformed or untrustworthy submissions are terminal rejects and are never
//! retried. Infrastructure faults (registry unavailable, quarantine move
//! failed, audit write failed) are returned as [`AdmitError`] so the caller can
//! retry the whole attempt.

#[cfg(test)]
mod tests;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEntry, AuditError, AuditRecord, AuditSink, DecisionStatus};
use crate::content_hash;
use crate::manifest::{self, ManifestError};
use crate::matcher::{self, MatchResult, MatchStrategy};
use crate::quarantine::{QuarantineError, QuarantineStore};
use crate::registry::{Registry, RegistryError};

/// Reason codes carried by decisions and audit lines.
pub mod reason {
    /// Signature missing, undecodable, or not valid over the manifest bytes.
    pub const SIGNATURE_INVALID: &str = "signature_invalid";
    /// Signature valid but the manifest could not be parsed or validated.
    pub const MANIFEST_MALFORMED: &str = "manifest_malformed";
    /// A submission file could not be read.
    pub const IO_ERROR: &str = "io_error";
    /// Content digest differs from the declared digest.
    pub const HASH_MISMATCH: &str = "hash_mismatch";
    /// No registry strategy matched.
    pub const NO_MATCH: &str = "no_match";
    /// The registry could not be consulted.
    pub const REGISTRY_UNAVAILABLE: &str = "registry_unavailable";
    /// The artifact could not be moved into quarantine.
    pub const QUARANTINE_MOVE_FAILED: &str = "quarantine_move_failed";
    /// The admission ended without reaching a decision.
    pub const ADMISSION_ABORTED: &str = "admission_aborted";
}

/// Infrastructure faults surfaced instead of a decision.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AdmitError {
    /// The decision could not be durably recorded.
    #[error("audit write failed: {0}")]
    AuditWriteFailed(#[source] AuditError),

    /// The unmatched artifact could not be moved into quarantine.
    #[error("quarantine move failed: {0}")]
    QuarantineMoveFailed(#[source] QuarantineError),

    /// The registry could not be queried.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(#[source] RegistryError),
}

/// Paths of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Manifest JSON.
    pub manifest_path: PathBuf,
    /// Base64 signature over the manifest bytes.
    pub signature_path: PathBuf,
    /// Artifact content.
    pub content_path: PathBuf,
}

impl AdmissionRequest {
    /// Creates a request from the three submission paths.
    pub fn new(
        manifest_path: impl Into<PathBuf>,
        signature_path: impl Into<PathBuf>,
        content_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            signature_path: signature_path.into(),
            content_path: content_path.into(),
        }
    }
}

/// Gate states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    /// Submission accepted for processing.
    Received,
    /// Manifest signature verified and manifest parsed.
    ManifestVerified,
    /// Content digest equals the declared digest.
    HashChecked,
    /// Registry consulted.
    Matched,
    /// Terminal: admitted.
    Allowed,
    /// Terminal: moved to quarantine.
    Quarantined,
    /// Terminal: refused.
    Rejected,
}

impl fmt::Display for AdmissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Received => "RECEIVED",
            Self::ManifestVerified => "MANIFEST_VERIFIED",
            Self::HashChecked => "HASH_CHECKED",
            Self::Matched => "MATCHED",
            Self::Allowed => "ALLOWED",
            Self::Quarantined => "QUARANTINED",
            Self::Rejected => "REJECTED",
        })
    }
}

/// The recorded outcome of one admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Terminal status.
    pub status: DecisionStatus,
    /// Reason code: the match strategy for allows, otherwise a
    /// [`reason`] constant.
    pub reason: String,
    /// Content digest, when hashing happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_digest: Option<String>,
    /// Manifest name, when the manifest was trusted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_name: Option<String>,
    /// Winning strategy.
    pub match_strategy: MatchStrategy,
    /// Matching registry entry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_entry_id: Option<i64>,
    /// Quarantine destination.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_path: Option<PathBuf>,
}

/// Orchestrates verification, hashing, matching, quarantine and audit.
///
/// The gate holds no per-admission state; [`AdmissionGate::admit`] may run
/// concurrently from many threads.
pub struct AdmissionGate {
    manifest_key: VerifyingKey,
    registry: Arc<dyn Registry>,
    quarantine: QuarantineStore,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for AdmissionGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("manifest_key", &hex::encode(self.manifest_key.as_bytes()))
            .field("quarantine", &self.quarantine)
            .finish_non_exhaustive()
    }
}

impl AdmissionGate {
    /// Creates a gate from its collaborators.
    #[must_use]
    pub fn new(
        manifest_key: VerifyingKey,
        registry: Arc<dyn Registry>,
        quarantine: QuarantineStore,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            manifest_key,
            registry,
            quarantine,
            audit,
        }
    }

    /// Runs one admission to a terminal decision.
    ///
    /// # Errors
    ///
    /// Returns [`AdmitError`] for infrastructure faults only. Rejections are
    /// `Ok` decisions with [`DecisionStatus::Reject`].
    pub fn admit(&self, request: &AdmissionRequest) -> Result<Decision, AdmitError> {
        let mut pending = PendingDecision::new(self.audit.as_ref());

        let manifest = match manifest::verify_files(
            &request.manifest_path,
            &request.signature_path,
            &self.manifest_key,
        ) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(manifest = %request.manifest_path.display(), error = %e, "manifest rejected");
                return pending.reject(manifest_reason(&e));
            },
        };
        pending.manifest_name = Some(manifest.name.clone());
        pending.advance(AdmissionState::ManifestVerified);

        let digest = match content_hash::digest(&request.content_path) {
            Ok(digest) => digest,
            Err(e) => {
                warn!(error = %e, "artifact unreadable");
                return pending.reject(reason::IO_ERROR);
            },
        };
        pending.artifact_digest = Some(digest.clone());
        if !digests_equal(&manifest.content_digest, &digest) {
            warn!(
                declared = %manifest.content_digest,
                computed = %digest,
                "content digest mismatch"
            );
            return pending.reject(reason::HASH_MISMATCH);
        }
        pending.advance(AdmissionState::HashChecked);

        let matched =
            match matcher::match_artifact(self.registry.as_ref(), &digest, &request.content_path) {
                Ok(matched) => matched,
                Err(RegistryError::Artifact { path, source }) => {
                    warn!(
                        path = %path.display(),
                        error = %source,
                        "artifact unreadable during matching"
                    );
                    return pending.reject(reason::IO_ERROR);
                },
                Err(e) => {
                    error!(%digest, error = %e, "registry lookup failed");
                    pending.fault(reason::REGISTRY_UNAVAILABLE);
                    return Err(AdmitError::RegistryUnavailable(e));
                },
            };
        pending.advance(AdmissionState::Matched);

        if matches!(matched, MatchResult::None) {
            let dest = match self.quarantine.admit(&request.content_path, &digest) {
                Ok(dest) => dest,
                Err(QuarantineError::DigestMismatch { actual, .. }) => {
                    warn!(declared = %digest, %actual, "artifact rewritten during admission");
                    return pending.reject(reason::HASH_MISMATCH);
                },
                Err(e) => {
                    error!(%digest, error = %e, "quarantine move failed");
                    pending.fault(reason::QUARANTINE_MOVE_FAILED);
                    return Err(AdmitError::QuarantineMoveFailed(e));
                },
            };
            return pending.quarantine(dest);
        }
        pending.allow(&matched)
    }
}

fn manifest_reason(err: &ManifestError) -> &'static str {
    match err {
        ManifestError::MalformedManifest { .. } => reason::MANIFEST_MALFORMED,
        ManifestError::Io { .. } => reason::IO_ERROR,
        _ => reason::SIGNATURE_INVALID,
    }
}

fn digests_equal(declared: &str, computed: &str) -> bool {
    declared.as_bytes().ct_eq(computed.as_bytes()).into()
}

/// Scoped guard owning the one audit write of an admission.
struct PendingDecision<'a> {
    sink: &'a dyn AuditSink,
    state: AdmissionState,
    manifest_name: Option<String>,
    artifact_digest: Option<String>,
    concluded: bool,
}

impl<'a> PendingDecision<'a> {
    fn new(sink: &'a dyn AuditSink) -> Self {
        debug!(state = %AdmissionState::Received, "admission started");
        Self {
            sink,
            state: AdmissionState::Received,
            manifest_name: None,
            artifact_digest: None,
            concluded: false,
        }
    }

    fn advance(&mut self, next: AdmissionState) {
        debug!(from = %self.state, to = %next, "admission state transition");
        self.state = next;
    }

    fn reject(self, reason: &str) -> Result<Decision, AdmitError> {
        self.conclude(
            AdmissionState::Rejected,
            DecisionStatus::Reject,
            reason,
            &MatchResult::None,
            None,
        )
    }

    fn allow(self, matched: &MatchResult) -> Result<Decision, AdmitError> {
        let strategy = matched.strategy();
        self.conclude(
            AdmissionState::Allowed,
            DecisionStatus::Allow,
            strategy.as_str(),
            matched,
            None,
        )
    }

    fn quarantine(self, dest: PathBuf) -> Result<Decision, AdmitError> {
        self.conclude(
            AdmissionState::Quarantined,
            DecisionStatus::Quarantine,
            reason::NO_MATCH,
            &MatchResult::None,
            Some(dest),
        )
    }

    /// Records a fail-closed reject for an infrastructure fault. The caller
    /// returns the fault itself, so a failing audit write is only logged.
    fn fault(mut self, reason: &str) {
        self.concluded = true;
        let record = self.record(DecisionStatus::Reject, reason, &MatchResult::None);
        if let Err(e) = self.sink.record(record) {
            error!(error = %e, reason, "failed to audit infrastructure fault");
        }
    }

    fn conclude(
        mut self,
        terminal: AdmissionState,
        status: DecisionStatus,
        reason: &str,
        matched: &MatchResult,
        quarantine_path: Option<PathBuf>,
    ) -> Result<Decision, AdmitError> {
        self.concluded = true;
        self.advance(terminal);
        let record = self.record(status, reason, matched);
        let entry: AuditEntry = self.sink.record(record).map_err(|e| {
            error!(decision = %status, reason, error = %e, "audit write failed");
            AdmitError::AuditWriteFailed(e)
        })?;

        let decision = Decision {
            status,
            reason: reason.to_string(),
            artifact_digest: entry.artifact_digest,
            manifest_name: entry.manifest_name,
            match_strategy: entry.match_strategy,
            registry_entry_id: entry.registry_entry_id,
            quarantine_path,
        };
        info!(
            decision = %decision.status,
            reason = %decision.reason,
            digest = decision.artifact_digest.as_deref().unwrap_or("-"),
            strategy = %decision.match_strategy,
            "admission decided"
        );
        Ok(decision)
    }

    fn record(&self, status: DecisionStatus, reason: &str, matched: &MatchResult) -> AuditRecord {
        AuditRecord {
            decision: status,
            reason: reason.to_string(),
            artifact_digest: self.artifact_digest.clone(),
            manifest_name: self.manifest_name.clone(),
            match_strategy: matched.strategy(),
            registry_entry_id: matched.entry().map(|entry| entry.id),
            match_detail: matched.detail(),
        }
    }
}

impl Drop for PendingDecision<'_> {
    fn drop(&mut self) {
        if self.concluded {
            return;
        }
        error!(state = %self.state, "admission ended without a decision");
        let record = self.record(
            DecisionStatus::Reject,
            reason::ADMISSION_ABORTED,
            &MatchResult::None,
        );
        if let Err(e) = self.sink.record(record) {
            error!(error = %e, "failed to audit aborted admission");
        }
    }
}
