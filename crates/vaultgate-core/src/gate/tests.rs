//! Gate state-machine tests against scripted collaborators.

use std::path::Path;
use std::sync::Mutex;

use ed25519_dalek::{Signer as _, SigningKey};

use super::*;
use crate::content_hash::digest_bytes;
use crate::crypto::{Signer, encode_signature};
use crate::registry::{NewRegistryEntry, RegistryEntry, RuleMatch, SimilarMatch, SqliteRegistry};

const MANIFEST_SEED: [u8; 32] = [0x11; 32];

/// Collects records in memory.
#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(AuditEntry {
            timestamp: "2026-01-01T00:00:00.000Z".into(),
            decision: record.decision,
            reason: record.reason,
            artifact_digest: record.artifact_digest,
            manifest_name: record.manifest_name,
            match_strategy: record.match_strategy,
            registry_entry_id: record.registry_entry_id,
            match_detail: record.match_detail,
            signer_public_key: String::new(),
            prev_digest: None,
            signature: String::new(),
        })
    }
}

struct FailingSink;

impl AuditSink for FailingSink {
    fn record(&self, _: AuditRecord) -> Result<AuditEntry, AuditError> {
        Err(AuditError::Io {
            path: "audit.log".into(),
            source: std::io::Error::other("disk full"),
        })
    }
}

/// Registry whose every lookup fails or panics.
struct BrokenRegistry {
    panic: bool,
}

impl BrokenRegistry {
    fn fail(&self) -> RegistryError {
        assert!(!self.panic, "registry exploded");
        RegistryError::LockPoisoned
    }
}

impl Registry for BrokenRegistry {
    fn lookup_exact(&self, _: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Err(self.fail())
    }

    fn lookup_similar(&self, _: &Path) -> Result<Option<SimilarMatch>, RegistryError> {
        Err(self.fail())
    }

    fn lookup_rule(&self, _: &Path) -> Result<Option<RuleMatch>, RegistryError> {
        Err(self.fail())
    }
}

/// Registry that misses every lookup and overwrites the artifact during the
/// last one, as a submitter racing the gate would.
struct RewritingRegistry {
    replacement: Vec<u8>,
}

impl Registry for RewritingRegistry {
    fn lookup_exact(&self, _: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        Ok(None)
    }

    fn lookup_similar(&self, _: &Path) -> Result<Option<SimilarMatch>, RegistryError> {
        Ok(None)
    }

    fn lookup_rule(&self, artifact: &Path) -> Result<Option<RuleMatch>, RegistryError> {
        std::fs::write(artifact, &self.replacement).unwrap();
        Ok(None)
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    key: SigningKey,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            key: SigningKey::from_bytes(&MANIFEST_SEED),
        }
    }

    fn quarantine(&self) -> QuarantineStore {
        QuarantineStore::new(self.dir.path().join("quarantine")).unwrap()
    }

    fn gate(&self, registry: Arc<dyn Registry>, audit: Arc<dyn AuditSink>) -> AdmissionGate {
        AdmissionGate::new(self.key.verifying_key(), registry, self.quarantine(), audit)
    }

    /// Writes a signed submission declaring `declared` for `content`.
    fn submit(&self, name: &str, content: &[u8], declared: &str) -> AdmissionRequest {
        let manifest = serde_json::to_vec(&serde_json::json!({
            "name": name,
            "content_digest": declared,
        }))
        .unwrap();
        let manifest_path = self.dir.path().join(format!("{name}.json"));
        let signature_path = self.dir.path().join(format!("{name}.sig"));
        let content_path = self.dir.path().join(format!("{name}.bin"));
        std::fs::write(&manifest_path, &manifest).unwrap();
        std::fs::write(&signature_path, encode_signature(&self.key.sign(&manifest))).unwrap();
        std::fs::write(&content_path, content).unwrap();
        AdmissionRequest::new(manifest_path, signature_path, content_path)
    }
}

fn registrar() -> Signer {
    Signer::new(SigningKey::from_bytes(&[0x22; 32]))
}

fn empty_registry() -> SqliteRegistry {
    SqliteRegistry::in_memory(registrar().verifying_key()).unwrap()
}

#[test]
fn exact_match_allows() {
    let fx = Fixture::new();
    let registry = Arc::new(empty_registry());
    let digest = digest_bytes(b"known tool");
    let entry = registry
        .insert(NewRegistryEntry::new("tool", "ops").with_sha256(&digest), &registrar())
        .unwrap();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(registry, sink.clone());

    let decision = gate.admit(&fx.submit("tool", b"known tool", &digest)).unwrap();

    assert_eq!(decision.status, DecisionStatus::Allow);
    assert_eq!(decision.reason, "exact");
    assert_eq!(decision.registry_entry_id, Some(entry.id));
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].match_strategy, MatchStrategy::Exact);
    assert_eq!(records[0].manifest_name.as_deref(), Some("tool"));
}

#[test]
fn rule_match_carries_pattern_detail() {
    let fx = Fixture::new();
    let registry = Arc::new(empty_registry());
    registry
        .insert(
            NewRegistryEntry::new("marker", "ops").with_rule("strings", ["MARKER-[0-9]+"]),
            &registrar(),
        )
        .unwrap();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(registry, sink.clone());
    let content = b"prefix MARKER-42 suffix";

    let decision = gate.admit(&fx.submit("ruled", content, &digest_bytes(content))).unwrap();

    assert_eq!(decision.status, DecisionStatus::Allow);
    assert_eq!(decision.reason, "rule");
    assert_eq!(sink.records()[0].match_detail.as_deref(), Some("MARKER-[0-9]+"));
}

#[test]
fn hash_mismatch_rejects_regardless_of_registry() {
    let fx = Fixture::new();
    let registry = Arc::new(empty_registry());
    let declared = digest_bytes(b"declared");
    registry
        .insert(NewRegistryEntry::new("d", "ops").with_sha256(&declared), &registrar())
        .unwrap();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(registry, sink.clone());

    let decision = gate.admit(&fx.submit("m", b"actual", &declared)).unwrap();

    assert_eq!(decision.status, DecisionStatus::Reject);
    assert_eq!(decision.reason, reason::HASH_MISMATCH);
    assert_eq!(decision.artifact_digest, Some(digest_bytes(b"actual")));
    assert_eq!(std::fs::read_dir(fx.quarantine().dir()).unwrap().count(), 0);
    assert_eq!(sink.records().len(), 1);
}

#[test]
fn bad_signature_rejects_before_hashing() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(Arc::new(empty_registry()), sink.clone());
    let request = fx.submit("s", b"content", &digest_bytes(b"content"));
    std::fs::write(&request.signature_path, "not base64!!").unwrap();

    let decision = gate.admit(&request).unwrap();

    assert_eq!(decision.reason, reason::SIGNATURE_INVALID);
    let record = &sink.records()[0];
    assert!(record.artifact_digest.is_none());
    assert!(record.manifest_name.is_none());
    assert!(request.content_path.exists());
}

#[test]
fn malformed_manifest_rejects() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(Arc::new(empty_registry()), sink.clone());

    let decision = gate.admit(&fx.submit("bad", b"content", "not-a-digest")).unwrap();

    assert_eq!(decision.status, DecisionStatus::Reject);
    assert_eq!(decision.reason, reason::MANIFEST_MALFORMED);
}

#[test]
fn missing_content_rejects_with_io_error() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(Arc::new(empty_registry()), sink.clone());
    let request = fx.submit("gone", b"content", &digest_bytes(b"content"));
    std::fs::remove_file(&request.content_path).unwrap();

    let decision = gate.admit(&request).unwrap();

    assert_eq!(decision.reason, reason::IO_ERROR);
    assert_eq!(sink.records()[0].manifest_name.as_deref(), Some("gone"));
}

#[test]
fn unmatched_artifact_is_quarantined() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(Arc::new(empty_registry()), sink.clone());
    let digest = digest_bytes(b"stranger");

    let decision = gate.admit(&fx.submit("q", b"stranger", &digest)).unwrap();

    assert_eq!(decision.status, DecisionStatus::Quarantine);
    assert_eq!(decision.reason, reason::NO_MATCH);
    assert_eq!(decision.match_strategy, MatchStrategy::None);
    assert_eq!(decision.quarantine_path, Some(fx.quarantine().dir().join(&digest)));
}

#[test]
fn artifact_rewritten_before_quarantine_is_rejected() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let registry = RewritingRegistry {
        replacement: b"swapped payload".to_vec(),
    };
    let gate = fx.gate(Arc::new(registry), sink.clone());
    let digest = digest_bytes(b"original payload");

    let decision = gate.admit(&fx.submit("swap", b"original payload", &digest)).unwrap();

    assert_eq!(decision.status, DecisionStatus::Reject);
    assert_eq!(decision.reason, reason::HASH_MISMATCH);
    assert!(decision.quarantine_path.is_none());
    let quarantine = fx.quarantine();
    assert!(!quarantine.contains(&digest));
    assert!(!quarantine.contains(&digest_bytes(b"swapped payload")));
    assert_eq!(std::fs::read_dir(quarantine.dir()).unwrap().count(), 0);
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, reason::HASH_MISMATCH);
}

#[test]
fn audit_failure_surfaces_instead_of_decision() {
    let fx = Fixture::new();
    let registry = Arc::new(empty_registry());
    let digest = digest_bytes(b"x");
    registry
        .insert(NewRegistryEntry::new("x", "ops").with_sha256(&digest), &registrar())
        .unwrap();
    let gate = fx.gate(registry, Arc::new(FailingSink));

    let result = gate.admit(&fx.submit("x", b"x", &digest));

    assert!(matches!(result, Err(AdmitError::AuditWriteFailed(_))));
}

#[test]
fn registry_fault_is_audited_and_surfaced() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(Arc::new(BrokenRegistry { panic: false }), sink.clone());

    let result = gate.admit(&fx.submit("r", b"r", &digest_bytes(b"r")));

    assert!(matches!(result, Err(AdmitError::RegistryUnavailable(_))));
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].decision, DecisionStatus::Reject);
    assert_eq!(records[0].reason, reason::REGISTRY_UNAVAILABLE);
}

#[test]
fn quarantine_fault_is_audited_and_surfaced() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(Arc::new(empty_registry()), sink.clone());
    let request = fx.submit("qf", b"qf", &digest_bytes(b"qf"));
    // A directory at the destination cannot be replaced by the artifact.
    std::fs::remove_dir_all(fx.quarantine().dir()).unwrap();
    std::fs::write(fx.dir.path().join("quarantine"), b"not a directory").unwrap();

    let result = gate.admit(&request);

    assert!(matches!(result, Err(AdmitError::QuarantineMoveFailed(_))));
    assert_eq!(sink.records()[0].reason, reason::QUARANTINE_MOVE_FAILED);
}

#[test]
fn panic_mid_admission_still_audits() {
    let fx = Fixture::new();
    let sink = Arc::new(MemorySink::default());
    let gate = fx.gate(Arc::new(BrokenRegistry { panic: true }), sink.clone());
    let request = fx.submit("p", b"p", &digest_bytes(b"p"));

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| gate.admit(&request)));

    assert!(outcome.is_err());
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, reason::ADMISSION_ABORTED);
    assert_eq!(records[0].artifact_digest, Some(digest_bytes(b"p")));
}

#[test]
fn decision_serializes_without_absent_fields() {
    let decision = Decision {
        status: DecisionStatus::Reject,
        reason: reason::SIGNATURE_INVALID.into(),
        artifact_digest: None,
        manifest_name: None,
        match_strategy: MatchStrategy::None,
        registry_entry_id: None,
        quarantine_path: None,
    };
    assert_eq!(
        serde_json::to_value(&decision).unwrap(),
        serde_json::json!({
            "status": "reject",
            "reason": "signature_invalid",
            "match_strategy": "none",
        })
    );
}

#[test]
fn state_names_match_protocol() {
    assert_eq!(AdmissionState::ManifestVerified.to_string(), "MANIFEST_VERIFIED");
    assert_eq!(AdmissionState::Quarantined.to_string(), "QUARANTINED");
}
