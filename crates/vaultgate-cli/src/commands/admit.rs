//! `vaultgate admit`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error};
use vaultgate_core::audit::{AuditLog, DecisionStatus};
use vaultgate_core::config::GateConfig;
use vaultgate_core::crypto::{Signer, load_signing_key, load_verifying_key};
use vaultgate_core::gate::{AdmissionGate, AdmissionRequest};
use vaultgate_core::quarantine::QuarantineStore;
use vaultgate_core::registry::SqliteRegistry;

/// Exit codes for the admit command.
pub mod exit_codes {
    /// Artifact allowed.
    pub const ALLOW: u8 = 0;
    /// Submission rejected.
    pub const REJECT: u8 = 1;
    /// Artifact quarantined.
    pub const QUARANTINE: u8 = 2;
    /// Setup or infrastructure failure; no decision was recorded.
    pub const INFRASTRUCTURE: u8 = 3;
}

/// Builds a gate from `config`.
///
/// # Errors
///
/// Returns an error if a key, the registry, the audit log or the quarantine
/// directory cannot be opened.
pub fn build_gate(config: &GateConfig) -> Result<AdmissionGate> {
    let manifest_key = load_verifying_key(&config.keys.manifest_public_key)
        .context("failed to load manifest public key")?;
    let signer = Signer::new(
        load_signing_key(&config.keys.signing_key).context("failed to load signing key")?,
    );
    let registry = SqliteRegistry::open(&config.registry.path, signer.verifying_key())
        .with_context(|| format!("failed to open registry {}", config.registry.path.display()))?
        .with_similarity_threshold(config.registry.similarity_threshold);
    let audit = AuditLog::open(&config.audit.path, signer, config.audit.chain_entries)
        .with_context(|| format!("failed to open audit log {}", config.audit.path.display()))?;
    let quarantine = QuarantineStore::new(&config.quarantine.dir)
        .context("failed to open quarantine directory")?;
    debug!(
        registry = %config.registry.path.display(),
        audit = %config.audit.path.display(),
        quarantine = %config.quarantine.dir.display(),
        "gate assembled"
    );

    Ok(AdmissionGate::new(
        manifest_key,
        Arc::new(registry),
        quarantine,
        Arc::new(audit),
    ))
}

/// Runs one admission and prints the decision JSON to stdout.
pub fn run(config: &GateConfig, manifest: PathBuf, signature: PathBuf, content: PathBuf) -> u8 {
    let gate = match build_gate(config) {
        Ok(gate) => gate,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return exit_codes::INFRASTRUCTURE;
        },
    };

    let request = AdmissionRequest::new(manifest, signature, content);
    match gate.admit(&request) {
        Ok(decision) => {
            match serde_json::to_string(&decision) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("Error: failed to encode decision: {e}"),
            }
            match decision.status {
                DecisionStatus::Allow => exit_codes::ALLOW,
                DecisionStatus::Reject => exit_codes::REJECT,
                DecisionStatus::Quarantine => exit_codes::QUARANTINE,
            }
        },
        Err(e) => {
            error!(error = %e, "admission failed without a recorded decision");
            eprintln!("Error: {e}");
            exit_codes::INFRASTRUCTURE
        },
    }
}
