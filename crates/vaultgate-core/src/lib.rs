//! Vaultgate core: the artifact admission gate.
//!
//! An incoming artifact arrives as three files: a JSON manifest, a base64
//! Ed25519 signature over the raw manifest bytes, and the content itself. The
//! [`gate::AdmissionGate`] verifies the manifest, checks the content digest,
//! matches the artifact against the signed [`registry`], and either allows
//! it, rejects it, or moves it into the [`quarantine`] store. Every terminal
//! decision is appended to the signed [`audit`] log before it is returned.
//!
//! # Modules
//!
//! - [`crypto`]: key files, signing, canonical JSON.
//! - [`manifest`]: signature verification and manifest parsing.
//! - [`content_hash`]: streamed SHA-256.
//! - [`registry`]: `SQLite` signature registry and similarity digests.
//! - [`matcher`]: exact, fuzzy, rule lookup in priority order.
//! - [`quarantine`]: content-addressed holding area.
//! - [`audit`]: append-only signed NDJSON log.
//! - [`gate`]: the admission state machine.
//! - [`config`]: TOML configuration.

pub mod audit;
pub mod config;
pub mod content_hash;
pub mod crypto;
pub mod gate;
pub mod manifest;
pub mod matcher;
pub mod quarantine;
pub mod registry;

pub use audit::{AuditLog, AuditSink, DecisionStatus};
pub use config::GateConfig;
pub use gate::{AdmissionGate, AdmissionRequest, AdmitError, Decision};
pub use registry::{Registry, SqliteRegistry};
