//! Key provisioning and signature primitives shared by the gate.
//!
//! - **Ed25519 signatures**: manifests are verified against an externally
//!   provisioned public key; registry entries and audit lines are signed with
//!   a local signing key.
//! - **Canonical JSON**: signed payloads are encoded with RFC 8785 (JCS) so
//!   key order never changes the signed bytes.
//! - **Key files**: 32 raw bytes or 64 hex characters.
//!
//! # Example
//!
//! ```rust
//! use vaultgate_core::crypto::{Signer, verify_detached};
//! use ed25519_dalek::SigningKey;
//!
//! let signer = Signer::new(SigningKey::from_bytes(&[7u8; 32]));
//! let signature = signer.sign(b"payload");
//! assert!(verify_detached(&signer.verifying_key(), b"payload", &signature).is_ok());
//! ```

mod keys;
mod sign;

#[cfg(test)]
mod tests;

pub use keys::{
    KeyError, PRIVATE_KEY_FILE, PUBLIC_KEY_FILE, load_signing_key, load_verifying_key,
    parse_verifying_key, write_keypair,
};
pub use sign::{
    PUBLIC_KEY_SIZE, SIGNATURE_SIZE, SignatureError, Signer, canonical_json, decode_signature,
    encode_signature, verify_detached,
};
