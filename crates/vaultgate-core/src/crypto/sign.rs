//! Ed25519 signing, verification and canonical payload encoding.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use serde::Serialize;
use thiserror::Error;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Signature decoding and verification failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The transport encoding was not valid base64.
    #[error("signature is not valid base64: {0}")]
    Encoding(String),

    /// The decoded signature had the wrong length.
    #[error("signature must be {SIGNATURE_SIZE} bytes, got {0}")]
    Length(usize),

    /// The signature does not verify under the given key.
    #[error("signature verification failed")]
    Mismatch,
}

/// Holds the local signing key used for registry entries and audit lines.
pub struct Signer {
    key: SigningKey,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("public_key", &hex::encode(self.key.verifying_key().to_bytes()))
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Wraps a signing key.
    #[must_use]
    pub const fn new(key: SigningKey) -> Self {
        Self { key }
    }

    /// Signs `message`.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.key.sign(message)
    }

    /// Returns the public half of the key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Lowercase hex of the public key, as stored alongside signed records.
    #[must_use]
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }
}

/// Verifies `signature` over `message` with `key`.
///
/// Strict verification: malleable and small-order signatures are rejected.
///
/// # Errors
///
/// Returns [`SignatureError::Mismatch`] if verification fails.
pub fn verify_detached(
    key: &VerifyingKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), SignatureError> {
    key.verify_strict(message, signature)
        .map_err(|_| SignatureError::Mismatch)
}

/// Encodes a signature for transport (standard base64 with padding).
#[must_use]
pub fn encode_signature(signature: &Signature) -> String {
    STANDARD.encode(signature.to_bytes())
}

/// Decodes a base64 signature. Surrounding whitespace is ignored.
///
/// # Errors
///
/// Returns [`SignatureError::Encoding`] for invalid base64 and
/// [`SignatureError::Length`] if the result is not 64 bytes.
pub fn decode_signature(encoded: &str) -> Result<Signature, SignatureError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| SignatureError::Encoding(e.to_string()))?;
    let array: [u8; SIGNATURE_SIZE] = bytes
        .try_into()
        .map_err(|v: Vec<u8>| SignatureError::Length(v.len()))?;
    Ok(Signature::from_bytes(&array))
}

/// Encodes `value` as RFC 8785 canonical JSON (sorted keys, no whitespace).
///
/// # Errors
///
/// Returns the serializer error if `value` cannot be represented as JSON.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_jcs::to_vec(value)
}
