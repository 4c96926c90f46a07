//! Manifest verification: signature first, then parsing.
//!
//! A manifest arrives as raw bytes with a detached, base64-encoded Ed25519
//! signature. The signature covers the bytes exactly as received; nothing is
//! re-serialised before verification, so canonicalisation tricks cannot
//! change what was signed.
//!
//! # Ordering
//!
//! ```text
//! decode signature -> verify over raw bytes -> parse JSON -> validate fields
//! ```
//!
//! No manifest field is read until the signature has verified.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content_hash::normalize_digest;
use crate::crypto::{SignatureError, decode_signature, verify_detached};

/// Largest manifest accepted, in bytes.
pub const MAX_MANIFEST_BYTES: u64 = 64 * 1024;

/// Largest signature file accepted, in bytes.
pub const MAX_SIGNATURE_FILE_BYTES: u64 = 4 * 1024;

/// Largest manifest `name` accepted, in bytes.
pub const MAX_MANIFEST_NAME_LEN: usize = 1024;

/// Errors produced by the manifest verifier.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManifestError {
    /// The signature could not be decoded from its transport encoding.
    #[error("malformed signature: {reason}")]
    MalformedSignature {
        /// Why decoding failed.
        reason: String,
    },

    /// The signature does not verify over the manifest bytes.
    #[error("manifest signature invalid")]
    InvalidSignature,

    /// The signature verified but the manifest is not a valid document.
    #[error("malformed manifest: {reason}")]
    MalformedManifest {
        /// Why parsing or validation failed.
        reason: String,
    },

    /// The manifest or signature file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Signed metadata describing an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    /// Human-readable artifact name.
    pub name: String,

    /// Expected lowercase hex SHA-256 of the artifact bytes.
    #[serde(alias = "content_sha256")]
    pub content_digest: String,

    /// Free-form metadata carried alongside the declaration.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Verifies `signature_text` over `manifest_bytes` and parses the manifest.
///
/// Pure function: no I/O, no logging.
///
/// # Errors
///
/// - [`ManifestError::MalformedSignature`] if the signature is not 64 bytes of
///   base64.
/// - [`ManifestError::InvalidSignature`] if it does not verify.
/// - [`ManifestError::MalformedManifest`] if the verified bytes do not parse
///   or declare an invalid digest.
pub fn verify(
    manifest_bytes: &[u8],
    signature_text: &[u8],
    public_key: &VerifyingKey,
) -> Result<Manifest, ManifestError> {
    let encoded =
        std::str::from_utf8(signature_text).map_err(|_| ManifestError::MalformedSignature {
            reason: "signature file is not UTF-8 text".to_string(),
        })?;
    let signature = decode_signature(encoded).map_err(|e| ManifestError::MalformedSignature {
        reason: e.to_string(),
    })?;

    verify_detached(public_key, manifest_bytes, &signature).map_err(|e| match e {
        SignatureError::Mismatch => ManifestError::InvalidSignature,
        other => ManifestError::MalformedSignature {
            reason: other.to_string(),
        },
    })?;

    parse(manifest_bytes)
}

/// Reads the manifest and signature files (bounded) and calls [`verify`].
///
/// # Errors
///
/// Returns [`ManifestError::Io`] for unreadable files, and the [`verify`]
/// errors otherwise. Oversized files are classified as malformed.
pub fn verify_files(
    manifest_path: impl AsRef<Path>,
    signature_path: impl AsRef<Path>,
    public_key: &VerifyingKey,
) -> Result<Manifest, ManifestError> {
    let manifest_path = manifest_path.as_ref();
    let signature_path = signature_path.as_ref();

    let signature_text = read_bounded(signature_path, MAX_SIGNATURE_FILE_BYTES)?.ok_or_else(
        || ManifestError::MalformedSignature {
            reason: format!("signature file exceeds {MAX_SIGNATURE_FILE_BYTES} bytes"),
        },
    )?;
    let manifest_bytes = read_bounded(manifest_path, MAX_MANIFEST_BYTES)?.ok_or_else(|| {
        ManifestError::MalformedManifest {
            reason: format!("manifest exceeds {MAX_MANIFEST_BYTES} bytes"),
        }
    })?;

    verify(&manifest_bytes, &signature_text, public_key)
}

fn parse(manifest_bytes: &[u8]) -> Result<Manifest, ManifestError> {
    let mut manifest: Manifest =
        serde_json::from_slice(manifest_bytes).map_err(|e| ManifestError::MalformedManifest {
            reason: e.to_string(),
        })?;

    if manifest.name.is_empty() || manifest.name.len() > MAX_MANIFEST_NAME_LEN {
        return Err(ManifestError::MalformedManifest {
            reason: format!(
                "name must be 1..={MAX_MANIFEST_NAME_LEN} bytes, got {}",
                manifest.name.len()
            ),
        });
    }
    manifest.content_digest = normalize_digest(&manifest.content_digest).ok_or_else(|| {
        ManifestError::MalformedManifest {
            reason: "content_digest must be 64 hex characters".to_string(),
        }
    })?;
    Ok(manifest)
}

/// Reads at most `limit` bytes. Returns `Ok(None)` if the file is larger.
fn read_bounded(path: &Path, limit: u64) -> Result<Option<Vec<u8>>, ManifestError> {
    let io_err = |source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut buf = Vec::new();
    file.take(limit + 1).read_to_end(&mut buf).map_err(io_err)?;
    if buf.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(buf))
}
