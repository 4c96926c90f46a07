//! Tests for manifest verification ordering and bit-flip rejection.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer as _, SigningKey};
use proptest::prelude::*;

use super::*;

const DIGEST: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn manifest_key() -> SigningKey {
    SigningKey::from_bytes(&[0x11; 32])
}

fn manifest_bytes() -> Vec<u8> {
    format!(r#"{{"name":"demo_artifact","content_digest":"{DIGEST}"}}"#).into_bytes()
}

fn sign_b64(key: &SigningKey, bytes: &[u8]) -> Vec<u8> {
    STANDARD.encode(key.sign(bytes).to_bytes()).into_bytes()
}

#[test]
fn valid_signature_yields_manifest() {
    let key = manifest_key();
    let bytes = manifest_bytes();
    let manifest = verify(&bytes, &sign_b64(&key, &bytes), &key.verifying_key()).unwrap();
    assert_eq!(manifest.name, "demo_artifact");
    assert_eq!(manifest.content_digest, DIGEST);
    assert!(manifest.metadata.is_empty());
}

#[test]
fn legacy_content_sha256_field_accepted() {
    let key = manifest_key();
    let bytes = format!(
        r#"{{"name":"legacy","content_sha256":"{}","metadata":{{"build":7}}}}"#,
        DIGEST.to_ascii_uppercase()
    )
    .into_bytes();
    let manifest = verify(&bytes, &sign_b64(&key, &bytes), &key.verifying_key()).unwrap();
    assert_eq!(manifest.content_digest, DIGEST);
    assert_eq!(manifest.metadata["build"], serde_json::json!(7));
}

#[test]
fn wrong_key_is_invalid_signature() {
    let key = manifest_key();
    let other = SigningKey::from_bytes(&[0x22; 32]);
    let bytes = manifest_bytes();
    let result = verify(&bytes, &sign_b64(&other, &bytes), &key.verifying_key());
    assert!(matches!(result, Err(ManifestError::InvalidSignature)));
}

#[test]
fn non_base64_signature_is_malformed() {
    let key = manifest_key();
    let result = verify(&manifest_bytes(), b"%%%", &key.verifying_key());
    assert!(matches!(
        result,
        Err(ManifestError::MalformedSignature { .. })
    ));
}

#[test]
fn short_signature_is_malformed() {
    let key = manifest_key();
    let short = STANDARD.encode(b"sig").into_bytes();
    let result = verify(&manifest_bytes(), &short, &key.verifying_key());
    assert!(matches!(
        result,
        Err(ManifestError::MalformedSignature { .. })
    ));
}

#[test]
fn signature_checked_before_parsing() {
    // Garbage that is not JSON: an invalid signature must win over the
    // parse failure.
    let key = manifest_key();
    let other = SigningKey::from_bytes(&[0x33; 32]);
    let garbage = b"not json at all".to_vec();
    let result = verify(&garbage, &sign_b64(&other, &garbage), &key.verifying_key());
    assert!(matches!(result, Err(ManifestError::InvalidSignature)));
}

#[test]
fn signed_garbage_is_malformed_manifest() {
    let key = manifest_key();
    let garbage = b"not json at all".to_vec();
    let result = verify(&garbage, &sign_b64(&key, &garbage), &key.verifying_key());
    assert!(matches!(
        result,
        Err(ManifestError::MalformedManifest { .. })
    ));
}

#[test]
fn bad_digest_is_malformed_manifest() {
    let key = manifest_key();
    let bytes = br#"{"name":"x","content_digest":"abc"}"#.to_vec();
    let result = verify(&bytes, &sign_b64(&key, &bytes), &key.verifying_key());
    assert!(matches!(
        result,
        Err(ManifestError::MalformedManifest { .. })
    ));
}

#[test]
fn unknown_field_is_malformed_manifest() {
    let key = manifest_key();
    let bytes =
        format!(r#"{{"name":"x","content_digest":"{DIGEST}","trusted":true}}"#).into_bytes();
    let result = verify(&bytes, &sign_b64(&key, &bytes), &key.verifying_key());
    assert!(matches!(
        result,
        Err(ManifestError::MalformedManifest { .. })
    ));
}

#[test]
fn verify_files_reads_and_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let key = manifest_key();
    let bytes = manifest_bytes();
    let manifest_path = dir.path().join("manifest.json");
    let sig_path = dir.path().join("manifest.sig");
    std::fs::write(&manifest_path, &bytes).unwrap();
    std::fs::write(&sig_path, sign_b64(&key, &bytes)).unwrap();

    let manifest = verify_files(&manifest_path, &sig_path, &key.verifying_key()).unwrap();
    assert_eq!(manifest.name, "demo_artifact");
}

#[test]
fn verify_files_missing_signature_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_path = dir.path().join("manifest.json");
    std::fs::write(&manifest_path, manifest_bytes()).unwrap();
    let result = verify_files(
        &manifest_path,
        dir.path().join("absent.sig"),
        &manifest_key().verifying_key(),
    );
    assert!(matches!(result, Err(ManifestError::Io { .. })));
}

#[test]
fn verify_files_oversized_manifest_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let key = manifest_key();
    let bytes = vec![b' '; (MAX_MANIFEST_BYTES + 1) as usize];
    let manifest_path = dir.path().join("manifest.json");
    let sig_path = dir.path().join("manifest.sig");
    std::fs::write(&manifest_path, &bytes).unwrap();
    std::fs::write(&sig_path, sign_b64(&key, &bytes)).unwrap();

    let result = verify_files(&manifest_path, &sig_path, &key.verifying_key());
    assert!(matches!(
        result,
        Err(ManifestError::MalformedManifest { .. })
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any single bit flip in the manifest bytes breaks verification.
    #[test]
    fn prop_manifest_bit_flip_rejected(bit in 0usize..(8 * 80)) {
        let key = manifest_key();
        let bytes = manifest_bytes();
        let sig = sign_b64(&key, &bytes);
        let mut flipped = bytes.clone();
        let bit = bit % (flipped.len() * 8);
        flipped[bit / 8] ^= 1 << (bit % 8);

        let result = verify(&flipped, &sig, &key.verifying_key());
        prop_assert!(matches!(result, Err(ManifestError::InvalidSignature)));
    }

    /// Any single bit flip in the decoded signature breaks verification.
    #[test]
    fn prop_signature_bit_flip_rejected(bit in 0usize..(8 * 64)) {
        let key = manifest_key();
        let bytes = manifest_bytes();
        let mut raw = key.sign(&bytes).to_bytes();
        raw[bit / 8] ^= 1 << (bit % 8);
        let sig = STANDARD.encode(raw).into_bytes();

        let result = verify(&bytes, &sig, &key.verifying_key());
        prop_assert!(matches!(result, Err(ManifestError::InvalidSignature)));
    }
}
