use ed25519_dalek::SigningKey;

use super::*;

fn test_signer(seed: u8) -> Signer {
    Signer::new(SigningKey::from_bytes(&[seed; 32]))
}

#[test]
fn sign_and_verify_round_trip() {
    let signer = test_signer(1);
    let sig = signer.sign(b"manifest bytes");
    assert!(verify_detached(&signer.verifying_key(), b"manifest bytes", &sig).is_ok());
}

#[test]
fn verify_rejects_other_key() {
    let signer = test_signer(1);
    let other = test_signer(2);
    let sig = signer.sign(b"payload");
    assert_eq!(
        verify_detached(&other.verifying_key(), b"payload", &sig),
        Err(SignatureError::Mismatch)
    );
}

#[test]
fn decode_signature_accepts_trailing_newline() {
    let signer = test_signer(3);
    let sig = signer.sign(b"x");
    let encoded = format!("{}\n", encode_signature(&sig));
    assert_eq!(decode_signature(&encoded).unwrap(), sig);
}

#[test]
fn decode_signature_rejects_bad_base64() {
    assert!(matches!(
        decode_signature("not base64 !!"),
        Err(SignatureError::Encoding(_))
    ));
}

#[test]
fn decode_signature_rejects_short_signature() {
    // base64 of b"sig", the placeholder the old self-test wrote
    assert_eq!(decode_signature("c2ln"), Err(SignatureError::Length(3)));
}

#[test]
fn canonical_json_sorts_keys() {
    let value = serde_json::json!({"zeta": 1, "alpha": {"b": 2, "a": 1}});
    let bytes = canonical_json(&value).unwrap();
    assert_eq!(
        String::from_utf8(bytes).unwrap(),
        r#"{"alpha":{"a":1,"b":2},"zeta":1}"#
    );
}

#[test]
fn keypair_written_and_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let public = write_keypair(dir.path()).unwrap();

    let signing = load_signing_key(dir.path().join(PRIVATE_KEY_FILE)).unwrap();
    let verifying = load_verifying_key(dir.path().join(PUBLIC_KEY_FILE)).unwrap();
    assert_eq!(signing.verifying_key(), public);
    assert_eq!(verifying, public);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(dir.path().join(PRIVATE_KEY_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn write_keypair_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    write_keypair(dir.path()).unwrap();
    assert!(matches!(
        write_keypair(dir.path()),
        Err(KeyError::AlreadyExists { .. })
    ));
}

#[test]
fn raw_key_bytes_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let key = SigningKey::from_bytes(&[9u8; 32]);
    let path = dir.path().join("raw.pub");
    std::fs::write(&path, key.verifying_key().to_bytes()).unwrap();
    assert_eq!(load_verifying_key(&path).unwrap(), key.verifying_key());
}

#[test]
fn malformed_key_file_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad");
    std::fs::write(&path, "abcd").unwrap();
    assert!(matches!(
        load_signing_key(&path),
        Err(KeyError::InvalidKeyMaterial { .. })
    ));
}

#[test]
fn parse_verifying_key_round_trips_hex() {
    let signer = test_signer(4);
    assert_eq!(
        parse_verifying_key(&signer.public_key_hex()),
        Some(signer.verifying_key())
    );
    assert_eq!(parse_verifying_key("zz"), None);
}
