//! SHA-256 content hashing for artifacts.
//!
//! The artifact digest is the primary key used downstream: registry exact
//! lookups, quarantine file names, and audit entries all carry it.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Read buffer size for streaming artifacts.
pub const HASH_CHUNK_SIZE: usize = 8192;

/// Length of a hex-encoded SHA-256 digest.
pub const DIGEST_HEX_LEN: usize = 64;

/// Errors raised while hashing an artifact.
#[derive(Debug, Error)]
pub enum HashError {
    /// The artifact could not be opened or read.
    #[error("failed to read artifact {path}: {source}")]
    Io {
        /// Path of the artifact.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Computes the lowercase hex SHA-256 of the file at `path`.
///
/// The file is streamed in [`HASH_CHUNK_SIZE`] chunks, so memory use does
/// not depend on artifact size.
///
/// # Errors
///
/// Returns [`HashError::Io`] if the file cannot be opened or read.
pub fn digest(path: impl AsRef<Path>) -> Result<String, HashError> {
    let path = path.as_ref();
    let io_err = |source| HashError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(e)),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory byte slice.
#[must_use]
pub fn digest_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Normalises a hex digest to lowercase.
///
/// Returns `None` unless `candidate` is exactly 64 hex characters.
#[must_use]
pub fn normalize_digest(candidate: &str) -> Option<String> {
    if candidate.len() == DIGEST_HEX_LEN && candidate.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(candidate.to_ascii_lowercase())
    } else {
        None
    }
}

#[cfg(test)]
mod unit_tests {
    use std::io::Write;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn empty_file_has_known_digest() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(
            digest(file.path()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn file_digest_matches_bytes_digest_across_chunks() {
        let data: Vec<u8> = (0..(HASH_CHUNK_SIZE * 3 + 17))
            .map(|i| (i % 251) as u8)
            .collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let streamed = digest(file.path()).unwrap();
        assert_eq!(streamed, digest_bytes(&data));
        assert_eq!(streamed.len(), DIGEST_HEX_LEN);
        assert!(streamed.bytes().all(|b| !b.is_ascii_uppercase()));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = digest(dir.path().join("absent.bin"));
        assert!(matches!(result, Err(HashError::Io { .. })));
    }

    #[test]
    fn normalize_digest_lowercases_and_validates() {
        let upper = "E3B0C44298FC1C149AFBF4C8996FB92427AE41E4649B934CA495991B7852B855";
        assert_eq!(
            normalize_digest(upper).as_deref(),
            Some("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
        assert_eq!(normalize_digest("abc"), None);
        assert_eq!(normalize_digest(&"g".repeat(64)), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Hashing the same bytes twice always yields the same digest.
        #[test]
        fn prop_digest_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..20_000)) {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(&data).unwrap();
            file.flush().unwrap();

            let first = digest(file.path()).unwrap();
            let second = digest(file.path()).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first, digest_bytes(&data));
        }
    }
}
