//! Loading and provisioning of Ed25519 key files.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use ed25519_dalek::{SigningKey, VerifyingKey};
use thiserror::Error;

/// File name of the private key written by [`write_keypair`].
pub const PRIVATE_KEY_FILE: &str = "privkey";

/// File name of the public key written by [`write_keypair`].
pub const PUBLIC_KEY_FILE: &str = "pubkey";

/// Key files larger than this are never read.
const MAX_KEY_FILE_BYTES: u64 = 1024;

const KEY_LEN: usize = 32;

/// Errors raised while loading or writing key material.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeyError {
    /// The key file could not be read or written.
    #[error("key file {path}: {source}")]
    Io {
        /// Path of the key file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The key file did not contain 32 raw bytes or 64 hex characters.
    #[error("invalid key material in {path}: {reason}")]
    InvalidKeyMaterial {
        /// Path of the key file.
        path: PathBuf,
        /// Why the material was rejected.
        reason: String,
    },

    /// Refused to overwrite an existing key file.
    #[error("key file already exists: {path}")]
    AlreadyExists {
        /// Path of the existing key file.
        path: PathBuf,
    },
}

/// Loads an Ed25519 signing key from `path`.
///
/// # Errors
///
/// Returns [`KeyError::Io`] if the file cannot be read and
/// [`KeyError::InvalidKeyMaterial`] if its contents are not a 32-byte key.
pub fn load_signing_key(path: impl AsRef<Path>) -> Result<SigningKey, KeyError> {
    let path = path.as_ref();
    let bytes = read_key_bytes(path)?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Loads an Ed25519 verifying key from `path`.
///
/// # Errors
///
/// Returns [`KeyError::Io`] if the file cannot be read and
/// [`KeyError::InvalidKeyMaterial`] if its contents are not a valid point.
pub fn load_verifying_key(path: impl AsRef<Path>) -> Result<VerifyingKey, KeyError> {
    let path = path.as_ref();
    let bytes = read_key_bytes(path)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| KeyError::InvalidKeyMaterial {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Parses a hex-encoded verifying key as stored in registry rows.
///
/// Returns `None` if the string is not a valid 32-byte Ed25519 point.
#[must_use]
pub fn parse_verifying_key(hex_key: &str) -> Option<VerifyingKey> {
    let bytes: [u8; KEY_LEN] = hex::decode(hex_key).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Generates a fresh key pair into `dir` as hex text files.
///
/// The private key is created with mode 0600 on Unix. Existing files are
/// never overwritten.
///
/// # Errors
///
/// Returns [`KeyError::AlreadyExists`] if either file exists, or
/// [`KeyError::Io`] if the files cannot be written.
pub fn write_keypair(dir: impl AsRef<Path>) -> Result<VerifyingKey, KeyError> {
    let dir = dir.as_ref();
    let private_path = dir.join(PRIVATE_KEY_FILE);
    let public_path = dir.join(PUBLIC_KEY_FILE);
    for path in [&private_path, &public_path] {
        if path.exists() {
            return Err(KeyError::AlreadyExists { path: path.clone() });
        }
    }
    fs::create_dir_all(dir).map_err(|source| KeyError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let verifying_key = signing_key.verifying_key();

    write_new_file(&private_path, hex::encode(signing_key.to_bytes()).as_bytes(), true)?;
    write_new_file(&public_path, hex::encode(verifying_key.to_bytes()).as_bytes(), false)?;
    Ok(verifying_key)
}

fn write_new_file(path: &Path, contents: &[u8], private: bool) -> Result<(), KeyError> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(if private { 0o600 } else { 0o644 });
    }
    #[cfg(not(unix))]
    let _ = private;

    let io_err = |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = opts.open(path).map_err(io_err)?;
    file.write_all(contents).map_err(io_err)?;
    file.write_all(b"\n").map_err(io_err)?;
    file.sync_all().map_err(io_err)
}

fn read_key_bytes(path: &Path) -> Result<[u8; KEY_LEN], KeyError> {
    let io_err = |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    };
    let len = fs::metadata(path).map_err(io_err)?.len();
    if len > MAX_KEY_FILE_BYTES {
        return Err(KeyError::InvalidKeyMaterial {
            path: path.to_path_buf(),
            reason: format!("file is {len} bytes, limit is {MAX_KEY_FILE_BYTES}"),
        });
    }
    let raw = fs::read(path).map_err(io_err)?;
    decode_key_material(&raw).map_err(|reason| KeyError::InvalidKeyMaterial {
        path: path.to_path_buf(),
        reason,
    })
}

/// Accepts either exactly 32 raw bytes or 64 hex characters (trimmed).
fn decode_key_material(raw: &[u8]) -> Result<[u8; KEY_LEN], String> {
    if raw.len() == KEY_LEN {
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(raw);
        return Ok(out);
    }
    let text = std::str::from_utf8(raw)
        .map_err(|_| format!("expected {KEY_LEN} raw bytes or hex text"))?
        .trim();
    let decoded = hex::decode(text).map_err(|e| format!("bad hex: {e}"))?;
    decoded
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected {KEY_LEN} bytes, got {}", v.len()))
}
