//! `vaultgate keygen` and `vaultgate sign-manifest`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use vaultgate_core::crypto::{Signer, encode_signature, load_signing_key, write_keypair};
use vaultgate_core::manifest::MAX_MANIFEST_BYTES;

/// Writes a fresh key pair into `dir` and prints the public key.
///
/// # Errors
///
/// Returns an error if either key file exists or cannot be written.
pub fn keygen(dir: &Path) -> Result<()> {
    let key = write_keypair(dir)
        .with_context(|| format!("failed to write key pair into {}", dir.display()))?;
    println!("{}", hex::encode(key.as_bytes()));
    Ok(())
}

/// Signs the raw bytes of `manifest` and writes the base64 signature.
///
/// # Errors
///
/// Returns an error if the key or manifest cannot be read, or the signature
/// cannot be written.
pub fn sign_manifest(manifest: &Path, out: &Path, key: &Path) -> Result<()> {
    let signer = Signer::new(
        load_signing_key(key).with_context(|| format!("failed to load {}", key.display()))?,
    );
    let bytes =
        fs::read(manifest).with_context(|| format!("failed to read {}", manifest.display()))?;
    if bytes.len() as u64 > MAX_MANIFEST_BYTES {
        anyhow::bail!("manifest exceeds {MAX_MANIFEST_BYTES} bytes");
    }
    let signature = encode_signature(&signer.sign(&bytes));
    fs::write(out, format!("{signature}\n"))
        .with_context(|| format!("failed to write {}", out.display()))?;
    Ok(())
}
