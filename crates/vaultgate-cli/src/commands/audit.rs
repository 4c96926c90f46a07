//! `vaultgate audit`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use vaultgate_core::audit::verify_log;
use vaultgate_core::config::GateConfig;
use vaultgate_core::crypto::{load_signing_key, load_verifying_key};

/// Audit subcommands.
#[derive(Debug, Subcommand)]
pub enum AuditCommands {
    /// Verify every line's signature and chain link
    Verify {
        /// Public key to verify with (defaults to the key of `keys.signing_key`)
        #[arg(long)]
        public_key: Option<PathBuf>,
    },
}

/// Dispatches an audit subcommand.
///
/// # Errors
///
/// Returns an error if the key cannot be loaded or verification fails.
pub fn run(config: &GateConfig, cmd: AuditCommands) -> Result<()> {
    match cmd {
        AuditCommands::Verify { public_key } => {
            let key = match public_key {
                Some(path) => load_verifying_key(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
                None => load_signing_key(&config.keys.signing_key)
                    .context("failed to load signing key")?
                    .verifying_key(),
            };
            let report = verify_log(&config.audit.path, &key).with_context(|| {
                format!("audit log {} failed verification", config.audit.path.display())
            })?;
            println!(
                "audit log OK: {} entries, {} chained",
                report.entries, report.chained
            );
            Ok(())
        },
    }
}
