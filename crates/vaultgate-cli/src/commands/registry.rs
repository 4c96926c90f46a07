//! `vaultgate registry`.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use vaultgate_core::config::GateConfig;
use vaultgate_core::crypto::{Signer, load_signing_key};
use vaultgate_core::registry::{NewRegistryEntry, SimilarityDigest, SqliteRegistry};

/// Registry subcommands.
#[derive(Debug, Subcommand)]
pub enum RegistryCommands {
    /// Sign and insert a new entry
    Add(AddArgs),

    /// Print all entries, one JSON object per line
    #[command(alias = "ls")]
    List,

    /// Re-check that the configured registrar signed every entry
    Verify,
}

/// Arguments for `registry add`.
#[derive(Debug, Args)]
pub struct AddArgs {
    /// Entry name
    #[arg(long)]
    pub name: String,

    /// Exact SHA-256 digest (hex)
    #[arg(long)]
    pub sha256: Option<String>,

    /// Similarity digest (`blocksize:digest1:digest2`)
    #[arg(long, conflicts_with = "similarity_from")]
    pub similarity_digest: Option<String>,

    /// Compute the similarity digest from this file
    #[arg(long)]
    pub similarity_from: Option<PathBuf>,

    /// Rule tag; requires at least one --pattern
    #[arg(long, requires = "pattern")]
    pub rule_tag: Option<String>,

    /// Rule pattern (repeatable)
    #[arg(long, requires = "rule_tag")]
    pub pattern: Vec<String>,

    /// Registrar name recorded on the entry
    #[arg(long, default_value = "operator")]
    pub author: String,
}

/// Dispatches a registry subcommand.
///
/// # Errors
///
/// Returns an error if the signing key or the registry cannot be opened, or
/// the operation fails.
pub fn run(config: &GateConfig, cmd: RegistryCommands) -> Result<()> {
    let signer = Signer::new(
        load_signing_key(&config.keys.signing_key).context("failed to load signing key")?,
    );
    let registry = SqliteRegistry::open(&config.registry.path, signer.verifying_key())
        .with_context(|| format!("failed to open registry {}", config.registry.path.display()))?;

    match cmd {
        RegistryCommands::Add(args) => add(&registry, &signer, args),
        RegistryCommands::List => list(&registry),
        RegistryCommands::Verify => verify(&registry),
    }
}

fn add(registry: &SqliteRegistry, signer: &Signer, args: AddArgs) -> Result<()> {
    let mut entry = NewRegistryEntry::new(args.name, args.author);
    if let Some(sha256) = args.sha256 {
        entry = entry.with_sha256(sha256);
    }
    let similarity = match (args.similarity_digest, args.similarity_from) {
        (Some(digest), _) => Some(digest),
        (None, Some(path)) => Some(
            SimilarityDigest::from_file(&path)
                .with_context(|| format!("failed to read {}", path.display()))?
                .to_string(),
        ),
        (None, None) => None,
    };
    if let Some(digest) = similarity {
        entry = entry.with_similarity_digest(digest);
    }
    if let Some(tag) = args.rule_tag {
        entry = entry.with_rule(tag, args.pattern);
    }

    let stored = registry
        .insert(entry, signer)
        .context("failed to insert registry entry")?;
    println!("{}", serde_json::to_string(&stored)?);
    Ok(())
}

fn list(registry: &SqliteRegistry) -> Result<()> {
    for entry in registry.list().context("failed to list registry")? {
        println!("{}", serde_json::to_string(&entry)?);
    }
    Ok(())
}

fn verify(registry: &SqliteRegistry) -> Result<()> {
    let bad = registry.verify_all().context("failed to read registry")?;
    if !bad.is_empty() {
        bail!("entries not signed by the trusted registrar: {bad:?}");
    }
    println!("registry OK");
    Ok(())
}
