//! vaultgate - artifact admission gate
//!
//! Operator CLI: runs admissions, manages the signature registry, verifies the
//! audit log and provisions keys.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vaultgate_core::config::{DEFAULT_CONFIG_FILE, GateConfig};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "vaultgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Admit one artifact and print the decision
    ///
    /// Exit codes: 0 allow, 1 reject, 2 quarantine, 3 infrastructure failure.
    Admit {
        /// Manifest JSON
        manifest: PathBuf,

        /// Base64 signature over the manifest bytes
        signature: PathBuf,

        /// Artifact content
        content: PathBuf,
    },

    /// Manage the signature registry
    #[command(subcommand)]
    Registry(commands::registry::RegistryCommands),

    /// Inspect the audit log
    #[command(subcommand)]
    Audit(commands::audit::AuditCommands),

    /// Generate an Ed25519 key pair into a directory
    Keygen {
        /// Output directory (receives `privkey` and `pubkey`)
        dir: PathBuf,
    },

    /// Sign manifest bytes, writing a base64 signature
    SignManifest {
        /// Manifest to sign
        manifest: PathBuf,

        /// Signature output path
        #[arg(long)]
        out: PathBuf,

        /// Private key (defaults to `keys.signing_key`)
        #[arg(long)]
        key: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_file.as_ref())?;

    let config = GateConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Admit {
            manifest,
            signature,
            content,
        } => {
            // Exit code carries the decision, so bypass anyhow Result handling.
            let exit_code = commands::admit::run(&config, manifest, signature, content);
            std::process::exit(i32::from(exit_code));
        },
        Commands::Registry(cmd) => commands::registry::run(&config, cmd),
        Commands::Audit(cmd) => commands::audit::run(&config, cmd),
        Commands::Keygen { dir } => commands::keys::keygen(&dir),
        Commands::SignManifest { manifest, out, key } => {
            let key = key.unwrap_or_else(|| config.keys.signing_key.clone());
            commands::keys::sign_manifest(&manifest, &out, &key)
        },
    }
}

fn init_logging(level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        },
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
    Ok(())
}
