//! Gate configuration.
//!
//! Parsed from TOML (`vaultgate.toml` by default). Every section and field is
//! optional; unknown keys are rejected.
//!
//! ```toml
//! [registry]
//! path = "registry.db"
//! similarity_threshold = 60
//!
//! [audit]
//! path = "audit.log"
//! chain_entries = false
//!
//! [quarantine]
//! dir = "quarantine"
//!
//! [keys]
//! manifest_public_key = "keys/pubkey"
//! signing_key = "keys/privkey"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::DEFAULT_SIMILARITY_THRESHOLD;

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "vaultgate.toml";

/// Top-level gate configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    /// Signature registry settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Audit log settings.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Quarantine store settings.
    #[serde(default)]
    pub quarantine: QuarantineConfig,

    /// Key file locations.
    #[serde(default)]
    pub keys: KeysConfig,
}

/// `[registry]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// `SQLite` database path.
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,

    /// Fuzzy-match threshold, `0..=100`.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// NDJSON log path.
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,

    /// Link each line to the digest of the previous one.
    #[serde(default)]
    pub chain_entries: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
            chain_entries: false,
        }
    }
}

/// `[quarantine]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuarantineConfig {
    /// Quarantine directory.
    #[serde(default = "default_quarantine_dir")]
    pub dir: PathBuf,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            dir: default_quarantine_dir(),
        }
    }
}

/// `[keys]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeysConfig {
    /// Public key that manifests must be signed with.
    #[serde(default = "default_manifest_public_key")]
    pub manifest_public_key: PathBuf,

    /// Private key that signs audit lines and registry entries.
    #[serde(default = "default_signing_key")]
    pub signing_key: PathBuf,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            manifest_public_key: default_manifest_public_key(),
            signing_key: default_signing_key(),
        }
    }
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("registry.db")
}

const fn default_similarity_threshold() -> u32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

fn default_audit_path() -> PathBuf {
    PathBuf::from("audit.log")
}

fn default_quarantine_dir() -> PathBuf {
    PathBuf::from("quarantine")
}

fn default_manifest_public_key() -> PathBuf {
    PathBuf::from("keys/pubkey")
}

fn default_signing_key() -> PathBuf {
    PathBuf::from("keys/privkey")
}

impl GateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from `path`, or defaults if the file does not
    /// exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed or
    /// validated.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid, contains unknown keys, or a
    /// value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.similarity_threshold > 100 {
            return Err(ConfigError::Validation(format!(
                "registry.similarity_threshold must be within 0..=100, got {}",
                self.registry.similarity_threshold
            )));
        }
        if self.quarantine.dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "quarantine.dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file.
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Validation error.
    #[error("configuration validation failed: {0}")]
    Validation(String),
}
