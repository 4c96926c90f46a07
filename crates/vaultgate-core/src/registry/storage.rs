//! `SQLite`-backed signature registry.
//!
//! Inserts serialise on a single writer connection inside an `IMMEDIATE`
//! transaction. File-backed registries serve each lookup from its own
//! read-only connection, so lookups run concurrently under WAL and never
//! wait on the writer mutex. In-memory registries share the writer
//! connection.
//!
//! Every registry is bound to one trusted registrar key. Inserts must be
//! signed by it and lookups skip rows it did not sign.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use ed25519_dalek::VerifyingKey;
use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, Row, TransactionBehavior, params,
};
use tracing::{debug, info, warn};

use super::entry::{NewRegistryEntry, RegistryEntry, compile_rule};
use super::similarity::SimilarityDigest;
use super::{DEFAULT_SIMILARITY_THRESHOLD, Registry, RegistryError, RuleMatch, SimilarMatch};
use crate::crypto::{Signer, canonical_json, encode_signature};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Artifacts are decoded for rule scanning up to this many bytes.
pub const MAX_RULE_SCAN_BYTES: u64 = 64 * 1024 * 1024;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "SELECT id, name, sha256, similarity_digest, rule_tag, author, ts, \
                              signer_public_key, signature, meta FROM signatures";

/// The signature registry backed by `SQLite`.
pub struct SqliteRegistry {
    writer: Mutex<Connection>,
    path: Option<PathBuf>,
    trusted_signer: VerifyingKey,
    similarity_threshold: u32,
}

impl std::fmt::Debug for SqliteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRegistry")
            .field("path", &self.path)
            .field("trusted_signer", &hex::encode(self.trusted_signer.as_bytes()))
            .field("similarity_threshold", &self.similarity_threshold)
            .finish_non_exhaustive()
    }
}

enum ReadConn<'a> {
    Owned(Connection),
    Shared(MutexGuard<'a, Connection>),
}

impl Deref for ReadConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match self {
            Self::Owned(conn) => conn,
            Self::Shared(guard) => guard,
        }
    }
}

impl SqliteRegistry {
    /// Opens or creates a registry at `path` that trusts rows signed by
    /// `trusted_signer`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialised.
    pub fn open(
        path: impl AsRef<Path>,
        trusted_signer: VerifyingKey,
    ) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!(path = %path.display(), "registry opened");

        Ok(Self {
            writer: Mutex::new(conn),
            path: Some(path.to_path_buf()),
            trusted_signer,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        })
    }

    /// Creates an in-memory registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory(trusted_signer: VerifyingKey) -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            writer: Mutex::new(conn),
            path: None,
            trusted_signer,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        })
    }

    /// Sets the fuzzy-match threshold; matches need a score strictly above it.
    #[must_use]
    pub const fn with_similarity_threshold(mut self, threshold: u32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Registrar key that rows must be signed by.
    #[must_use]
    pub const fn trusted_signer(&self) -> &VerifyingKey {
        &self.trusted_signer
    }

    /// Current fuzzy-match threshold.
    #[must_use]
    pub const fn similarity_threshold(&self) -> u32 {
        self.similarity_threshold
    }

    /// Signs and stores a new entry.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::UntrustedSigner`] if `signer` is not the trusted
    ///   registrar.
    /// - [`RegistryError::InvalidEntry`] if a field is malformed.
    /// - [`RegistryError::DuplicateDigest`] if `sha256` is already present; the
    ///   registry is unchanged.
    /// - [`RegistryError::Database`] on storage failure.
    pub fn insert(
        &self,
        new: NewRegistryEntry,
        signer: &Signer,
    ) -> Result<RegistryEntry, RegistryError> {
        if signer.verifying_key() != self.trusted_signer {
            return Err(RegistryError::UntrustedSigner {
                public_key: signer.public_key_hex(),
            });
        }
        let new = new.validate()?;
        let mut entry = RegistryEntry {
            id: 0,
            name: new.name,
            sha256: new.sha256,
            similarity_digest: new.similarity_digest,
            rule_tag: new.rule_tag,
            author: new.author,
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            signer_public_key: signer.public_key_hex(),
            signature: String::new(),
            meta: new.meta,
        };
        entry.signature = encode_signature(&signer.sign(&entry.signing_payload()?));
        let meta_json = String::from_utf8(canonical_json(&entry.meta)?)
            .map_err(|e| RegistryError::InvalidEntry {
                reason: e.to_string(),
            })?;

        let mut conn = self.lock_writer()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(digest) = &entry.sha256 {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM signatures WHERE sha256 = ?1",
                    params![digest],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(RegistryError::DuplicateDigest {
                    digest: digest.clone(),
                });
            }
        }

        tx.execute(
            "INSERT INTO signatures (name, sha256, similarity_digest, rule_tag, author, ts, \
             signer_public_key, signature, meta) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.name,
                entry.sha256,
                entry.similarity_digest,
                entry.rule_tag,
                entry.author,
                entry.created_at,
                entry.signer_public_key,
                entry.signature,
                meta_json,
            ],
        )
        .map_err(|e| {
            let constraint = matches!(
                &e,
                rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
            );
            match (&entry.sha256, constraint) {
                (Some(digest), true) => RegistryError::DuplicateDigest {
                    digest: digest.clone(),
                },
                _ => RegistryError::Database(e),
            }
        })?;
        entry.id = tx.last_insert_rowid();
        tx.commit()?;

        info!(
            entry_id = entry.id,
            name = %entry.name,
            author = %entry.author,
            "registry entry inserted"
        );
        Ok(entry)
    }

    /// All entries in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn list(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))?;
        let rows = stmt.query_map([], row_to_entry)?;
        collect_entries(rows)
    }

    /// Ids of entries not signed by the trusted registrar.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn verify_all(&self) -> Result<Vec<i64>, RegistryError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|entry| !entry.verify_signature(&self.trusted_signer))
            .map(|entry| entry.id)
            .collect())
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.writer.lock().map_err(|_| RegistryError::LockPoisoned)
    }

    fn reader(&self) -> Result<ReadConn<'_>, RegistryError> {
        match &self.path {
            Some(path) => {
                let conn = Connection::open_with_flags(
                    path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(BUSY_TIMEOUT)?;
                Ok(ReadConn::Owned(conn))
            },
            None => Ok(ReadConn::Shared(self.lock_writer()?)),
        }
    }

    /// Entries with a non-null `column`, in insertion order, that pass
    /// verification under the trusted registrar key.
    fn trusted_entries_with(&self, column: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE {column} IS NOT NULL ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map([], row_to_entry)?;
        Ok(collect_entries(rows)?
            .into_iter()
            .filter(|entry| self.is_trusted(entry))
            .collect())
    }

    fn is_trusted(&self, entry: &RegistryEntry) -> bool {
        let ok = entry.verify_signature(&self.trusted_signer);
        if !ok {
            warn!(
                entry_id = entry.id,
                name = %entry.name,
                signer = %entry.signer_public_key,
                "registry entry not signed by trusted registrar; ignored"
            );
        }
        ok
    }
}

impl Registry for SqliteRegistry {
    fn lookup_exact(&self, digest: &str) -> Result<Option<RegistryEntry>, RegistryError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE sha256 = ?1"))?;
        let entry = stmt
            .query_row(params![digest], row_to_entry)
            .optional()?
            .map(RowEntry::into_entry)
            .transpose()?;
        Ok(entry.filter(|entry| self.is_trusted(entry)))
    }

    fn lookup_similar(&self, artifact: &Path) -> Result<Option<SimilarMatch>, RegistryError> {
        let candidate =
            SimilarityDigest::from_file(artifact).map_err(|source| RegistryError::Artifact {
                path: artifact.to_path_buf(),
                source,
            })?;

        for entry in self.trusted_entries_with("similarity_digest")? {
            let Some(stored) = entry.similarity_digest.as_deref() else {
                continue;
            };
            let stored: SimilarityDigest = match stored.parse() {
                Ok(digest) => digest,
                Err(e) => {
                    warn!(entry_id = entry.id, error = %e, "skipping unparsable similarity digest");
                    continue;
                },
            };
            let score = candidate.compare(&stored);
            if score > self.similarity_threshold {
                return Ok(Some(SimilarMatch { entry, score }));
            }
        }
        Ok(None)
    }

    fn lookup_rule(&self, artifact: &Path) -> Result<Option<RuleMatch>, RegistryError> {
        let entries = self.trusted_entries_with("rule_tag")?;
        if entries.is_empty() {
            return Ok(None);
        }
        let text = read_text_lossy(artifact)?;

        for entry in entries {
            let matched = entry.rule_patterns().into_iter().find_map(|pattern| {
                match compile_rule(pattern) {
                    Ok(re) if re.is_match(&text) => Some(pattern.to_string()),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(
                            entry_id = entry.id,
                            error = %e,
                            "skipping uncompilable rule pattern"
                        );
                        None
                    },
                }
            });
            if let Some(pattern) = matched {
                return Ok(Some(RuleMatch { entry, pattern }));
            }
        }
        Ok(None)
    }
}

fn read_text_lossy(path: &Path) -> Result<String, RegistryError> {
    let io_err = |source| RegistryError::Artifact {
        path: path.to_path_buf(),
        source,
    };
    let mut bytes = Vec::new();
    File::open(path)
        .map_err(io_err)?
        .take(MAX_RULE_SCAN_BYTES)
        .read_to_end(&mut bytes)
        .map_err(io_err)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Raw row with `meta` still encoded; decoding happens outside the rusqlite
/// row callback so JSON errors keep their own type.
struct RowEntry {
    entry: RegistryEntry,
    meta: String,
}

impl RowEntry {
    fn into_entry(self) -> Result<RegistryEntry, RegistryError> {
        let mut entry = self.entry;
        entry.meta = serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&self.meta)?;
        Ok(entry)
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<RowEntry> {
    Ok(RowEntry {
        entry: RegistryEntry {
            id: row.get(0)?,
            name: row.get(1)?,
            sha256: row.get(2)?,
            similarity_digest: row.get(3)?,
            rule_tag: row.get(4)?,
            author: row.get(5)?,
            created_at: row.get(6)?,
            signer_public_key: row.get(7)?,
            signature: row.get(8)?,
            meta: BTreeMap::new(),
        },
        meta: row.get(9)?,
    })
}

fn collect_entries(
    rows: impl Iterator<Item = rusqlite::Result<RowEntry>>,
) -> Result<Vec<RegistryEntry>, RegistryError> {
    rows.map(|row| row.map_err(RegistryError::from)?.into_entry())
        .collect()
}
