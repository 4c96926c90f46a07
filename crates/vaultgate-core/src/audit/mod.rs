//! Append-only, per-entry signed audit log.
//!
//! One NDJSON line per admission decision. Each line is the JSON of an
//! [`AuditEntry`]; its `signature` field is an Ed25519 signature over the
//! canonical JSON (RFC 8785) of the same object with `signature` removed, so
//! every line verifies on its own.
//!
//! # Chaining
//!
//! With chaining enabled each line also carries `prev_digest`, the SHA-256 of
//! the previous raw line. Deleting or reordering lines then breaks the chain
//! and [`verify_log`] reports it. Without chaining only forgery of individual
//! lines is detectable.
//!
//! # Concurrency
//!
//! Appends are serialised by an in-process mutex and an exclusive `fs2` lock
//! on the log file, so concurrent writers in other processes never interleave
//! partial lines. Each line is written with a single `write_all` and fsynced
//! before [`AuditSink::record`] returns.
//!
//! A failed write or fsync truncates the file back to its previous length.
//! If a crash still leaves an unterminated fragment at the end of the log,
//! the next append drops it before writing, so a recorded line is never
//! glued onto partial bytes.


use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{SecondsFormat, Utc};
use ed25519_dalek::VerifyingKey;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::content_hash::digest_bytes;
use crate::crypto::{Signer, canonical_json, decode_signature, encode_signature, verify_detached};
use crate::matcher::MatchStrategy;

/// Maximum length of one audit line, newline included.
pub const MAX_AUDIT_LINE_LEN: usize = 64 * 1024;

/// Errors from audit log operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// The log file could not be opened, locked, read or written.
    #[error("audit log I/O error on {path}: {source}")]
    Io {
        /// Log path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// An entry could not be serialised.
    #[error("audit entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A line failed verification.
    #[error("audit log line {line} invalid: {reason}")]
    Corrupt {
        /// 1-based line number.
        line: usize,
        /// What failed.
        reason: String,
    },

    /// The append mutex was poisoned by a panicking thread.
    #[error("audit log lock poisoned")]
    LockPoisoned,
}

/// Terminal admission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionStatus {
    /// Artifact admitted.
    Allow,
    /// Submission refused.
    Reject,
    /// Artifact moved to the quarantine store.
    Quarantine,
}

impl DecisionStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Reject => "reject",
            Self::Quarantine => "quarantine",
        }
    }
}

impl fmt::Display for DecisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision data handed to an [`AuditSink`]; the sink stamps time, key,
/// chain link and signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    /// The decision.
    pub decision: DecisionStatus,
    /// Reason code (`exact`, `hash_mismatch`, ...).
    pub reason: String,
    /// Artifact digest, absent when the reject happened before hashing.
    pub artifact_digest: Option<String>,
    /// Manifest name, absent when the manifest was never trusted.
    pub manifest_name: Option<String>,
    /// Winning match strategy.
    pub match_strategy: MatchStrategy,
    /// Matching registry entry.
    pub registry_entry_id: Option<i64>,
    /// Fuzzy score or matched pattern.
    pub match_detail: Option<String>,
}

/// One signed audit line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditEntry {
    /// RFC 3339 UTC timestamp, millisecond precision.
    pub timestamp: String,
    /// The decision.
    pub decision: DecisionStatus,
    /// Reason code.
    pub reason: String,
    /// Artifact digest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_digest: Option<String>,
    /// Manifest name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_name: Option<String>,
    /// Winning match strategy.
    pub match_strategy: MatchStrategy,
    /// Matching registry entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_entry_id: Option<i64>,
    /// Fuzzy score or matched pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_detail: Option<String>,
    /// Hex key that signed the line.
    pub signer_public_key: String,
    /// SHA-256 of the previous raw line when chaining is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_digest: Option<String>,
    /// Base64 Ed25519 signature.
    pub signature: String,
}

impl AuditEntry {
    /// Canonical JSON of the entry without its `signature` field.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if the entry cannot be encoded.
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let serde_json::Value::Object(fields) = &mut value {
            fields.remove("signature");
        }
        canonical_json(&value)
    }
}

/// Capability the gate uses to record decisions.
pub trait AuditSink: Send + Sync {
    /// Durably records one decision.
    ///
    /// # Errors
    ///
    /// Any error means the decision was not recorded.
    fn record(&self, record: AuditRecord) -> Result<AuditEntry, AuditError>;
}

/// File-backed [`AuditSink`].
pub struct AuditLog {
    path: PathBuf,
    signer: Signer,
    chain: bool,
    append_lock: Mutex<()>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("signer", &self.signer)
            .field("chain", &self.chain)
            .finish_non_exhaustive()
    }
}

impl AuditLog {
    /// Opens (creating if needed) the log at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the file or its parent directory cannot
    /// be created.
    pub fn open(path: impl Into<PathBuf>, signer: Signer, chain: bool) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        open_for_append(&path)?;
        Ok(Self {
            path,
            signer,
            chain,
            append_lock: Mutex::new(()),
        })
    }

    /// Log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether entries are hash-chained.
    #[must_use]
    pub const fn chained(&self) -> bool {
        self.chain
    }
}

impl AuditSink for AuditLog {
    fn record(&self, record: AuditRecord) -> Result<AuditEntry, AuditError> {
        let io_err = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self
            .append_lock
            .lock()
            .map_err(|_| AuditError::LockPoisoned)?;
        let mut file = open_for_append(&self.path)?;
        FileExt::lock_exclusive(&file).map_err(io_err)?;
        let prev_len = drop_partial_tail(&mut file).map_err(io_err)?;

        let prev_digest = if self.chain {
            read_last_line(&mut file)
                .map_err(io_err)?
                .map(|line| digest_bytes(&line))
        } else {
            None
        };

        let mut entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            decision: record.decision,
            reason: record.reason,
            artifact_digest: record.artifact_digest,
            manifest_name: record.manifest_name,
            match_strategy: record.match_strategy,
            registry_entry_id: record.registry_entry_id,
            match_detail: record.match_detail,
            signer_public_key: self.signer.public_key_hex(),
            prev_digest,
            signature: String::new(),
        };
        entry.signature = encode_signature(&self.signer.sign(&entry.signing_payload()?));

        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        if let Err(e) = file.write_all(&line).and_then(|()| file.sync_all()) {
            if let Err(rollback) = file.set_len(prev_len) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial audit line"
                );
            }
            return Err(io_err(e));
        }
        FileExt::unlock(&file).map_err(io_err)?;

        debug!(
            decision = %entry.decision,
            reason = %entry.reason,
            path = %self.path.display(),
            "audit entry appended"
        );
        Ok(entry)
    }
}

fn open_for_append(path: &Path) -> Result<File, AuditError> {
    let mut options = OpenOptions::new();
    options.create(true).read(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path).map_err(|source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Truncates an unterminated trailing fragment and returns the new length.
///
/// Fails without touching the file when no line boundary lies within
/// [`MAX_AUDIT_LINE_LEN`] of the end.
fn drop_partial_tail(file: &mut File) -> io::Result<u64> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(0);
    }
    let window = len.min(MAX_AUDIT_LINE_LEN as u64 + 1);
    file.seek(SeekFrom::Start(len - window))?;
    let mut tail = Vec::with_capacity(usize::try_from(window).unwrap_or(MAX_AUDIT_LINE_LEN));
    (&mut *file).take(window).read_to_end(&mut tail)?;
    if tail.last() == Some(&b'\n') {
        return Ok(len);
    }

    let keep = match tail.iter().rposition(|&b| b == b'\n') {
        Some(i) => len - window + i as u64 + 1,
        None if window < len => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unterminated audit line exceeds maximum length",
            ));
        },
        None => 0,
    };
    warn!(dropped = len - keep, "dropping unterminated audit line fragment");
    file.set_len(keep)?;
    Ok(keep)
}

/// Returns the last complete line of `file` without its newline.
fn read_last_line(file: &mut File) -> io::Result<Option<Vec<u8>>> {
    let len = file.seek(SeekFrom::End(0))?;
    if len == 0 {
        return Ok(None);
    }
    let window = len.min(MAX_AUDIT_LINE_LEN as u64 + 1);
    file.seek(SeekFrom::Start(len - window))?;
    let mut tail = Vec::with_capacity(usize::try_from(window).unwrap_or(MAX_AUDIT_LINE_LEN));
    file.take(window).read_to_end(&mut tail)?;

    if tail.last() == Some(&b'\n') {
        tail.pop();
    }
    let start = tail.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    if start == 0 && window < len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "last audit line exceeds maximum length",
        ));
    }
    Ok(Some(tail.split_off(start)))
}

/// Result of a successful [`verify_log`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogVerification {
    /// Number of verified lines.
    pub entries: usize,
    /// Number of lines carrying a chain link.
    pub chained: usize,
}

/// Verifies every line of the log at `path` under `key`.
///
/// Each line must parse, carry `key` as its signer, and verify. Lines that
/// carry `prev_digest` must link to the raw previous line.
///
/// # Errors
///
/// Returns [`AuditError::Corrupt`] naming the first failing line, or
/// [`AuditError::Io`] if the file cannot be read.
pub fn verify_log(
    path: impl AsRef<Path>,
    key: &VerifyingKey,
) -> Result<LogVerification, AuditError> {
    let path = path.as_ref();
    let io_err = |source| AuditError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(path).map_err(io_err)?;
    let mut reader = BufReader::new(file);
    let expected_signer = hex::encode(key.as_bytes());

    let mut report = LogVerification {
        entries: 0,
        chained: 0,
    };
    let mut prev_line: Option<Vec<u8>> = None;

    loop {
        let line_no = report.entries + 1;
        let corrupt = |reason: String| AuditError::Corrupt {
            line: line_no,
            reason,
        };

        let mut buf = Vec::new();
        let read = (&mut reader)
            .take(MAX_AUDIT_LINE_LEN as u64 + 1)
            .read_until(b'\n', &mut buf)
            .map_err(io_err)?;
        if read == 0 {
            break;
        }
        if buf.len() > MAX_AUDIT_LINE_LEN {
            return Err(corrupt(format!("line exceeds {MAX_AUDIT_LINE_LEN} bytes")));
        }
        if buf.last() != Some(&b'\n') {
            return Err(corrupt("truncated line".into()));
        }
        buf.pop();

        let entry: AuditEntry =
            serde_json::from_slice(&buf).map_err(|e| corrupt(format!("unparsable entry: {e}")))?;
        if entry.signer_public_key != expected_signer {
            return Err(corrupt(format!(
                "signed by {} instead of {expected_signer}",
                entry.signer_public_key
            )));
        }
        let signature = decode_signature(&entry.signature)
            .map_err(|e| corrupt(format!("bad signature encoding: {e}")))?;
        verify_detached(key, &entry.signing_payload()?, &signature)
            .map_err(|_| corrupt("signature does not verify".into()))?;

        if let Some(link) = &entry.prev_digest {
            let expected = prev_line.as_deref().map(digest_bytes);
            if expected.as_deref() != Some(link.as_str()) {
                return Err(corrupt("chain link does not match previous line".into()));
            }
            report.chained += 1;
        }

        report.entries += 1;
        prev_line = Some(buf);
    }

    Ok(report)
}
