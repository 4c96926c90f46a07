//! Content-addressed holding area for unmatched artifacts.
//!
//! A quarantined artifact is moved to `<dir>/<digest>`. The namespace is flat
//! and the file name is the only index; the original manifest name lives in
//! the audit log.
//!
//! # Atomicity
//!
//! The artifact is first staged under a hidden temporary name inside the
//! store: a single `rename` when source and store share a filesystem, an
//! fsynced copy otherwise. The staged bytes are hashed again and must equal
//! the digest they will be filed under; only then are they linked into place
//! with no-clobber semantics. The destination is either absent or complete,
//! and its name always matches its bytes even if the submitter rewrote the
//! source after the gate hashed it.
//!
//! # Idempotence
//!
//! If the destination already exists the move succeeds without touching it
//! and the source is removed. Two admissions of identical content therefore
//! resolve to the same path.


use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::content_hash::{self, HashError, normalize_digest};

/// Errors from quarantine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QuarantineError {
    /// The digest is not a 64-character hex string.
    #[error("invalid quarantine digest: {digest:?}")]
    InvalidDigest {
        /// The rejected value.
        digest: String,
    },

    /// The staged bytes no longer hash to the requested digest. Nothing was
    /// quarantined and the staged copy was removed.
    #[error("quarantined bytes hash to {actual}, expected {expected}")]
    DigestMismatch {
        /// Digest the artifact was to be filed under.
        expected: String,
        /// Digest of the bytes actually moved.
        actual: String,
    },

    /// A filesystem operation failed.
    #[error("quarantine {op} failed for {path}: {source}")]
    Io {
        /// Operation that failed.
        op: &'static str,
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Flat directory of quarantined artifacts named by digest.
#[derive(Debug, Clone)]
pub struct QuarantineStore {
    dir: PathBuf,
}

impl QuarantineStore {
    /// Opens the store, creating `dir` (mode 0700 on Unix) if needed.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError::Io`] if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, QuarantineError> {
        let dir = dir.into();
        create_private_dir(&dir).map_err(|source| QuarantineError::Io {
            op: "create_dir",
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Destination path for `digest`, without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns [`QuarantineError::InvalidDigest`] unless `digest` is 64 hex
    /// characters.
    pub fn path_for(&self, digest: &str) -> Result<PathBuf, QuarantineError> {
        let normalized = normalize_digest(digest).ok_or_else(|| QuarantineError::InvalidDigest {
            digest: digest.to_string(),
        })?;
        Ok(self.dir.join(normalized))
    }

    /// Whether an artifact with `digest` is already quarantined.
    #[must_use]
    pub fn contains(&self, digest: &str) -> bool {
        self.path_for(digest).is_ok_and(|path| path.is_file())
    }

    /// Moves `content` into the store under `digest` and returns the
    /// destination.
    ///
    /// # Errors
    ///
    /// - [`QuarantineError::InvalidDigest`] for a malformed digest.
    /// - [`QuarantineError::DigestMismatch`] when the moved bytes do not hash
    ///   to `digest`; the source is consumed and nothing is filed.
    /// - [`QuarantineError::Io`] when the move cannot be completed. A
    ///   partially copied file is never left at the destination.
    pub fn admit(&self, content: &Path, digest: &str) -> Result<PathBuf, QuarantineError> {
        let dest = self.path_for(digest)?;

        if dest.exists() {
            remove_source(content)?;
            debug!(dest = %dest.display(), "artifact already quarantined");
            return Ok(dest);
        }

        let staged = self.stage(content)?;
        let expected = digest.to_ascii_lowercase();
        let actual = content_hash::digest(&staged).map_err(|e| match e {
            HashError::Io { path, source } => QuarantineError::Io {
                op: "hash",
                path,
                source,
            },
        })?;
        if actual != expected {
            warn!(%expected, %actual, "artifact changed after hashing; not quarantined");
            return Err(QuarantineError::DigestMismatch { expected, actual });
        }

        match staged.persist_noclobber(&dest) {
            Ok(()) => {},
            // A concurrent admission of the same content won the race.
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {},
            Err(e) => {
                return Err(QuarantineError::Io {
                    op: "persist",
                    path: dest,
                    source: e.error,
                });
            },
        }

        info!(digest = %expected, dest = %dest.display(), "artifact quarantined");
        Ok(dest)
    }

    /// Moves `content` to a hidden temporary file in the store. The file is
    /// removed when the returned path drops unpersisted.
    fn stage(&self, content: &Path) -> Result<TempPath, QuarantineError> {
        let io_err = |op: &'static str, path: &Path| {
            let path = path.to_path_buf();
            move |source| QuarantineError::Io { op, path, source }
        };

        let staged = tempfile::Builder::new()
            .prefix(".incoming-")
            .tempfile_in(&self.dir)
            .map_err(io_err("create_temp", &self.dir))?
            .into_temp_path();

        match fs::rename(content, &staged) {
            Ok(()) => return Ok(staged),
            Err(e) => debug!(error = %e, "rename failed, copying into quarantine"),
        }

        let mut dst = fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&staged)
            .map_err(io_err("open", &staged))?;
        let mut src = fs::File::open(content).map_err(io_err("open", content))?;
        io::copy(&mut src, &mut dst).map_err(io_err("copy", content))?;
        dst.sync_all().map_err(io_err("sync", &staged))?;
        remove_source(content)?;
        Ok(staged)
    }
}

fn remove_source(content: &Path) -> Result<(), QuarantineError> {
    match fs::remove_file(content) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(QuarantineError::Io {
            op: "remove_source",
            path: content.to_path_buf(),
            source,
        }),
    }
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}
