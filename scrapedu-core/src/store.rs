//! Atomic document store.
//!
//! # Storage layout
//!
//! ```text
//! <root>/
//!   manifest.json
//!   <slug>/
//!     metadata.json
//!     <downloaded documents>
//! ```
//!
//! # Write protocol
//!
//! 1. Write the bytes to a uniquely named `.<name>.<pid>.<seq>.tmp` sibling.
//! 2. `fsync` the temporary file.
//! 3. `rename` it over the final path (atomic on POSIX, same directory so
//!    never cross-device).
//! 4. `fsync` the parent directory so the rename itself is durable.
//!
//! A crash before step 3 leaves the previous document untouched plus an
//! orphaned `.tmp`; a crash after step 3 leaves the new document.

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{io_err, StoreError};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Key → document persistence with whole-document replace semantics.
#[derive(Debug, Clone)]
pub struct AtomicStore {
    root: PathBuf,
}

impl AtomicStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of the document stored under `key`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(key)?.is_file())
    }

    /// Durably replace the document at `key` with `bytes`.
    pub fn write(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let path = self.path_for(key)?;
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

        let tmp = tmp_path(&path);
        if let Err(err) = write_synced(&tmp, bytes) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        sync_dir(&dir)?;

        tracing::trace!(key, bytes = bytes.len(), "committed document");
        Ok(path)
    }

    /// Last committed bytes under `key`.
    pub fn read(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(io_err(&path, e)),
        }
    }

    /// Serialize `value` as pretty JSON (with trailing newline) and commit it.
    pub fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<PathBuf, StoreError> {
        let mut json = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })?;
        json.push(b'\n');
        self.write(key, &json)
    }

    /// Read and deserialize the JSON document at `key`.
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let bytes = self.read(key)?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
            key: key.to_string(),
            source,
        })
    }

    /// Like [`read_json`](Self::read_json) but maps `NotFound` to `None`.
    pub fn read_json_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.read_json(key) {
            Ok(value) => Ok(Some(value)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = || StoreError::InvalidKey {
        key: key.to_string(),
    };
    if key.is_empty() || key.ends_with('/') {
        return Err(invalid());
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    path.with_file_name(format!(".{name}.{}.{seq}.tmp", std::process::id()))
}

fn write_synced(tmp: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file = File::create(tmp).map_err(|e| io_err(tmp, e))?;
    file.write_all(bytes).map_err(|e| io_err(tmp, e))?;
    file.sync_all().map_err(|e| io_err(tmp, e))?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_err(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
