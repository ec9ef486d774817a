//! Error types for scrapedu-core.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{EntityId, EntityStatus};

/// Failures of the atomic document store.
///
/// Every variant is fatal to a run: the store is the only place state
/// survives a crash, so a write that cannot complete must stop the process.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path being touched.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No document has ever been committed under this key.
    #[error("document not found: {key}")]
    NotFound { key: String },

    /// Key is absolute, empty, or escapes the store root.
    #[error("invalid store key '{key}'")]
    InvalidKey { key: String },

    /// JSON (de)serialization of a stored document failed.
    #[error("malformed document {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

/// An entity state change that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entity {id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub id: EntityId,
    pub from: EntityStatus,
    pub to: EntityStatus,
}

/// Errors raised by manifest operations.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),

    #[error("unsupported manifest version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

/// Errors raised while loading [`crate::config::Settings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error, with the offending file.
    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Errors raised by the reference-data seed loader.
#[derive(Debug, Error)]
pub enum SeedError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed seed file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("seed row {row}: {reason}")]
    Row { row: usize, reason: String },
}
