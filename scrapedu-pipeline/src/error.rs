use scrapedu_core::{ManifestError, StoreError};
use thiserror::Error;

/// Fatal run errors. Phase failures are never reported through this type;
/// they are recorded on the entity instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{task} task join failure: {reason}")]
    Join { task: &'static str, reason: String },
}

pub(crate) fn join_err(task: &'static str, err: tokio::task::JoinError) -> PipelineError {
    PipelineError::Join {
        task,
        reason: err.to_string(),
    }
}

/// Returned to a handler whose write hit the store. The underlying error is
/// kept by the worker and ends the run.
#[derive(Debug, Clone, Error)]
#[error("store failure: {0}")]
pub struct StoreFailed(pub String);
