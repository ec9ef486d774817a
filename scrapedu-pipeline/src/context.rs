//! What a phase handler sees while it runs.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use scrapedu_core::{AtomicStore, DownloadRecord, Entity, EntityMetadata, Phase, StoreError};
use tokio_util::sync::CancellationToken;

use crate::error::{join_err, PipelineError, StoreFailed};
use crate::limiter::RateLimiter;

/// Per-attempt handler context.
///
/// The metadata document is shared across the phases of one entity, so data
/// written by an earlier phase (`set_phase_data`) is visible to later ones.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    phase: Phase,
    attempt: u32,
    entity_key: String,
    store: AtomicStore,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    metadata: Arc<Mutex<EntityMetadata>>,
    fatal: Arc<Mutex<Option<PipelineError>>>,
}

impl PhaseContext {
    pub fn new(
        phase: Phase,
        attempt: u32,
        entity: &Entity,
        store: AtomicStore,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
        metadata: Arc<Mutex<EntityMetadata>>,
    ) -> Self {
        Self {
            phase,
            attempt,
            entity_key: entity.slug.0.clone(),
            store,
            limiter,
            cancel,
            metadata,
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// 1 for the first attempt of this phase in this run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn output_dir(&self) -> &Path {
        self.store.root()
    }

    pub fn entity_dir(&self) -> PathBuf {
        self.store.root().join(&self.entity_key)
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn metadata(&self) -> MutexGuard<'_, EntityMetadata> {
        self.metadata.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn phase_data(&self, phase: Phase) -> Option<serde_json::Value> {
        self.metadata().phase_data(phase).cloned()
    }

    /// Store data for the current phase; later phases read it back.
    pub fn set_phase_data(&self, value: serde_json::Value) {
        self.metadata().set_phase_data(self.phase, value);
    }

    pub fn is_downloaded(&self, url: &str) -> bool {
        self.metadata().is_downloaded(url)
    }

    /// Append to the entity's error log without failing the phase.
    pub fn log_error(&self, error: impl Into<String>) {
        self.metadata().add_error(self.phase, error);
    }

    /// Atomically write `bytes` to `<slug>/<phase>/<file_name>` and record the
    /// download in the entity's metadata, which is persisted immediately.
    /// Both writes run on the blocking pool.
    ///
    /// A store failure is also kept on the context; the worker aborts the run
    /// after the handler returns, whatever outcome it reports.
    pub async fn save_download(
        &self,
        url: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<DownloadRecord, StoreFailed> {
        let key = format!("{}/{}/{}", self.entity_key, self.phase, file_name);
        match self.persist_download(url, &key, bytes).await {
            Ok(record) => {
                tracing::debug!(%url, %key, size = record.size, "document saved");
                Ok(record)
            }
            Err(err) => {
                tracing::error!(%url, %key, error = %err, "failed to save document");
                let reported = StoreFailed(err.to_string());
                *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
                Err(reported)
            }
        }
    }

    async fn persist_download(
        &self,
        url: &str,
        key: &str,
        bytes: Vec<u8>,
    ) -> Result<DownloadRecord, PipelineError> {
        let store = self.store.clone();
        let path = key.to_string();
        let phase = self.phase;
        let record = tokio::task::spawn_blocking(move || {
            store.write(&path, &bytes)?;
            Ok::<_, StoreError>(DownloadRecord::for_bytes(path, &bytes, phase))
        })
        .await
        .map_err(|e| join_err("download", e))??;

        let mut snapshot = {
            let mut meta = self.metadata();
            meta.insert_download(url, record.clone());
            meta.clone()
        };
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || snapshot.save(&store))
            .await
            .map_err(|e| join_err("metadata", e))??;
        Ok(record)
    }

    /// The store failure hit during this attempt, if any.
    pub(crate) fn take_fatal(&self) -> Option<PipelineError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
