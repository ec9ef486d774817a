//! The worker loop: claim an entity, drive it through its phases, release.
//!
//! Manifest and metadata writes are synchronous and run on the blocking
//! pool. Per phase attempt the order is fixed:
//!
//! 1. rate-limiter slot (network-bound handlers only)
//! 2. handler
//! 3. `metadata.json` (mirror + error log)
//! 4. manifest `update_phase`, the commit point
//!
//! Cancellation is checked before every attempt, never during one. A handler
//! that panics is recorded as a permanent failure of its phase.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use scrapedu_core::{
    ClaimFilter, Entity, EntityMetadata, EntityState, EntityStatus, Manifest, ManifestError,
    Phase, PhaseUpdate,
};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::PhaseContext;
use crate::error::{join_err, PipelineError};
use crate::limiter::RateLimiter;
use crate::progress::format_elapsed;
use crate::registry::{Outcome, PhaseRegistry};

/// State shared by every worker of one run.
pub(crate) struct Shared {
    pub manifest: Arc<Manifest>,
    pub registry: Arc<PhaseRegistry>,
    pub limiter: Arc<RateLimiter>,
    pub cancel: CancellationToken,
    pub filter: ClaimFilter,
    pub scope: Option<Vec<Phase>>,
    pub retry_budget: u32,
    pub poll_interval: Duration,
    /// Workers currently holding (or trying to take) a claim.
    pub in_flight: AtomicUsize,
    pub released: Notify,
    pub stats: Stats,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub claimed: AtomicUsize,
    pub finished: AtomicUsize,
    pub completed: AtomicUsize,
    pub failed: AtomicUsize,
    pub requeued: AtomicUsize,
    pub phase_executions: AtomicU64,
    pub retries: AtomicU64,
}

/// Run a manifest operation on the blocking pool.
pub(crate) async fn with_manifest<T, F>(manifest: &Arc<Manifest>, f: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&Manifest) -> Result<T, ManifestError> + Send + 'static,
{
    let manifest = Arc::clone(manifest);
    let result = tokio::task::spawn_blocking(move || f(&manifest))
        .await
        .map_err(|e| join_err("manifest", e))?;
    Ok(result?)
}

pub(crate) async fn run_worker(shared: Arc<Shared>, index: usize) -> Result<(), PipelineError> {
    let owner = format!("worker-{index}");
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }
        let notified = shared.released.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let filter = shared.filter.clone();
        let who = owner.clone();
        let claimed = with_manifest(&shared.manifest, move |m| m.claim_next(&filter, &who)).await;

        let state = match claimed {
            Ok(Some(state)) => state,
            Ok(None) => {
                let others = shared.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
                if others == 0 {
                    shared.released.notify_waiters();
                    break;
                }
                // Someone still holds a claim and may requeue it.
                tokio::select! {
                    _ = &mut notified => {}
                    _ = tokio::time::sleep(shared.poll_interval) => {}
                    _ = shared.cancel.cancelled() => break,
                }
                continue;
            }
            Err(err) => {
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
                shared.released.notify_waiters();
                return Err(err);
            }
        };

        shared.stats.claimed.fetch_add(1, Ordering::Relaxed);
        let result = drive_entity(&shared, state, &owner).await;
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        shared.released.notify_waiters();
        result?;
    }
    tracing::debug!(worker = %owner, "worker stopped");
    Ok(())
}

async fn drive_entity(
    shared: &Shared,
    state: EntityState,
    owner: &str,
) -> Result<(), PipelineError> {
    let started = Instant::now();
    let entity = state.entity.clone();
    let host = entity.host();
    let store = shared.manifest.store().clone();
    tracing::debug!(id = %entity.id, slug = %entity.slug, %owner, "claimed entity");

    let metadata = {
        let store = store.clone();
        let entity = entity.clone();
        tokio::task::spawn_blocking(move || EntityMetadata::load(&store, &entity))
            .await
            .map_err(|e| join_err("metadata", e))??
    };
    let metadata = Arc::new(Mutex::new(metadata));

    let mut current = state;
    let mut interrupted = false;

    'phases: for def in shared.registry.ordered(shared.scope.as_deref()) {
        let phase = def.phase;
        if current.is_phase_done(phase) {
            tracing::debug!(slug = %entity.slug, %phase, "phase already done, skipping");
            continue;
        }

        let mut attempt = 0;
        loop {
            if shared.cancel.is_cancelled() {
                interrupted = true;
                break 'phases;
            }
            attempt += 1;
            if def.handler.network_bound() {
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => {
                        interrupted = true;
                        break 'phases;
                    }
                    _ = shared.limiter.acquire(&host) => {}
                }
            }

            let ctx = PhaseContext::new(
                phase,
                attempt,
                &entity,
                store.clone(),
                Arc::clone(&shared.limiter),
                shared.cancel.clone(),
                Arc::clone(&metadata),
            );
            let outcome = match AssertUnwindSafe(def.handler.execute(&entity, &ctx))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!(slug = %entity.slug, %phase, %message, "phase handler panicked");
                    Outcome::permanent(format!("handler panicked: {message}"))
                }
            };
            shared.stats.phase_executions.fetch_add(1, Ordering::Relaxed);
            if let Some(err) = ctx.take_fatal() {
                return Err(err);
            }

            let retries = current.phase(phase).retries;
            let update = classify(outcome, retries, shared.retry_budget);
            log_update(&entity, phase, attempt, &update, retries, shared.retry_budget);
            let retry = matches!(update, PhaseUpdate::Retry(_));
            current = record(shared, &metadata, &current, phase, update).await?;
            if retry {
                shared.stats.retries.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            break;
        }
    }

    let final_status = if interrupted {
        None
    } else {
        current.final_status()
    };
    let id = entity.id.clone();
    let released = match final_status {
        Some(status) => with_manifest(&shared.manifest, move |m| m.release(&id, status)).await?,
        None => with_manifest(&shared.manifest, move |m| m.requeue(&id)).await?,
    };

    match released.status {
        EntityStatus::Completed => shared.stats.completed.fetch_add(1, Ordering::Relaxed),
        EntityStatus::Failed => shared.stats.failed.fetch_add(1, Ordering::Relaxed),
        _ => shared.stats.requeued.fetch_add(1, Ordering::Relaxed),
    };
    let finished = shared.stats.finished.fetch_add(1, Ordering::Relaxed) + 1;
    let claimed = shared.stats.claimed.load(Ordering::Relaxed);
    let label = match released.status {
        EntityStatus::Pending => "requeued",
        other => other.as_str(),
    };
    tracing::info!(
        id = %entity.id,
        slug = %entity.slug,
        status = %released.status,
        "[{finished}/{claimed}] {label} {} ({})",
        entity.slug,
        format_elapsed(started.elapsed()),
    );
    Ok(())
}

/// Map a handler outcome to the update recorded in the manifest.
///
/// A retryable failure is retried while the phase's recorded retries are
/// below `budget`, so budget `n` allows `n + 1` attempts.
pub(crate) fn classify(outcome: Outcome, retries: u32, budget: u32) -> PhaseUpdate {
    match outcome {
        Outcome::Done => PhaseUpdate::Done,
        Outcome::Skipped(note) => PhaseUpdate::Skipped(note),
        Outcome::Failed {
            reason,
            retryable: true,
        } if retries < budget => PhaseUpdate::Retry(reason),
        Outcome::Failed { reason, .. } => PhaseUpdate::Failed(reason),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn log_update(
    entity: &Entity,
    phase: Phase,
    attempt: u32,
    update: &PhaseUpdate,
    retries: u32,
    budget: u32,
) {
    match update {
        PhaseUpdate::Done => {
            tracing::debug!(slug = %entity.slug, %phase, attempt, "phase done");
        }
        PhaseUpdate::Skipped(note) => {
            tracing::debug!(slug = %entity.slug, %phase, %note, "phase skipped");
        }
        PhaseUpdate::Retry(reason) => {
            tracing::warn!(
                slug = %entity.slug,
                %phase,
                attempt,
                retry = retries + 1,
                budget,
                %reason,
                "phase failed, retrying"
            );
        }
        PhaseUpdate::Failed(reason) => {
            tracing::warn!(slug = %entity.slug, %phase, attempt, %reason, "phase failed");
        }
    }
}

async fn record(
    shared: &Shared,
    metadata: &Arc<Mutex<EntityMetadata>>,
    current: &EntityState,
    phase: Phase,
    update: PhaseUpdate,
) -> Result<EntityState, PipelineError> {
    // Apply locally first so the metadata mirror matches what the manifest
    // is about to commit.
    let mut preview = current.clone();
    preview
        .record_phase(phase, update.clone(), Utc::now())
        .map_err(ManifestError::from)?;
    let mut snapshot = {
        let mut meta = metadata.lock().unwrap_or_else(PoisonError::into_inner);
        meta.mirror_phase(phase, &preview.phase(phase));
        if let PhaseUpdate::Failed(reason) | PhaseUpdate::Retry(reason) = &update {
            meta.add_error(phase, reason.clone());
        }
        meta.clone()
    };

    let store = shared.manifest.store().clone();
    tokio::task::spawn_blocking(move || snapshot.save(&store))
        .await
        .map_err(|e| join_err("metadata", e))??;

    let id = current.entity.id.clone();
    with_manifest(&shared.manifest, move |m| m.update_phase(&id, phase, update)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Outcome::Done, 0, PhaseUpdate::Done)]
    #[case(Outcome::skipped("nothing"), 0, PhaseUpdate::Skipped("nothing".into()))]
    #[case(Outcome::transient("HTTP 429"), 0, PhaseUpdate::Retry("HTTP 429".into()))]
    #[case(Outcome::transient("HTTP 429"), 2, PhaseUpdate::Retry("HTTP 429".into()))]
    #[case(Outcome::transient("HTTP 429"), 3, PhaseUpdate::Failed("HTTP 429".into()))]
    #[case(Outcome::permanent("HTTP 404"), 0, PhaseUpdate::Failed("HTTP 404".into()))]
    fn classify_against_budget_of_three(
        #[case] outcome: Outcome,
        #[case] retries: u32,
        #[case] expected: PhaseUpdate,
    ) {
        assert_eq!(classify(outcome, retries, 3), expected);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let borrowed: Box<dyn Any + Send> = Box::new("parser bug");
        let owned: Box<dyn Any + Send> = Box::new(String::from("index out of range"));
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(borrowed.as_ref()), "parser bug");
        assert_eq!(panic_message(owned.as_ref()), "index out of range");
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }

    #[test]
    fn zero_budget_never_retries() {
        assert_eq!(
            classify(Outcome::transient("timeout"), 0, 0),
            PhaseUpdate::Failed("timeout".into())
        );
    }
}
