//! Bounded worker pool over the manifest.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use scrapedu_core::{ClaimFilter, EntityId, EntityStatus, Manifest, Phase, Settings, Slug};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{join_err, PipelineError};
use crate::limiter::RateLimiter;
use crate::progress::spawn_reporter;
use crate::registry::PhaseRegistry;
use crate::worker::{run_worker, with_manifest, Shared, Stats};

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub workers: usize,
    /// Only these entities. `None` means all.
    pub ids: Option<BTreeSet<EntityId>>,
    /// Only these phases. `None` means all.
    pub phases: Option<Vec<Phase>>,
    pub retry_budget: u32,
    pub progress_interval: Duration,
    /// Fallback wake-up while waiting on other workers' claims.
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 5,
            ids: None,
            phases: None,
            retry_budget: 3,
            progress_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }
}

impl RunOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            workers: settings.workers,
            retry_budget: settings.retry_budget,
            progress_interval: settings.progress_interval(),
            ..Self::default()
        }
    }

    pub fn filter(&self) -> ClaimFilter {
        ClaimFilter {
            ids: self.ids.clone(),
            phases: self.phases.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Stale claims reset at startup.
    pub recovered: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    pub requeued: usize,
    pub phase_executions: u64,
    pub retries: u64,
    /// The run was cancelled before the queue drained.
    pub interrupted: bool,
    pub elapsed: Duration,
}

/// One entity a run would claim, with the phases it would execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedEntity {
    pub id: EntityId,
    pub slug: Slug,
    pub name: String,
    pub status: EntityStatus,
    pub pending_phases: Vec<Phase>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    manifest: Arc<Manifest>,
    registry: Arc<PhaseRegistry>,
    limiter: Arc<RateLimiter>,
    /// Replaced after a run that ended cancelled.
    cancel: Mutex<CancellationToken>,
}

impl Orchestrator {
    pub fn new(
        manifest: Arc<Manifest>,
        registry: Arc<PhaseRegistry>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            manifest,
            registry,
            limiter,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Token that stops the current (or next) run at the next phase boundary
    /// when cancelled. Once a cancelled run returns, the orchestrator arms a
    /// fresh token, so later runs need a new handle.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    /// Entities a run with `options` would claim, without running anything.
    ///
    /// Entities left claimed by a crashed run are listed as they will be
    /// after recovery.
    pub fn plan(&self, options: &RunOptions) -> Vec<PlannedEntity> {
        let filter = options.filter();
        self.manifest
            .snapshot()
            .entities
            .into_iter()
            .filter_map(|mut state| {
                if state.status == EntityStatus::Claimed {
                    state.status = EntityStatus::Pending;
                    state.claim = None;
                }
                if !filter.matches(&state) {
                    return None;
                }
                let pending_phases = state.pending_phases(options.phases.as_deref());
                Some(PlannedEntity {
                    id: state.entity.id,
                    slug: state.entity.slug,
                    name: state.entity.name,
                    status: state.status,
                    pending_phases,
                })
            })
            .collect()
    }

    /// Recover stale claims, then drive every matching entity until the
    /// queue drains or the run is cancelled.
    ///
    /// A store failure in any worker cancels the others and is returned once
    /// all of them have stopped.
    pub async fn run(&self, options: &RunOptions) -> Result<RunSummary, PipelineError> {
        let cancel = self.cancellation_token();
        let result = self.run_with(options, &cancel).await;
        if cancel.is_cancelled() {
            let mut current = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
        }
        result
    }

    async fn run_with(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let recovered = with_manifest(&self.manifest, |m| m.recover_stale_claims()).await?;
        if recovered > 0 {
            tracing::info!(recovered, "reset stale claims from a previous run");
        }

        let run_token = cancel.child_token();
        let shared = Arc::new(Shared {
            manifest: Arc::clone(&self.manifest),
            registry: Arc::clone(&self.registry),
            limiter: Arc::clone(&self.limiter),
            cancel: run_token.clone(),
            filter: options.filter(),
            scope: options.phases.clone(),
            retry_budget: options.retry_budget,
            poll_interval: options.poll_interval,
            in_flight: AtomicUsize::new(0),
            released: Notify::new(),
            stats: Stats::default(),
        });

        let workers = options.workers.max(1);
        tracing::info!(
            workers,
            entities = self.manifest.len(),
            retry_budget = options.retry_budget,
            "starting run"
        );

        let reporter_stop = CancellationToken::new();
        let reporter = spawn_reporter(
            Arc::clone(&self.manifest),
            options.progress_interval,
            reporter_stop.clone(),
        );

        let mut pool = JoinSet::new();
        for index in 0..workers {
            let shared = Arc::clone(&shared);
            pool.spawn(async move {
                let result = run_worker(Arc::clone(&shared), index).await;
                if result.is_err() {
                    shared.cancel.cancel();
                }
                result
            });
        }

        let mut first_error = None;
        while let Some(joined) = pool.join_next().await {
            let result = joined.map_err(|e| join_err("worker", e)).and_then(|r| r);
            if let Err(err) = result {
                tracing::error!(error = %err, "worker failed, stopping run");
                run_token.cancel();
                first_error.get_or_insert(err);
            }
        }

        reporter_stop.cancel();
        if let Err(err) = reporter.await {
            tracing::warn!(error = %err, "progress reporter did not stop cleanly");
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let stats = &shared.stats;
        let summary = RunSummary {
            recovered,
            claimed: stats.claimed.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            requeued: stats.requeued.load(Ordering::Relaxed),
            phase_executions: stats.phase_executions.load(Ordering::Relaxed),
            retries: stats.retries.load(Ordering::Relaxed),
            interrupted: cancel.is_cancelled(),
            elapsed: started.elapsed(),
        };
        tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            requeued = summary.requeued,
            executions = summary.phase_executions,
            interrupted = summary.interrupted,
            "run finished"
        );
        Ok(summary)
    }
}
