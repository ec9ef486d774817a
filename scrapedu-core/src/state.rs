//! Per-entity state machine.
//!
//! ```text
//!            claim                 release
//!  PENDING ─────────▶ CLAIMED ─────────────▶ COMPLETED | FAILED
//!     ▲                  │                          │
//!     └──── requeue ─────┘                          │
//!     └──────────────────── rescrape ───────────────┘
//! ```
//!
//! Every method validates the current status and returns a
//! [`TransitionError`] instead of mutating when the move is illegal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::types::{Claim, Entity, EntityStatus, Phase, PhaseOutcome, PhaseRecord};

/// A phase result to record on a claimed entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseUpdate {
    Done,
    /// Nothing to do; counts as done, the reason is kept as a note.
    Skipped(String),
    /// Terminal failure of the phase.
    Failed(String),
    /// A retryable failure that will be attempted again.
    Retry(String),
}

/// Mutable state attached 1:1 to an [`Entity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityState {
    pub entity: Entity,
    pub status: EntityStatus,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
    /// Retryable failures across all phases since the last reset.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityState {
    /// A fresh `PENDING` state with every phase `NOT_STARTED`.
    pub fn new(entity: Entity, now: DateTime<Utc>) -> Self {
        Self {
            entity,
            status: EntityStatus::Pending,
            phases: Phase::ALL
                .into_iter()
                .map(|p| (p, PhaseRecord::default()))
                .collect(),
            claim: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record for `phase`; phases never written read as `NOT_STARTED`.
    pub fn phase(&self, phase: Phase) -> PhaseRecord {
        self.phases.get(&phase).cloned().unwrap_or_default()
    }

    pub fn is_phase_done(&self, phase: Phase) -> bool {
        self.phases.get(&phase).is_some_and(PhaseRecord::is_done)
    }

    pub fn all_required_done(&self) -> bool {
        Phase::ALL.into_iter().all(|p| self.is_phase_done(p))
    }

    pub fn has_failed_phase(&self) -> bool {
        self.phases
            .values()
            .any(|r| r.outcome == PhaseOutcome::Failed)
    }

    /// Phases in execution order that still need work.
    pub fn pending_phases(&self, scope: Option<&[Phase]>) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|p| scope.map_or(true, |s| s.contains(p)))
            .filter(|p| !self.is_phase_done(*p))
            .collect()
    }

    /// Status the entity should be released with, or `None` when required
    /// phases remain unfinished and it must go back to `PENDING`.
    pub fn final_status(&self) -> Option<EntityStatus> {
        if self.has_failed_phase() {
            Some(EntityStatus::Failed)
        } else if self.all_required_done() {
            Some(EntityStatus::Completed)
        } else {
            None
        }
    }

    /// `PENDING → CLAIMED`.
    pub fn claim(&mut self, owner: &str, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_status(EntityStatus::Pending, EntityStatus::Claimed)?;
        self.status = EntityStatus::Claimed;
        self.claim = Some(Claim {
            owner: owner.to_string(),
            leased_at: now,
        });
        self.updated_at = now;
        Ok(())
    }

    /// Record a phase result. Only legal while claimed.
    pub fn record_phase(
        &mut self,
        phase: Phase,
        update: PhaseUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.expect_status(EntityStatus::Claimed, EntityStatus::Claimed)?;
        let record = self.phases.entry(phase).or_default();
        match update {
            PhaseUpdate::Done => {
                record.outcome = PhaseOutcome::Done;
                record.note = None;
            }
            PhaseUpdate::Skipped(reason) => {
                record.outcome = PhaseOutcome::Done;
                record.note = Some(reason);
            }
            PhaseUpdate::Failed(reason) => {
                record.outcome = PhaseOutcome::Failed;
                record.last_error = Some(reason);
            }
            PhaseUpdate::Retry(reason) => {
                record.outcome = PhaseOutcome::NotStarted;
                record.retries += 1;
                record.last_error = Some(reason);
                self.retry_count += 1;
            }
        }
        record.updated_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `CLAIMED → COMPLETED | FAILED`.
    ///
    /// Completing requires every required phase to be `DONE`.
    pub fn release(
        &mut self,
        final_status: EntityStatus,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        let legal = match final_status {
            EntityStatus::Completed => self.all_required_done(),
            EntityStatus::Failed => true,
            EntityStatus::Pending | EntityStatus::Claimed => false,
        };
        if self.status != EntityStatus::Claimed || !legal {
            return Err(self.illegal(final_status));
        }
        self.status = final_status;
        self.claim = None;
        self.updated_at = now;
        Ok(())
    }

    /// `CLAIMED → PENDING`, keeping every recorded phase.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect_status(EntityStatus::Claimed, EntityStatus::Pending)?;
        self.status = EntityStatus::Pending;
        self.claim = None;
        self.updated_at = now;
        Ok(())
    }

    /// Rescrape: reset `phases` (all when `None`) to `NOT_STARTED` and go
    /// back to `PENDING`. Refused while claimed.
    pub fn reset(
        &mut self,
        phases: Option<&[Phase]>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status == EntityStatus::Claimed {
            return Err(self.illegal(EntityStatus::Pending));
        }
        for phase in Phase::ALL {
            if phases.map_or(true, |s| s.contains(&phase)) {
                let record = self.phases.entry(phase).or_default();
                self.retry_count = self.retry_count.saturating_sub(record.retries);
                *record = PhaseRecord {
                    updated_at: Some(now),
                    ..PhaseRecord::default()
                };
            }
        }
        if phases.is_none() {
            self.retry_count = 0;
        }
        self.status = EntityStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    fn expect_status(&self, expected: EntityStatus, to: EntityStatus) -> Result<(), TransitionError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(self.illegal(to))
        }
    }

    fn illegal(&self, to: EntityStatus) -> TransitionError {
        TransitionError {
            id: self.entity.id.clone(),
            from: self.status,
            to,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
