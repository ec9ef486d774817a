//! The manifest: every entity state in one store-backed document.
//!
//! # Concurrency
//!
//! One `Manifest` per run, shared by `Arc`. All mutations run under a single
//! mutex and follow the same shape:
//!
//! 1. clone the current document,
//! 2. apply the change to the clone,
//! 3. commit the clone through the [`AtomicStore`],
//! 4. swap it in.
//!
//! A failed commit leaves the in-memory copy untouched, so memory never
//! holds state that is not on disk. Readers receive cloned snapshots.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ManifestError, StoreError};
use crate::slug::{disambiguate, entity_slug, is_safe_slug};
use crate::state::{EntityState, PhaseUpdate};
use crate::store::AtomicStore;
use crate::types::{Entity, EntityId, EntityStatus, Phase, Slug};

/// Store key of the manifest document.
pub const MANIFEST_KEY: &str = "manifest.json";

/// Schema version written into every manifest.
pub const MANIFEST_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

/// The serialized form of the manifest. Entity order is registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub entities: Vec<EntityState>,
}

impl ManifestDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            created_at: now,
            updated_at: now,
            entities: Vec::new(),
        }
    }

    pub fn get(&self, id: &EntityId) -> Option<&EntityState> {
        self.entities.iter().find(|s| &s.entity.id == id)
    }

    fn get_mut(&mut self, id: &EntityId) -> Result<&mut EntityState, ManifestError> {
        self.entities
            .iter_mut()
            .find(|s| &s.entity.id == id)
            .ok_or_else(|| ManifestError::UnknownEntity(id.clone()))
    }

    /// Look an entity up by id first, then by slug.
    pub fn find(&self, id_or_slug: &str) -> Option<&EntityState> {
        let key = id_or_slug.trim();
        self.entities
            .iter()
            .find(|s| s.entity.id.0 == key)
            .or_else(|| self.entities.iter().find(|s| s.entity.slug.0 == key))
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for state in &self.entities {
            counts.add(state.status);
        }
        counts
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

// ---------------------------------------------------------------------------
// Filters and targets
// ---------------------------------------------------------------------------

/// Which pending entities a claimer is willing to take.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Restrict to these ids. `None` means every entity.
    pub ids: Option<BTreeSet<EntityId>>,
    /// Phase scope of the run. When set, an entity only matches if at least
    /// one scoped phase is not yet `DONE`.
    pub phases: Option<Vec<Phase>>,
}

impl ClaimFilter {
    pub fn matches(&self, state: &EntityState) -> bool {
        if state.status != EntityStatus::Pending {
            return false;
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&state.entity.id) {
                return false;
            }
        }
        match &self.phases {
            Some(scope) => !state.pending_phases(Some(scope)).is_empty(),
            None => true,
        }
    }
}

/// Entities selected for a rescrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RescrapeTarget {
    All,
    Ids(BTreeSet<EntityId>),
}

impl RescrapeTarget {
    fn includes(&self, id: &EntityId) -> bool {
        match self {
            RescrapeTarget::All => true,
            RescrapeTarget::Ids(ids) => ids.contains(id),
        }
    }
}

/// Per-status entity counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    fn add(&mut self, status: EntityStatus) {
        match status {
            EntityStatus::Pending => self.pending += 1,
            EntityStatus::Claimed => self.claimed += 1,
            EntityStatus::Completed => self.completed += 1,
            EntityStatus::Failed => self.failed += 1,
        }
    }

    pub fn get(&self, status: EntityStatus) -> usize {
        match status {
            EntityStatus::Pending => self.pending,
            EntityStatus::Claimed => self.claimed,
            EntityStatus::Completed => self.completed,
            EntityStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.claimed + self.completed + self.failed
    }
}

// ---------------------------------------------------------------------------
// Manifest
// ---------------------------------------------------------------------------

/// Concurrent, store-backed collection of entity states.
#[derive(Debug)]
pub struct Manifest {
    store: AtomicStore,
    inner: Mutex<ManifestDocument>,
}

impl Manifest {
    /// Load `manifest.json` from `store`, or start empty when absent.
    ///
    /// A manifest that exists but cannot be parsed is an error; it is never
    /// replaced with an empty one.
    pub fn open(store: AtomicStore) -> Result<Self, ManifestError> {
        let doc = match store.read(MANIFEST_KEY) {
            Ok(bytes) => parse_document(&bytes)?,
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!(root = %store.root().display(), "no manifest yet, starting empty");
                ManifestDocument::empty(Utc::now())
            }
            Err(err) => return Err(err.into()),
        };
        tracing::debug!(entities = doc.entities.len(), "manifest loaded");
        Ok(Self {
            store,
            inner: Mutex::new(doc),
        })
    }

    pub fn store(&self) -> &AtomicStore {
        &self.store
    }

    /// Add entities that are not present yet as `PENDING`. Returns how many
    /// were added. Existing records are left untouched.
    ///
    /// A slug that is not a single plain path component is derived again
    /// from the name. A new entity whose slug is already taken by a different
    /// id gets `-<id>` appended (plus a counter if that is taken too) so
    /// directories never collide.
    pub fn register<I>(&self, entities: I) -> Result<usize, ManifestError>
    where
        I: IntoIterator<Item = Entity>,
    {
        let incoming: Vec<Entity> = entities.into_iter().collect();
        self.mutate(|doc, now| {
            let mut ids: HashSet<EntityId> =
                doc.entities.iter().map(|s| s.entity.id.clone()).collect();
            let mut slugs: HashSet<Slug> =
                doc.entities.iter().map(|s| s.entity.slug.clone()).collect();
            let mut added = 0;
            for mut entity in incoming {
                if ids.contains(&entity.id) {
                    continue;
                }
                if !is_safe_slug(&entity.slug.0) {
                    entity.slug = Slug(entity_slug(&entity.name, &entity.id.0));
                }
                entity.slug = Slug(disambiguate(&entity.slug.0, &entity.id.0, |s| {
                    slugs.contains(&Slug::from(s))
                }));
                ids.insert(entity.id.clone());
                slugs.insert(entity.slug.clone());
                doc.entities.push(EntityState::new(entity, now));
                added += 1;
            }
            Ok(added)
        })
    }

    /// Atomically claim the first pending entity matching `filter`.
    pub fn claim_next(
        &self,
        filter: &ClaimFilter,
        owner: &str,
    ) -> Result<Option<EntityState>, ManifestError> {
        self.mutate(|doc, now| {
            let Some(state) = doc.entities.iter_mut().find(|s| filter.matches(s)) else {
                return Ok(None);
            };
            state.claim(owner, now)?;
            Ok(Some(state.clone()))
        })
    }

    /// Record a phase result on a claimed entity.
    pub fn update_phase(
        &self,
        id: &EntityId,
        phase: Phase,
        update: PhaseUpdate,
    ) -> Result<EntityState, ManifestError> {
        self.mutate(|doc, now| {
            let state = doc.get_mut(id)?;
            state.record_phase(phase, update, now)?;
            Ok(state.clone())
        })
    }

    /// `CLAIMED → COMPLETED | FAILED`.
    pub fn release(
        &self,
        id: &EntityId,
        final_status: EntityStatus,
    ) -> Result<EntityState, ManifestError> {
        self.mutate(|doc, now| {
            let state = doc.get_mut(id)?;
            state.release(final_status, now)?;
            Ok(state.clone())
        })
    }

    /// `CLAIMED → PENDING`, keeping recorded phases.
    pub fn requeue(&self, id: &EntityId) -> Result<EntityState, ManifestError> {
        self.mutate(|doc, now| {
            let state = doc.get_mut(id)?;
            state.requeue(now)?;
            Ok(state.clone())
        })
    }

    /// Return every `CLAIMED` entity to `PENDING`. Run once at startup,
    /// before any worker claims.
    pub fn recover_stale_claims(&self) -> Result<usize, ManifestError> {
        self.mutate(|doc, now| {
            let mut recovered = 0;
            for state in doc
                .entities
                .iter_mut()
                .filter(|s| s.status == EntityStatus::Claimed)
            {
                let owner = state.claim.as_ref().map(|c| c.owner.clone());
                state.requeue(now)?;
                tracing::info!(
                    id = %state.entity.id,
                    slug = %state.entity.slug,
                    owner = owner.as_deref().unwrap_or("?"),
                    "recovered stale claim"
                );
                recovered += 1;
            }
            Ok(recovered)
        })
    }

    /// Reset phase records (`phases`, or all) of the targeted entities and
    /// send them back to `PENDING`. Claimed entities are skipped.
    pub fn mark_for_rescrape(
        &self,
        target: &RescrapeTarget,
        phases: Option<&[Phase]>,
    ) -> Result<Vec<EntityState>, ManifestError> {
        self.mutate(|doc, now| {
            let mut reset = Vec::new();
            for state in doc
                .entities
                .iter_mut()
                .filter(|s| target.includes(&s.entity.id))
            {
                if state.status == EntityStatus::Claimed {
                    tracing::warn!(id = %state.entity.id, "entity is claimed, not resetting");
                    continue;
                }
                state.reset(phases, now)?;
                reset.push(state.clone());
            }
            Ok(reset)
        })
    }

    pub fn get(&self, id: &EntityId) -> Option<EntityState> {
        self.lock().get(id).cloned()
    }

    pub fn find(&self, id_or_slug: &str) -> Option<EntityState> {
        self.lock().find(id_or_slug).cloned()
    }

    /// Consistent copy of the whole document.
    pub fn snapshot(&self) -> ManifestDocument {
        self.lock().clone()
    }

    pub fn summary(&self) -> StatusCounts {
        self.lock().counts()
    }

    pub fn len(&self) -> usize {
        self.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    // The guarded document is only ever replaced wholesale after a
    // successful commit, so a poisoned lock still holds a valid document.
    fn lock(&self) -> MutexGuard<'_, ManifestDocument> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<T, F>(&self, f: F) -> Result<T, ManifestError>
    where
        F: FnOnce(&mut ManifestDocument, DateTime<Utc>) -> Result<T, ManifestError>,
    {
        let mut guard = self.lock();
        let now = Utc::now();
        let mut next = guard.clone();
        let out = f(&mut next, now)?;
        if next != *guard {
            next.updated_at = now;
            self.store.write_json(MANIFEST_KEY, &next)?;
            *guard = next;
        }
        Ok(out)
    }
}

fn parse_document(bytes: &[u8]) -> Result<ManifestDocument, ManifestError> {
    let json_err = |source| StoreError::Json {
        key: MANIFEST_KEY.to_string(),
        source,
    };
    let probe: VersionProbe = serde_json::from_slice(bytes).map_err(json_err)?;
    if probe.version != MANIFEST_VERSION {
        return Err(ManifestError::UnsupportedVersion {
            found: probe.version,
            expected: MANIFEST_VERSION,
        });
    }
    Ok(serde_json::from_slice(bytes).map_err(json_err)?)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
