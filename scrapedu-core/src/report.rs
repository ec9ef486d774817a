//! Progress report derived from a manifest document.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::error::StoreError;
use crate::manifest::{ManifestDocument, StatusCounts};
use crate::metadata::{metadata_key, EntityMetadata};
use crate::robots::EntityViolations;
use crate::slug::is_safe_slug;
use crate::store::AtomicStore;
use crate::types::{Phase, PhaseOutcome};

/// How many error reasons [`ManifestReport::from_document`] keeps.
pub const DEFAULT_TOP_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseCounts {
    pub not_started: usize,
    pub done: usize,
    pub failed: usize,
    /// Done phases that carry a skip note.
    pub skipped: usize,
    /// Sum of recorded retries.
    pub retries: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub phase: Phase,
    pub reason: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestReport {
    pub total: usize,
    pub statuses: StatusCounts,
    pub phases: BTreeMap<Phase, PhaseCounts>,
    /// Entities with at least one failed phase.
    pub entities_with_errors: usize,
    /// Most frequent `(phase, last error)` pairs over failed phases, most
    /// frequent first. Errors of phases that later succeeded are not counted.
    pub top_errors: Vec<ErrorCount>,
    /// Downloads that the site's robots rules disallow. Filled by
    /// [`ManifestReport::scan_robots_violations`].
    pub robots_violations: Vec<EntityViolations>,
}

impl ManifestReport {
    pub fn from_document(doc: &ManifestDocument) -> Self {
        Self::with_top_errors(doc, DEFAULT_TOP_ERRORS)
    }

    pub fn with_top_errors(doc: &ManifestDocument, limit: usize) -> Self {
        let mut phases: BTreeMap<Phase, PhaseCounts> =
            Phase::ALL.into_iter().map(|p| (p, PhaseCounts::default())).collect();
        let mut errors: HashMap<(Phase, &str), usize> = HashMap::new();
        let mut entities_with_errors = 0;

        for state in &doc.entities {
            let mut had_error = false;
            for phase in Phase::ALL {
                let counts = phases.entry(phase).or_default();
                let Some(record) = state.phases.get(&phase) else {
                    counts.not_started += 1;
                    continue;
                };
                match record.outcome {
                    PhaseOutcome::NotStarted => counts.not_started += 1,
                    PhaseOutcome::Done => {
                        counts.done += 1;
                        if record.note.is_some() {
                            counts.skipped += 1;
                        }
                    }
                    PhaseOutcome::Failed => counts.failed += 1,
                }
                counts.retries += u64::from(record.retries);
                if record.outcome != PhaseOutcome::Failed {
                    continue;
                }
                had_error = true;
                let reason = record.last_error.as_deref().unwrap_or("unknown error");
                *errors.entry((phase, reason)).or_default() += 1;
            }
            if had_error {
                entities_with_errors += 1;
            }
        }

        let mut top_errors: Vec<ErrorCount> = errors
            .into_iter()
            .map(|((phase, reason), count)| ErrorCount {
                phase,
                reason: reason.to_string(),
                count,
            })
            .collect();
        top_errors.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then(a.phase.cmp(&b.phase))
                .then_with(|| a.reason.cmp(&b.reason))
        });
        top_errors.truncate(limit);

        Self {
            total: doc.entities.len(),
            statuses: doc.counts(),
            phases,
            entities_with_errors,
            top_errors,
            robots_violations: Vec::new(),
        }
    }

    /// Check every entity's downloads against its recorded robots rules.
    /// Entities without a metadata file are skipped.
    pub fn scan_robots_violations(
        &mut self,
        store: &AtomicStore,
        doc: &ManifestDocument,
    ) -> Result<(), StoreError> {
        self.robots_violations.clear();
        for state in &doc.entities {
            let entity = &state.entity;
            if !is_safe_slug(&entity.slug.0) || !store.exists(&metadata_key(&entity.slug))? {
                continue;
            }
            let violations = EntityMetadata::load(store, entity)?.robots_violations();
            if violations.is_empty() {
                continue;
            }
            tracing::warn!(slug = %entity.slug, count = violations.len(), "robots rules violated");
            self.robots_violations.push(EntityViolations {
                id: entity.id.clone(),
                slug: entity.slug.clone(),
                violations,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EntityState, PhaseUpdate};
    use crate::types::{Entity, EntityStatus};
    use chrono::Utc;

    fn state(id: &str, updates: &[(Phase, PhaseUpdate)]) -> EntityState {
        let now = Utc::now();
        let mut s = EntityState::new(Entity::new(id, format!("School {id}"), "https://x.edu"), now);
        s.claim("w", now).expect("claim");
        for (phase, update) in updates {
            s.record_phase(*phase, update.clone(), now).expect("record");
        }
        s
    }

    #[test]
    fn counts_statuses_phases_and_errors() {
        let mut doc = ManifestDocument::empty(Utc::now());
        let mut a = state(
            "1",
            &[
                (Phase::Robots, PhaseUpdate::Done),
                (Phase::Discovery, PhaseUpdate::Skipped("no handler configured".into())),
                (Phase::Catalog, PhaseUpdate::Failed("HTTP 404".into())),
            ],
        );
        a.release(EntityStatus::Failed, Utc::now()).expect("release");
        let b = state(
            "2",
            &[
                (Phase::Robots, PhaseUpdate::Retry("timeout".into())),
                (Phase::Catalog, PhaseUpdate::Failed("HTTP 404".into())),
            ],
        );
        doc.entities = vec![a, b];

        let report = ManifestReport::from_document(&doc);
        assert_eq!(report.total, 2);
        assert_eq!(report.statuses.get(EntityStatus::Failed), 1);
        assert_eq!(report.statuses.get(EntityStatus::Claimed), 1);

        let robots = report.phases[&Phase::Robots];
        assert_eq!((robots.done, robots.not_started, robots.retries), (1, 1, 1));
        assert_eq!(report.phases[&Phase::Discovery].skipped, 1);
        assert_eq!(report.phases[&Phase::Catalog].failed, 2);

        assert_eq!(report.entities_with_errors, 2);
        assert_eq!(
            report.top_errors[0],
            ErrorCount {
                phase: Phase::Catalog,
                reason: "HTTP 404".into(),
                count: 2
            }
        );
        // The robots retry of entity 2 is not a failure.
        assert_eq!(report.top_errors.len(), 1);
    }

    #[test]
    fn errors_of_phases_that_recovered_are_not_counted() {
        let mut doc = ManifestDocument::empty(Utc::now());
        doc.entities = vec![state(
            "1",
            &[
                (Phase::Catalog, PhaseUpdate::Retry("HTTP 429".into())),
                (Phase::Catalog, PhaseUpdate::Retry("HTTP 429".into())),
                (Phase::Catalog, PhaseUpdate::Done),
            ],
        )];
        let report = ManifestReport::from_document(&doc);
        assert_eq!(report.entities_with_errors, 0);
        assert!(report.top_errors.is_empty());
        assert_eq!(report.phases[&Phase::Catalog].retries, 2);
    }

    #[test]
    fn scan_lists_entities_with_disallowed_downloads() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = AtomicStore::open(dir.path()).expect("store");
        let mut doc = ManifestDocument::empty(Utc::now());
        doc.entities = vec![state("1", &[]), state("2", &[]), state("3", &[])];

        let mut meta = EntityMetadata::new(&doc.entities[0].entity, Utc::now());
        meta.set_phase_data(Phase::Robots, serde_json::json!({"disallow_patterns": ["/private"]}));
        meta.record_download("https://x.edu/private/a.pdf", "school-1/catalog/a.pdf", b"a", Phase::Catalog);
        meta.save(&store).expect("save");
        let mut clean = EntityMetadata::new(&doc.entities[1].entity, Utc::now());
        clean.record_download("https://x.edu/private/b.pdf", "school-2/catalog/b.pdf", b"b", Phase::Catalog);
        clean.save(&store).expect("save");

        let mut report = ManifestReport::from_document(&doc);
        report.scan_robots_violations(&store, &doc).expect("scan");
        assert_eq!(report.robots_violations.len(), 1);
        let listed = &report.robots_violations[0];
        assert_eq!(listed.slug.0, "school-1");
        assert_eq!(listed.violations[0].matched_rule, "/private");
        assert!(!dir.path().join("school-3").exists(), "scan writes nothing");
    }

    #[test]
    fn top_errors_are_truncated() {
        let mut doc = ManifestDocument::empty(Utc::now());
        doc.entities = (0..5)
            .map(|i| {
                state(
                    &i.to_string(),
                    &[(Phase::Faculty, PhaseUpdate::Failed(format!("error {i}")))],
                )
            })
            .collect();
        let report = ManifestReport::with_top_errors(&doc, 3);
        assert_eq!(report.top_errors.len(), 3);
        assert_eq!(report.top_errors[0].reason, "error 0");
    }
}
