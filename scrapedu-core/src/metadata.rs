//! Per-entity `metadata.json`.
//!
//! Lives at `<output>/<slug>/metadata.json` next to the entity's downloaded
//! documents. It mirrors phase outcomes, holds data that earlier phases hand
//! to later ones, keeps an append-only error log, and records every
//! downloaded file so a resumed run never fetches the same URL twice.
//!
//! The manifest stays authoritative for status. An unreadable metadata file
//! is logged and replaced with a fresh one.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;
use crate::robots::{find_violations, RobotsViolation};
use crate::store::AtomicStore;
use crate::types::{Entity, EntityId, Phase, PhaseOutcome, PhaseRecord, Slug};

pub const METADATA_FILE: &str = "metadata.json";

/// Store key of the metadata document for `slug`.
pub fn metadata_key(slug: &Slug) -> String {
    format!("{}/{METADATA_FILE}", slug.0)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseMirror {
    pub status: PhaseOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub phase: Phase,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Path relative to the output root, e.g. `mit/catalog/index.html`.
    pub path: String,
    pub sha256: String,
    pub size: u64,
    pub phase: Phase,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub entity_id: EntityId,
    pub slug: Slug,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseMirror>,
    /// Free-form data produced by a phase, keyed by that phase.
    #[serde(default)]
    pub data: BTreeMap<Phase, serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    /// Source URL → download record.
    #[serde(default)]
    pub downloads: BTreeMap<String, DownloadRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityMetadata {
    pub fn new(entity: &Entity, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity.id.clone(),
            slug: entity.slug.clone(),
            phases: BTreeMap::new(),
            data: BTreeMap::new(),
            errors: Vec::new(),
            downloads: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Load the entity's metadata, or start a fresh document when it is
    /// missing or malformed.
    pub fn load(store: &AtomicStore, entity: &Entity) -> Result<Self, StoreError> {
        let key = metadata_key(&entity.slug);
        match store.read_json::<Self>(&key) {
            Ok(meta) => Ok(meta),
            Err(StoreError::NotFound { .. }) => Ok(Self::new(entity, Utc::now())),
            Err(StoreError::Json { source, .. }) => {
                tracing::warn!(%key, error = %source, "unreadable metadata, starting fresh");
                Ok(Self::new(entity, Utc::now()))
            }
            Err(err) => Err(err),
        }
    }

    pub fn save(&mut self, store: &AtomicStore) -> Result<PathBuf, StoreError> {
        self.updated_at = Utc::now();
        store.write_json(&metadata_key(&self.slug), self)
    }

    /// Copy the manifest's record of `phase` into the mirror.
    pub fn mirror_phase(&mut self, phase: Phase, record: &PhaseRecord) {
        self.phases.insert(
            phase,
            PhaseMirror {
                status: record.outcome,
                note: record.note.clone(),
                updated_at: record.updated_at,
            },
        );
    }

    pub fn add_error(&mut self, phase: Phase, error: impl Into<String>) {
        self.errors.push(ErrorEntry {
            phase,
            error: error.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn record_download(
        &mut self,
        url: impl Into<String>,
        path: impl Into<String>,
        bytes: &[u8],
        phase: Phase,
    ) -> DownloadRecord {
        let record = DownloadRecord::for_bytes(path, bytes, phase);
        self.insert_download(url, record.clone());
        record
    }

    pub fn insert_download(&mut self, url: impl Into<String>, record: DownloadRecord) {
        self.downloads.insert(url.into(), record);
    }

    pub fn is_downloaded(&self, url: &str) -> bool {
        self.downloads.contains_key(url)
    }

    pub fn phase_data(&self, phase: Phase) -> Option<&serde_json::Value> {
        self.data.get(&phase)
    }

    pub fn set_phase_data(&mut self, phase: Phase, value: serde_json::Value) {
        self.data.insert(phase, value);
    }

    /// Disallow rules recorded by the robots phase.
    pub fn disallow_rules(&self) -> Vec<&str> {
        self.phase_data(Phase::Robots)
            .and_then(|data| data.get("disallow_patterns"))
            .and_then(|rules| rules.as_array())
            .into_iter()
            .flatten()
            .filter_map(|rule| rule.as_str())
            .collect()
    }

    /// Downloaded URLs that the site's robots rules disallow.
    pub fn robots_violations(&self) -> Vec<RobotsViolation> {
        find_violations(
            self.downloads.keys().map(String::as_str),
            self.disallow_rules(),
        )
    }

    /// Forget everything `phases` (all when `None`) produced: mirror, data
    /// and download records. The error log is kept.
    pub fn reset_phases(&mut self, phases: Option<&[Phase]>) {
        let selected = |p: &Phase| phases.map_or(true, |s| s.contains(p));
        self.phases.retain(|p, _| !selected(p));
        self.data.retain(|p, _| !selected(p));
        self.downloads.retain(|_, d| !selected(&d.phase));
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn entity() -> Entity {
        Entity::new("166683", "Massachusetts Institute of Technology", "https://mit.edu")
    }

    #[test]
    fn sha256_of_empty_input() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn load_missing_returns_fresh_document() {
        let dir = TempDir::new().expect("tempdir");
        let store = AtomicStore::open(dir.path()).expect("store");
        let meta = EntityMetadata::load(&store, &entity()).expect("load");
        assert_eq!(meta.slug.0, "massachusetts-institute-of-technology");
        assert!(meta.downloads.is_empty());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = TempDir::new().expect("tempdir");
        let store = AtomicStore::open(dir.path()).expect("store");
        let mut meta = EntityMetadata::load(&store, &entity()).expect("load");
        meta.set_phase_data(Phase::Robots, json!({"exists": true}));
        meta.add_error(Phase::Catalog, "HTTP 503");
        meta.record_download("https://mit.edu/catalog", "x/catalog/0.html", b"<html/>", Phase::Catalog);
        let path = meta.save(&store).expect("save");
        assert!(path.ends_with("massachusetts-institute-of-technology/metadata.json"));

        let back = EntityMetadata::load(&store, &entity()).expect("reload");
        assert_eq!(back.phase_data(Phase::Robots), Some(&json!({"exists": true})));
        assert_eq!(back.errors.len(), 1);
        assert!(back.is_downloaded("https://mit.edu/catalog"));
        assert_eq!(back.downloads["https://mit.edu/catalog"].size, 7);
    }

    #[test]
    fn malformed_metadata_is_replaced() {
        let dir = TempDir::new().expect("tempdir");
        let store = AtomicStore::open(dir.path()).expect("store");
        let e = entity();
        store.write(&metadata_key(&e.slug), b"not json").expect("write");
        let meta = EntityMetadata::load(&store, &e).expect("load");
        assert!(meta.phases.is_empty());
    }

    #[test]
    fn robots_violations_come_from_recorded_rules() {
        let mut meta = EntityMetadata::new(&entity(), Utc::now());
        meta.record_download("https://mit.edu/admin/catalog.pdf", "a", b"a", Phase::Catalog);
        meta.record_download("https://mit.edu/catalog.html", "b", b"b", Phase::Catalog);
        assert!(meta.robots_violations().is_empty(), "no robots data yet");

        meta.set_phase_data(
            Phase::Robots,
            json!({"exists": true, "disallow_patterns": ["/admin", 7]}),
        );
        let found = meta.robots_violations();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].url, "https://mit.edu/admin/catalog.pdf");
        assert_eq!(found[0].matched_rule, "/admin");
    }

    #[test]
    fn reset_clears_only_selected_phases() {
        let mut meta = EntityMetadata::new(&entity(), Utc::now());
        meta.set_phase_data(Phase::Robots, json!({}));
        meta.set_phase_data(Phase::Catalog, json!({}));
        meta.record_download("a", "a", b"a", Phase::Catalog);
        meta.record_download("b", "b", b"b", Phase::Syllabi);
        meta.add_error(Phase::Catalog, "boom");

        meta.reset_phases(Some(&[Phase::Catalog]));
        assert!(meta.phase_data(Phase::Robots).is_some());
        assert!(meta.phase_data(Phase::Catalog).is_none());
        assert!(!meta.is_downloaded("a"));
        assert!(meta.is_downloaded("b"));
        assert_eq!(meta.errors.len(), 1);
    }
}
