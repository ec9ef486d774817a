//! scrapedu core library: domain types, persistence, and the manifest.
//!
//! - [`types`] — entities, phases, statuses
//! - [`store`] — atomic document store
//! - [`state`] — per-entity state machine
//! - [`manifest`] — concurrent store-backed entity collection
//! - [`metadata`] — per-entity `metadata.json`
//! - [`report`] — progress report over a manifest
//! - [`robots`] — downloaded URLs vs. recorded robots rules
//! - [`config`] — layered settings
//! - [`seed`] — CSV reference-data loader

pub mod config;
pub mod error;
pub mod manifest;
pub mod metadata;
pub mod report;
pub mod robots;
pub mod seed;
pub mod slug;
pub mod state;
pub mod store;
pub mod types;
pub mod url_utils;

pub use config::{Settings, SettingsOverrides};
pub use error::{ManifestError, SeedError, SettingsError, StoreError, TransitionError};
pub use manifest::{
    ClaimFilter, Manifest, ManifestDocument, RescrapeTarget, StatusCounts, MANIFEST_KEY,
};
pub use metadata::{DownloadRecord, EntityMetadata};
pub use report::ManifestReport;
pub use robots::{EntityViolations, RobotsViolation};
pub use state::{EntityState, PhaseUpdate};
pub use store::AtomicStore;
pub use types::{
    Claim, Entity, EntityId, EntityStatus, Phase, PhaseOutcome, PhaseRecord, Slug,
};
