//! Domain types shared by every scrapedu crate.
//!
//! Everything here is serializable via serde and lands verbatim in
//! `manifest.json`, so renaming a variant is a schema change.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slug::entity_slug;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable identifier of an entity (for universities, the IPEDS unit id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Filesystem-safe directory name of an entity. Assigned once, never changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slug(pub String);

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Slug {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// One unit of crawl work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    pub url: String,
    pub slug: Slug,
}

impl Entity {
    /// Build an entity, deriving its slug from `name` (or from `id` when the
    /// name has no slug characters).
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>, url: impl Into<String>) -> Self {
        let id = id.into();
        let name = name.into();
        let slug = Slug(entity_slug(&name, &id.0));
        Self {
            id,
            name,
            url: url.into(),
            slug,
        }
    }

    /// Lowercased host of the entity's site, used as the rate-limiter key.
    ///
    /// Falls back to the raw URL when it cannot be parsed so that every
    /// entity still maps to *some* limiter bucket.
    pub fn host(&self) -> String {
        crate::url_utils::host_of(&self.url).unwrap_or_else(|| self.url.to_ascii_lowercase())
    }
}

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Ordered work phases. Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Access-policy check (robots.txt).
    Robots,
    Discovery,
    Catalog,
    Faculty,
    Syllabi,
}

impl Phase {
    /// Every phase, in execution order. All of them are required for an
    /// entity to count as completed.
    pub const ALL: [Phase; 5] = [
        Phase::Robots,
        Phase::Discovery,
        Phase::Catalog,
        Phase::Faculty,
        Phase::Syllabi,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Robots => "robots",
            Phase::Discovery => "discovery",
            Phase::Catalog => "catalog",
            Phase::Faculty => "faculty",
            Phase::Syllabi => "syllabi",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!("unknown phase '{s}'; expected: robots, discovery, catalog, faculty, syllabi")
            })
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Pending,
    Claimed,
    Completed,
    Failed,
}

impl EntityStatus {
    pub const ALL: [EntityStatus; 4] = [
        EntityStatus::Pending,
        EntityStatus::Claimed,
        EntityStatus::Completed,
        EntityStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityStatus::Pending => "pending",
            EntityStatus::Claimed => "claimed",
            EntityStatus::Completed => "completed",
            EntityStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EntityStatus::Completed | EntityStatus::Failed)
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded for a single phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    #[default]
    NotStarted,
    Done,
    Failed,
}

impl PhaseOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseOutcome::NotStarted => "not_started",
            PhaseOutcome::Done => "done",
            PhaseOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Persisted record of one phase of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PhaseRecord {
    pub outcome: PhaseOutcome,
    /// Retryable failures recorded since the last reset.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Reason attached to a skipped phase (still counted as done).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PhaseRecord {
    pub fn is_done(&self) -> bool {
        self.outcome == PhaseOutcome::Done
    }
}

/// Ownership of a claimed entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub owner: String,
    pub leased_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
