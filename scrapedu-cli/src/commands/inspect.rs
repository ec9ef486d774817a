//! `scrapedu inspect` — one entity's phase records and metadata.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use scrapedu_core::{EntityMetadata, EntityState, Phase, PhaseOutcome, RobotsViolation, Settings};

use super::open_manifest;

/// How many error log entries the table view shows.
const RECENT_ERRORS: usize = 5;

/// Arguments for `scrapedu inspect`.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Entity id or slug.
    pub entity: String,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl InspectArgs {
    pub fn run(self, settings: &Settings) -> Result<()> {
        let manifest = open_manifest(settings)?;
        let state = manifest
            .find(&self.entity)
            .with_context(|| format!("unknown entity id or slug '{}'", self.entity))?;
        let metadata = EntityMetadata::load(manifest.store(), &state.entity)
            .with_context(|| format!("failed to load metadata for '{}'", state.entity.slug))?;

        let violations = metadata.robots_violations();

        if self.json {
            let payload = InspectJson {
                state: &state,
                metadata: &metadata,
                robots_violations: &violations,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize entity JSON")?
            );
            return Ok(());
        }
        print_entity(&state, &metadata, &violations);
        Ok(())
    }
}

#[derive(Serialize)]
struct InspectJson<'a> {
    state: &'a EntityState,
    metadata: &'a EntityMetadata,
    robots_violations: &'a [RobotsViolation],
}

#[derive(Tabled)]
struct PhaseRow {
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "outcome")]
    outcome: String,
    #[tabled(rename = "retries")]
    retries: u32,
    #[tabled(rename = "detail")]
    detail: String,
    #[tabled(rename = "updated")]
    updated: String,
    #[tabled(rename = "downloads")]
    downloads: usize,
}

fn print_entity(state: &EntityState, metadata: &EntityMetadata, violations: &[RobotsViolation]) {
    let entity = &state.entity;
    println!("{} ({})", entity.name.bold(), entity.url);
    println!(
        "id {} | slug {} | status {} | {} retries",
        entity.id, entity.slug, state.status, state.retry_count
    );
    if let Some(claim) = &state.claim {
        println!(
            "claimed by {} since {}",
            claim.owner,
            format_time(claim.leased_at)
        );
    }

    let rows: Vec<PhaseRow> = Phase::ALL
        .into_iter()
        .map(|phase| {
            let record = state.phase(phase);
            let outcome = match (record.outcome, record.note.is_some()) {
                (PhaseOutcome::Done, true) => "skipped".to_string(),
                (outcome, _) => outcome.to_string(),
            };
            let detail = record
                .last_error
                .clone()
                .or(record.note.clone())
                .unwrap_or_default();
            PhaseRow {
                phase: phase.to_string(),
                outcome,
                retries: record.retries,
                detail,
                updated: record.updated_at.map(format_time).unwrap_or_default(),
                downloads: metadata.downloads.values().filter(|d| d.phase == phase).count(),
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if !metadata.data.is_empty() {
        let keys: Vec<String> = metadata.data.keys().map(|p| p.to_string()).collect();
        println!("phase data: {}", keys.join(", "));
    }
    if !violations.is_empty() {
        println!("{} ({})", "Disallowed by robots.txt".red().bold(), violations.len());
        for violation in violations {
            println!("  {} ({})", violation.url, violation.matched_rule.dimmed());
        }
    }
    if !metadata.errors.is_empty() {
        println!(
            "{} ({} total)",
            "Recent errors".bold(),
            metadata.errors.len()
        );
        let skip = metadata.errors.len().saturating_sub(RECENT_ERRORS);
        for entry in metadata.errors.iter().skip(skip) {
            println!(
                "  {} [{}] {}",
                format_time(entry.timestamp),
                entry.phase,
                entry.error.red()
            );
        }
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
