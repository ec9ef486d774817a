//! `scrapedu run` — register seed entities and drive the crawl.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use scrapedu_core::seed::load_seed;
use scrapedu_core::{Entity, Manifest, Phase, Settings, SettingsOverrides, StatusCounts};
use scrapedu_pipeline::progress::format_elapsed;
use scrapedu_pipeline::{Orchestrator, PlannedEntity, RateLimiter, RunOptions, RunSummary};

use super::{open_manifest, resolve_ids};
use crate::handlers::build_registry;

/// Arguments for `scrapedu run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of concurrent workers.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Only these entities (ids or slugs, comma-separated or repeated).
    #[arg(long, value_delimiter = ',')]
    pub ids: Vec<String>,

    /// Only these phases (repeatable). Other phases are left untouched.
    #[arg(long = "phase", value_name = "PHASE")]
    pub phases: Vec<Phase>,

    /// Seed CSV (`id,name,url`) to register before running.
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// List what would run without touching the manifest.
    #[arg(long)]
    pub dry_run: bool,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn run(self, mut settings: Settings) -> Result<()> {
        settings
            .apply_overrides(&SettingsOverrides {
                workers: self.workers,
                seed_file: self.seed.clone(),
                ..SettingsOverrides::default()
            })
            .context("invalid run options")?;

        let manifest = Arc::new(open_manifest(&settings)?);
        let seed = self.read_seed(&settings)?;

        let mut options = RunOptions::from_settings(&settings);
        if !self.phases.is_empty() {
            options.phases = Some(self.phases.clone());
        }

        if self.dry_run {
            let new_entities: Vec<Entity> = seed
                .into_iter()
                .flatten()
                .filter(|e| manifest.get(&e.id).is_none())
                .collect();
            if !self.ids.is_empty() {
                options.ids = Some(resolve_ids(&manifest, &self.ids)?);
            }
            let orchestrator = build_orchestrator(&settings, Arc::clone(&manifest));
            let plan = orchestrator.plan(&options);
            return print_plan(plan, new_entities, &options, self.json);
        }

        if let Some(entities) = seed {
            let added = manifest
                .register(entities)
                .context("failed to register seed entities")?;
            if added > 0 {
                tracing::info!(added, total = manifest.len(), "registered seed entities");
            }
        }
        if manifest.is_empty() {
            println!("No entities registered. Provide a seed CSV with --seed.");
            return Ok(());
        }
        if !self.ids.is_empty() {
            options.ids = Some(resolve_ids(&manifest, &self.ids)?);
        }

        let orchestrator = build_orchestrator(&settings, Arc::clone(&manifest));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let summary = runtime
            .block_on(async {
                let token = orchestrator.cancellation_token();
                let interrupt = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received, stopping after current phases");
                        token.cancel();
                    }
                });
                let result = orchestrator.run(&options).await;
                interrupt.abort();
                result
            })
            .context("run failed")?;

        print_summary(&summary, &manifest.summary(), self.json)
    }

    /// The seed file, when one was given or the configured one exists.
    fn read_seed(&self, settings: &Settings) -> Result<Option<Vec<Entity>>> {
        let path = &settings.seed_file;
        if self.seed.is_none() && !path.is_file() {
            tracing::debug!(path = %path.display(), "no seed file, using registered entities");
            return Ok(None);
        }
        let entities = load_seed(path)
            .with_context(|| format!("failed to load seed file {}", path.display()))?;
        Ok(Some(entities))
    }
}

fn build_orchestrator(settings: &Settings, manifest: Arc<Manifest>) -> Orchestrator {
    let limiter = RateLimiter::with_hosts(
        settings.min_interval(),
        settings.jitter(),
        settings.host_intervals(),
    );
    let registry = build_registry(settings);
    Orchestrator::new(manifest, Arc::new(registry), Arc::new(limiter))
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct PlanJson {
    would_register: Vec<Entity>,
    entities: Vec<PlannedEntity>,
}

#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "slug")]
    slug: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "phases to run")]
    phases: String,
}

fn print_plan(
    plan: Vec<PlannedEntity>,
    new_entities: Vec<Entity>,
    options: &RunOptions,
    json: bool,
) -> Result<()> {
    // New entities only join an unfiltered run.
    let new_entities = if options.ids.is_some() {
        Vec::new()
    } else {
        new_entities
    };

    if json {
        let payload = PlanJson {
            would_register: new_entities,
            entities: plan,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize plan JSON")?
        );
        return Ok(());
    }

    let scope: Vec<Phase> = options.phases.clone().unwrap_or_else(|| Phase::ALL.to_vec());
    let all_phases = join_phases(&scope);
    let mut rows: Vec<PlanRow> = plan
        .iter()
        .map(|p| PlanRow {
            id: p.id.to_string(),
            slug: p.slug.to_string(),
            status: p.status.to_string(),
            phases: join_phases(&p.pending_phases),
        })
        .collect();
    rows.extend(new_entities.iter().map(|e| PlanRow {
        id: e.id.to_string(),
        slug: e.slug.to_string(),
        status: "new".to_string(),
        phases: all_phases.clone(),
    }));

    println!(
        "[dry-run] {} entities would run ({} new), {} workers",
        rows.len(),
        new_entities.len(),
        options.workers,
    );
    if rows.is_empty() {
        println!("[dry-run] nothing to do");
        return Ok(());
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn join_phases(phases: &[Phase]) -> String {
    phases
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Serialize)]
struct SummaryJson<'a> {
    run: &'a RunSummary,
    manifest: &'a StatusCounts,
}

fn print_summary(summary: &RunSummary, counts: &StatusCounts, json: bool) -> Result<()> {
    if json {
        let payload = SummaryJson {
            run: summary,
            manifest: counts,
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize run summary")?
        );
        return Ok(());
    }

    let headline = format!(
        "Run finished in {}: {} claimed, {} completed, {} failed, {} requeued",
        format_elapsed(summary.elapsed),
        summary.claimed,
        summary.completed,
        summary.failed,
        summary.requeued,
    );
    if summary.interrupted {
        println!("{}", headline.yellow().bold());
        println!(
            "Interrupted: {} entities returned to pending. Run `scrapedu run` again to resume.",
            summary.requeued
        );
    } else if summary.failed > 0 {
        println!("{}", headline.red().bold());
    } else {
        println!("{}", headline.green().bold());
    }
    println!(
        "{} phase executions, {} retries, {} stale claims recovered",
        summary.phase_executions, summary.retries, summary.recovered,
    );
    println!(
        "Manifest: {} pending | {} claimed | {} completed | {} failed",
        counts.pending, counts.claimed, counts.completed, counts.failed,
    );
    Ok(())
}
