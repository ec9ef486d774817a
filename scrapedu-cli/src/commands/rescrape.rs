//! `scrapedu rescrape` — reset entities so the next run redoes them.

use anyhow::{Context, Result};
use clap::Args;

use scrapedu_core::{Phase, RescrapeTarget, Settings};
use scrapedu_pipeline::rescrape;

use super::{open_manifest, resolve_ids};

/// Arguments for `scrapedu rescrape`.
#[derive(Args, Debug)]
pub struct RescrapeArgs {
    /// Entities to reset (ids or slugs, comma-separated or repeated).
    #[arg(long, value_delimiter = ',', required_unless_present = "all")]
    pub ids: Vec<String>,

    /// Reset every entity.
    #[arg(long, conflicts_with = "ids")]
    pub all: bool,

    /// Only reset these phases (repeatable). Defaults to all phases.
    #[arg(long = "phase", value_name = "PHASE")]
    pub phases: Vec<Phase>,
}

impl RescrapeArgs {
    pub fn run(self, settings: &Settings) -> Result<()> {
        let manifest = open_manifest(settings)?;
        let target = if self.all {
            RescrapeTarget::All
        } else {
            RescrapeTarget::Ids(resolve_ids(&manifest, &self.ids)?)
        };
        let phases = (!self.phases.is_empty()).then_some(self.phases.as_slice());

        let reset = rescrape(&manifest, &target, phases).context("rescrape failed")?;
        let scope = match phases {
            Some(phases) => phases
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", "),
            None => "all phases".to_string(),
        };
        if reset.is_empty() {
            println!("Nothing reset ({scope}).");
            return Ok(());
        }
        println!("✓ {} entities reset ({scope})", reset.len());
        for state in &reset {
            println!("  {} {}", state.entity.id, state.entity.slug);
        }
        println!("Run `scrapedu run` to crawl them again.");
        Ok(())
    }
}
