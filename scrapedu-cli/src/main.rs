//! scrapedu — resumable university crawl orchestration.
//!
//! # Usage
//!
//! ```text
//! scrapedu run [--workers N] [--ids a,b] [--phase robots ...] [--seed file.csv] [--dry-run]
//! scrapedu status [--top N] [--json]
//! scrapedu inspect <id|slug> [--json]
//! scrapedu rescrape (--ids a,b | --all) [--phase catalog ...]
//! ```
//!
//! Global flags: `--config <file>`, `--output-dir <dir>`, `--log-level <level>`.

mod commands;
mod handlers;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use commands::{
    inspect::InspectArgs, rescrape::RescrapeArgs, run::RunArgs, status::StatusArgs,
};
use scrapedu_core::{Settings, SettingsOverrides};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "scrapedu",
    version,
    about = "Crawl university sites phase by phase, resumably",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Settings file (YAML). Defaults to ./config/default.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding manifest.json and per-entity output.
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register seed entities and drive pending work through every phase.
    Run(RunArgs),

    /// Show per-status and per-phase progress of the manifest.
    Status(StatusArgs),

    /// Show one entity's phase records and metadata.
    Inspect(InspectArgs),

    /// Reset entities (or some of their phases) so the next run redoes them.
    Rescrape(RescrapeArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine; a malformed one is worth knowing about.
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("warning: ignoring .env: {err}");
        }
    }

    let settings = load_settings(&cli.global)?;
    logging::init_tracing(&settings.logging.level, settings.logging.json);

    match cli.command {
        Commands::Run(args) => args.run(settings),
        Commands::Status(args) => args.run(&settings),
        Commands::Inspect(args) => args.run(&settings),
        Commands::Rescrape(args) => args.run(&settings),
    }
}

fn load_settings(global: &GlobalArgs) -> Result<Settings> {
    let mut settings =
        Settings::load(global.config.as_deref()).context("failed to load settings")?;
    settings
        .apply_overrides(&SettingsOverrides {
            output_dir: global.output_dir.clone(),
            log_level: global.log_level.clone(),
            ..SettingsOverrides::default()
        })
        .context("invalid command-line settings")?;
    Ok(settings)
}
