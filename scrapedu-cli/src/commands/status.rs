//! `scrapedu status` — progress of the manifest.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use scrapedu_core::report::DEFAULT_TOP_ERRORS;
use scrapedu_core::{EntityStatus, ManifestReport, Settings};

use super::open_manifest;

/// Arguments for `scrapedu status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// How many of the most frequent errors to list.
    #[arg(long, default_value_t = DEFAULT_TOP_ERRORS)]
    pub top: usize,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, settings: &Settings) -> Result<()> {
        let manifest = open_manifest(settings)?;
        let snapshot = manifest.snapshot();
        let mut report = ManifestReport::with_top_errors(&snapshot, self.top);
        report
            .scan_robots_violations(manifest.store(), &snapshot)
            .context("failed to check downloads against robots rules")?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_report(&report, settings);
        Ok(())
    }
}

#[derive(Tabled)]
struct PhaseRow {
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "done")]
    done: usize,
    #[tabled(rename = "skipped")]
    skipped: usize,
    #[tabled(rename = "failed")]
    failed: usize,
    #[tabled(rename = "not started")]
    not_started: usize,
    #[tabled(rename = "retries")]
    retries: u64,
}

#[derive(Tabled)]
struct ErrorRow {
    #[tabled(rename = "count")]
    count: usize,
    #[tabled(rename = "phase")]
    phase: String,
    #[tabled(rename = "reason")]
    reason: String,
}

fn print_report(report: &ManifestReport, settings: &Settings) {
    println!(
        "scrapedu v{} | {} | {} entities",
        env!("CARGO_PKG_VERSION"),
        settings.output_dir.display(),
        report.total,
    );
    if report.total == 0 {
        println!("No entities registered. Run `scrapedu run --seed <file.csv>` first.");
        return;
    }

    let statuses: Vec<String> = EntityStatus::ALL
        .into_iter()
        .map(|status| {
            format!(
                "{} {} {}",
                status_indicator(status),
                status.as_str().to_uppercase(),
                report.statuses.get(status)
            )
        })
        .collect();
    println!("{}", statuses.join("  "));
    if report.statuses.claimed > 0 {
        println!("Claimed entities are recovered at the start of the next run.");
    }

    let rows: Vec<PhaseRow> = report
        .phases
        .iter()
        .map(|(phase, counts)| PhaseRow {
            phase: phase.to_string(),
            done: counts.done,
            skipped: counts.skipped,
            failed: counts.failed,
            not_started: counts.not_started,
            retries: counts.retries,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    print_violations(report);

    if report.top_errors.is_empty() {
        return;
    }
    println!(
        "{} ({} entities with errors)",
        "Top errors".bold(),
        report.entities_with_errors
    );
    let rows: Vec<ErrorRow> = report
        .top_errors
        .iter()
        .map(|e| ErrorRow {
            count: e.count,
            phase: e.phase.to_string(),
            reason: truncate(&e.reason, 80),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn print_violations(report: &ManifestReport) {
    if report.robots_violations.is_empty() {
        return;
    }
    let total: usize = report.robots_violations.iter().map(|e| e.violations.len()).sum();
    println!(
        "{} {} downloads disallowed by robots.txt",
        "■".red().bold(),
        total
    );
    for entity in &report.robots_violations {
        for violation in &entity.violations {
            println!(
                "  {} {} ({})",
                entity.slug,
                violation.url,
                violation.matched_rule.dimmed()
            );
        }
    }
}

fn status_indicator(status: EntityStatus) -> String {
    match status {
        EntityStatus::Pending => "■".bright_black().bold().to_string(),
        EntityStatus::Claimed => "■".yellow().bold().to_string(),
        EntityStatus::Completed => "■".green().bold().to_string(),
        EntityStatus::Failed => "■".red().bold().to_string(),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate("HTTP 404", 80), "HTTP 404");
        assert_eq!(truncate("abcdef", 4), "abc…");
    }
}
