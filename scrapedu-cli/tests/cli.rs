use std::fs;
use std::path::Path;
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;
use serde_json::Value;
use tempfile::TempDir;

use scrapedu_core::{
    AtomicStore, ClaimFilter, Entity, EntityMetadata, EntityStatus, Manifest, Phase, PhaseUpdate,
    MANIFEST_KEY,
};

const SEED: &str = "\
id,name,url
166027,Harvard University,harvard.edu
166683,Massachusetts Institute of Technology,https://web.mit.edu/
";

/// `scrapedu` running in `workdir` against `workdir/out`, isolated from the
/// caller's environment.
fn scrapedu_cmd(workdir: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_scrapedu"));
    cmd.current_dir(workdir)
        .env_remove("RUST_LOG")
        .env_remove("SCRAPEDU_OUTPUT_DIR")
        .env_remove("SCRAPEDU_SEED_FILE")
        .env_remove("SCRAPEDU_WORKERS")
        .env("XDG_CONFIG_HOME", workdir.join("xdg"))
        .args(["--output-dir", "out", "--log-level", "warn"]);
    cmd
}

fn stdout_json(output: &std::process::Output) -> Value {
    let stdout = String::from_utf8(output.stdout.clone()).expect("stdout utf8");
    serde_json::from_str(&stdout).expect("stdout is JSON")
}

fn write_seed(dir: &TempDir) {
    fs::write(dir.path().join("seed.csv"), SEED).expect("write seed");
}

fn open_manifest(dir: &TempDir) -> Manifest {
    let store = AtomicStore::open(dir.path().join("out")).expect("store");
    Manifest::open(store).expect("manifest")
}

fn completed_entity(dir: &TempDir) -> Entity {
    let manifest = open_manifest(dir);
    let entity = Entity::new("1", "Alpha University", "https://alpha.edu");
    manifest.register(vec![entity.clone()]).expect("register");
    manifest
        .claim_next(&ClaimFilter::default(), "w0")
        .expect("claim");
    for phase in Phase::ALL {
        manifest
            .update_phase(&entity.id, phase, PhaseUpdate::Done)
            .expect("update");
    }
    manifest
        .release(&entity.id, EntityStatus::Completed)
        .expect("release");
    entity
}

#[test]
fn status_json_on_empty_output_dir() {
    let dir = TempDir::new().expect("tempdir");
    let output = scrapedu_cmd(dir.path())
        .args(["status", "--json"])
        .output()
        .expect("spawn");
    assert!(output.status.success(), "{output:?}");

    let report = stdout_json(&output);
    assert_eq!(report["total"], 0);
    assert_eq!(report["statuses"]["pending"], 0);
    assert!(report["top_errors"].as_array().expect("array").is_empty());
    assert!(!dir.path().join("out").join(MANIFEST_KEY).exists());
}

#[test]
fn dry_run_lists_seed_without_registering() {
    let dir = TempDir::new().expect("tempdir");
    write_seed(&dir);

    let output = scrapedu_cmd(dir.path())
        .args(["run", "--seed", "seed.csv", "--dry-run", "--json"])
        .output()
        .expect("spawn");
    assert!(output.status.success(), "{output:?}");

    let plan = stdout_json(&output);
    let new: Vec<&str> = plan["would_register"]
        .as_array()
        .expect("array")
        .iter()
        .filter_map(|e| e["slug"].as_str())
        .collect();
    assert_eq!(
        new,
        vec!["harvard-university", "massachusetts-institute-of-technology"]
    );
    assert!(plan["entities"].as_array().expect("array").is_empty());
    assert!(!dir.path().join("out").join(MANIFEST_KEY).exists());
}

#[test]
fn discovery_only_run_registers_and_requeues() {
    let dir = TempDir::new().expect("tempdir");
    write_seed(&dir);

    // Discovery has no built-in handler, so this run never touches the network.
    let output = scrapedu_cmd(dir.path())
        .args(["run", "--seed", "seed.csv", "--phase", "discovery", "--json"])
        .output()
        .expect("spawn");
    assert!(output.status.success(), "{output:?}");

    let summary = stdout_json(&output);
    assert_eq!(summary["run"]["claimed"], 2);
    assert_eq!(summary["run"]["requeued"], 2);
    assert_eq!(summary["run"]["interrupted"], false);
    assert_eq!(summary["manifest"]["pending"], 2);

    let manifest = open_manifest(&dir);
    let state = manifest.find("harvard-university").expect("registered");
    assert_eq!(state.status, EntityStatus::Pending);
    assert!(state.is_phase_done(Phase::Discovery));
    assert!(state.phase(Phase::Discovery).note.is_some());
    assert!(!state.is_phase_done(Phase::Robots));
    assert_eq!(state.entity.url, "https://harvard.edu");
}

#[test]
fn rescrape_resets_one_phase() {
    let dir = TempDir::new().expect("tempdir");
    let entity = completed_entity(&dir);

    scrapedu_cmd(dir.path())
        .args(["rescrape", "--ids", "alpha-university", "--phase", "catalog"])
        .assert()
        .success()
        .stdout(contains("1 entities reset (catalog)"));

    let state = open_manifest(&dir).get(&entity.id).expect("state");
    assert_eq!(state.status, EntityStatus::Pending);
    assert_eq!(state.pending_phases(None), vec![Phase::Catalog]);
}

#[test]
fn rescrape_needs_a_target() {
    let dir = TempDir::new().expect("tempdir");
    scrapedu_cmd(dir.path())
        .args(["rescrape"])
        .assert()
        .failure();
}

#[test]
fn inspect_shows_entity_and_rejects_unknown() {
    let dir = TempDir::new().expect("tempdir");
    completed_entity(&dir);

    let output = scrapedu_cmd(dir.path())
        .args(["inspect", "1", "--json"])
        .output()
        .expect("spawn");
    assert!(output.status.success(), "{output:?}");
    let payload = stdout_json(&output);
    assert_eq!(payload["state"]["status"], "completed");
    assert_eq!(payload["metadata"]["slug"], "alpha-university");

    scrapedu_cmd(dir.path())
        .args(["inspect", "nope"])
        .assert()
        .failure()
        .stderr(contains("unknown entity id or slug 'nope'"));
}

#[test]
fn disallowed_downloads_are_reported() {
    let dir = TempDir::new().expect("tempdir");
    let entity = completed_entity(&dir);
    let store = AtomicStore::open(dir.path().join("out")).expect("store");
    let mut meta = EntityMetadata::load(&store, &entity).expect("metadata");
    meta.set_phase_data(
        Phase::Robots,
        serde_json::json!({"exists": true, "disallow_patterns": ["/internal"]}),
    );
    meta.record_download(
        "https://alpha.edu/internal/catalog.pdf",
        "alpha-university/catalog/000-catalog.pdf",
        b"%PDF",
        Phase::Catalog,
    );
    meta.save(&store).expect("save");

    let output = scrapedu_cmd(dir.path())
        .args(["inspect", "alpha-university", "--json"])
        .output()
        .expect("spawn");
    assert!(output.status.success(), "{output:?}");
    let payload = stdout_json(&output);
    assert_eq!(payload["robots_violations"][0]["matched_rule"], "/internal");

    let output = scrapedu_cmd(dir.path())
        .args(["status", "--json"])
        .output()
        .expect("spawn");
    assert!(output.status.success(), "{output:?}");
    let report = stdout_json(&output);
    let listed = &report["robots_violations"][0];
    assert_eq!(listed["slug"], "alpha-university");
    assert_eq!(
        listed["violations"][0]["url"],
        "https://alpha.edu/internal/catalog.pdf"
    );
}

#[test]
fn invalid_workers_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    scrapedu_cmd(dir.path())
        .args(["run", "--workers", "0", "--dry-run"])
        .assert()
        .failure()
        .stderr(contains("workers"));
}
