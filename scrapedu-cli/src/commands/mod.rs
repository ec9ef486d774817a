pub mod inspect;
pub mod rescrape;
pub mod run;
pub mod status;

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use scrapedu_core::{AtomicStore, EntityId, Manifest, Settings};

/// Open (or create) the manifest under the configured output directory.
pub fn open_manifest(settings: &Settings) -> Result<Manifest> {
    let store = AtomicStore::open(&settings.output_dir).with_context(|| {
        format!(
            "failed to open output directory {}",
            settings.output_dir.display()
        )
    })?;
    Manifest::open(store).context("failed to open manifest")
}

/// Resolve ids or slugs given on the command line to entity ids.
///
/// Accepts repeated flags and comma-separated lists.
pub fn resolve_ids(manifest: &Manifest, raw: &[String]) -> Result<BTreeSet<EntityId>> {
    let mut ids = BTreeSet::new();
    let mut unknown = Vec::new();
    for key in raw.iter().flat_map(|r| r.split(',')).map(str::trim) {
        if key.is_empty() {
            continue;
        }
        match manifest.find(key) {
            Some(state) => {
                ids.insert(state.entity.id);
            }
            None => unknown.push(key.to_string()),
        }
    }
    if !unknown.is_empty() {
        bail!("unknown entity id or slug: {}", unknown.join(", "));
    }
    if ids.is_empty() {
        bail!("no entities selected");
    }
    Ok(ids)
}
