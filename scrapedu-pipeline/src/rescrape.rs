//! Rescrape: reset entities in the manifest and in their metadata.

use scrapedu_core::{EntityMetadata, EntityState, Manifest, Phase, RescrapeTarget};

use crate::error::PipelineError;

/// Reset `phases` (all when `None`) of the targeted entities.
///
/// The manifest is reset first; the metadata documents then drop the data
/// and download records of the reset phases. Claimed entities are skipped.
pub fn rescrape(
    manifest: &Manifest,
    target: &RescrapeTarget,
    phases: Option<&[Phase]>,
) -> Result<Vec<EntityState>, PipelineError> {
    let reset = manifest.mark_for_rescrape(target, phases)?;
    let store = manifest.store();
    for state in &reset {
        let mut meta = EntityMetadata::load(store, &state.entity)?;
        meta.reset_phases(phases);
        for (phase, record) in &state.phases {
            if phases.map_or(true, |s| s.contains(phase)) {
                meta.mirror_phase(*phase, record);
            }
        }
        meta.save(store)?;
        tracing::info!(
            id = %state.entity.id,
            slug = %state.entity.slug,
            phases = ?phases,
            "marked for rescrape"
        );
    }
    Ok(reset)
}
