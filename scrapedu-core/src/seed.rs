//! Reference-data seed loader.
//!
//! Reads a CSV with (at least) the headers `id,name,url` and turns each row
//! into an [`Entity`]. Extra columns are ignored. Within one file a slug that
//! is already taken gets `-<id>` appended.

use std::collections::HashSet;
use std::path::Path;

use csv::{ReaderBuilder, Trim};
use serde::Deserialize;

use crate::error::SeedError;
use crate::slug::disambiguate;
use crate::types::{Entity, Slug};
use crate::url_utils::normalize_url;

#[derive(Debug, Deserialize)]
struct SeedRow {
    id: String,
    name: String,
    url: String,
}

pub fn load_seed(path: &Path) -> Result<Vec<Entity>, SeedError> {
    let file = std::fs::File::open(path).map_err(|source| SeedError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_seed(file).map_err(|err| match err {
        SeedError::Csv { source, .. } => SeedError::Csv {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    })
}

/// Parse seed rows from any reader. Row numbers in errors are 1-based data
/// rows (the header is not counted).
pub fn read_seed<R: std::io::Read>(reader: R) -> Result<Vec<Entity>, SeedError> {
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
    let mut entities = Vec::new();
    let mut seen_ids = HashSet::new();
    let mut slugs: HashSet<Slug> = HashSet::new();

    for (idx, row) in rdr.deserialize::<SeedRow>().enumerate() {
        let row_no = idx + 1;
        let row = row.map_err(|source| SeedError::Csv {
            path: Default::default(),
            source,
        })?;
        if row.id.is_empty() {
            return Err(SeedError::Row {
                row: row_no,
                reason: "empty id".into(),
            });
        }
        if row.name.is_empty() {
            return Err(SeedError::Row {
                row: row_no,
                reason: format!("entity {} has an empty name", row.id),
            });
        }
        let Some(url) = normalize_url(&row.url) else {
            return Err(SeedError::Row {
                row: row_no,
                reason: format!("entity {} has an invalid url '{}'", row.id, row.url),
            });
        };
        if !seen_ids.insert(row.id.clone()) {
            tracing::warn!(id = %row.id, row = row_no, "duplicate id in seed file, keeping first");
            continue;
        }

        let mut entity = Entity::new(row.id, row.name, url);
        entity.slug = Slug(disambiguate(&entity.slug.0, &entity.id.0, |s| {
            slugs.contains(&Slug::from(s))
        }));
        slugs.insert(entity.slug.clone());
        entities.push(entity);
    }

    tracing::debug!(count = entities.len(), "seed loaded");
    Ok(entities)
}
