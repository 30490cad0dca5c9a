use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::{
    client::TerminologyServer,
    common::delete_if_exists,
    expand::expand_observables,
    lookup::{LookupCache, LookupSettings, resolve_equivalents},
    model::SctRelease,
    table::{log_table_stats, write_lookup_table},
};

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Regenerate the map file even when one exists for the version.
    pub rebuild: bool,
    pub lookup: LookupSettings,
}

/// Map file for a release, and whether this run produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableBuild {
    Reused(PathBuf),
    Built(PathBuf),
}

impl TableBuild {
    pub fn path(&self) -> &Path {
        match self {
            Self::Reused(path) | Self::Built(path) => path,
        }
    }
}

/// Returns the map file for `release`, building it from the terminology
/// server when it does not exist yet. An existing file is returned untouched
/// without contacting the server.
#[tracing::instrument(name = "build_table", skip_all, fields(version = %release.version))]
pub async fn build_lookup_table<S: TerminologyServer>(
    server: &S,
    release: &SctRelease,
    maps_dir: &Path,
    cache_path: &Path,
    options: &BuildOptions,
) -> Result<TableBuild> {
    let output = maps_dir.join(release.map_file_name());
    if output.is_file() && !options.rebuild {
        info!(path = %output.display(), "Map file already exists");
        info!("Skipping map generation. Use --rebuild-map or --reset-map to regenerate.");
        return Ok(TableBuild::Reused(output));
    }

    info!("Step 1: Fetching Observable entities from SNOMED CT using ECL");
    let concepts = expand_observables(server, release)
        .await
        .context("Failed expanding Observable entity concepts")?;

    info!("Step 2: Looking up LOINC equivalents");
    let cache = LookupCache::open(cache_path, release)?;
    let rows = resolve_equivalents(server, &cache, release, &concepts, &options.lookup).await?;

    info!("Step 3: Writing results to TSV file");
    write_lookup_table(&output, &rows)?;
    log_table_stats(&output, &rows);
    Ok(TableBuild::Built(output))
}

/// Deletes the release's map file and the shared lookup cache, including
/// SQLite's WAL side files.
pub fn reset_map_state(map_path: &Path, cache_path: &Path) -> Result<()> {
    delete_if_exists(map_path)?;
    delete_if_exists(cache_path)?;
    for suffix in ["-wal", "-shm"] {
        let mut side = cache_path.as_os_str().to_owned();
        side.push(suffix);
        delete_if_exists(Path::new(&side))?;
    }
    info!(
        map = %map_path.display(),
        cache = %cache_path.display(),
        "Reset map file and lookup cache"
    );
    Ok(())
}
