use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::{collections::HashMap, fs, path::Path};
use tracing::{info, warn};

use crate::{error::MapError, model::MappingRow};

const REQUIRED_COLUMNS: [&str; 3] = ["loinc_code", "code", "display"];

/// Which SNOMED CT concept a LOINC code resolves to when several rows share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DuplicatePolicy {
    #[default]
    KeepLast,
    KeepFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnomedTarget {
    pub snomed_code: String,
    pub snomed_display: String,
}

/// LOINC code -> SNOMED CT concept, derived from the map file.
#[derive(Debug, Default)]
pub struct ReverseIndex {
    entries: HashMap<String, SnomedTarget>,
    duplicates: usize,
}

impl ReverseIndex {
    pub fn build(rows: &[MappingRow], policy: DuplicatePolicy) -> Self {
        let mut index = Self::default();
        for row in rows {
            let loinc = row.loinc_code.trim();
            if loinc.is_empty() {
                continue;
            }
            let target = SnomedTarget {
                snomed_code: row.code.clone(),
                snomed_display: row.display.clone(),
            };
            if index.entries.contains_key(loinc) {
                index.duplicates += 1;
                if policy == DuplicatePolicy::KeepFirst {
                    continue;
                }
            }
            index.entries.insert(loinc.to_string(), target);
        }
        index
    }

    pub fn get(&self, loinc: &str) -> Option<&SnomedTarget> {
        self.entries.get(loinc)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows whose LOINC code was already taken by another row.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }
}

/// Writes the map as TSV via a temp file and rename, so a partial file never
/// looks like a finished map.
pub fn write_lookup_table(path: &Path, rows: &[MappingRow]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed creating map directory {}", parent.display()))?;
    }

    let file_name = path
        .file_name()
        .and_then(|x| x.to_str())
        .unwrap_or("snomed-loinc-map.tsv");
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(&tmp_path)
        .with_context(|| format!("Failed creating temp map file {}", tmp_path.display()))?;
    writer
        .write_record(["code", "display", "loinc_code"])
        .context("Failed writing map header")?;
    for row in rows {
        writer
            .write_record([&row.code, &row.display, &row.loinc_code])
            .with_context(|| format!("Failed writing map row for {}", row.code))?;
    }
    writer.flush().context("Failed flushing map writer")?;

    fs::rename(&tmp_path, path).with_context(|| {
        format!(
            "Failed moving temp map {} to {}",
            tmp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Reads a map file, requiring the `loinc_code`, `code` and `display` columns
/// in any order.
pub fn read_lookup_table(path: &Path) -> Result<Vec<MappingRow>, MapError> {
    let read_err = |message: String| MapError::Read {
        path: path.to_path_buf(),
        message,
    };

    let mut reader = ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)
        .map_err(|err| read_err(err.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|err| read_err(err.to_string()))?
        .clone();

    let position = |name: &str| headers.iter().position(|h| h.trim() == name);
    let missing: Vec<&'static str> = REQUIRED_COLUMNS
        .into_iter()
        .filter(|name| position(*name).is_none())
        .collect();
    let (Some(loinc_idx), Some(code_idx), Some(display_idx)) =
        (position("loinc_code"), position("code"), position("display"))
    else {
        return Err(MapError::MalformedTable {
            path: path.to_path_buf(),
            missing,
            available: headers.iter().map(str::to_string).collect(),
        });
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| read_err(err.to_string()))?;
        let field = |idx: usize| record.get(idx).unwrap_or("").to_string();
        rows.push(MappingRow {
            code: field(code_idx),
            display: field(display_idx),
            loinc_code: field(loinc_idx),
        });
    }
    Ok(rows)
}

pub fn log_table_stats(path: &Path, rows: &[MappingRow]) {
    let mapped = rows.iter().filter(|r| r.is_mapped()).count();
    info!(
        path = %path.display(),
        total = rows.len(),
        with_loinc = mapped,
        "Map file contains {} SNOMED CT concepts",
        rows.len()
    );
}

pub fn log_index_stats(index: &ReverseIndex, policy: DuplicatePolicy) {
    info!(
        "Created lookup table with {} LOINC to SNOMED mappings",
        index.len()
    );
    if index.duplicates() > 0 {
        warn!(
            duplicates = index.duplicates(),
            ?policy,
            "Several SNOMED CT concepts share a LOINC code"
        );
    }
}
