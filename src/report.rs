use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::{build::TableBuild, mapper::MapSummary};

#[derive(Debug)]
pub struct FileOutcome {
    pub input: PathBuf,
    pub summary: Option<MapSummary>,
}

/// Results of one run, collected as the orchestrator goes.
#[derive(Debug, Default)]
pub struct RunReport {
    table: Option<TableBuild>,
    files: Vec<FileOutcome>,
}

impl RunReport {
    pub fn set_table(&mut self, table: TableBuild) {
        self.table = Some(table);
    }

    pub fn record(&mut self, input: &Path, summary: Option<MapSummary>) {
        self.files.push(FileOutcome {
            input: input.to_path_buf(),
            summary,
        });
    }

    pub fn files(&self) -> &[FileOutcome] {
        &self.files
    }

    pub fn succeeded(&self) -> usize {
        self.files.iter().filter(|f| f.summary.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.files.len() - self.succeeded()
    }

    /// Mapped rows across every successful file.
    pub fn rows_mapped(&self) -> usize {
        self.files
            .iter()
            .filter_map(|f| f.summary.as_ref())
            .map(|s| s.mapped)
            .sum()
    }

    pub fn rows_total(&self) -> usize {
        self.files
            .iter()
            .filter_map(|f| f.summary.as_ref())
            .map(|s| s.total)
            .sum()
    }

    pub fn log_summary(&self) {
        match &self.table {
            Some(TableBuild::Built(path)) => info!(path = %path.display(), "Map file built"),
            Some(TableBuild::Reused(path)) => info!(path = %path.display(), "Map file reused"),
            None => {}
        }
        for file in self.files() {
            match &file.summary {
                Some(s) => info!(
                    input = %file.input.display(),
                    output = %s.output.display(),
                    mapped = s.mapped,
                    total = s.total,
                    "Mapped"
                ),
                None => error!(input = %file.input.display(), "Failed"),
            }
        }
        info!(
            files = self.files.len(),
            succeeded = self.succeeded(),
            failed = self.failed(),
            rows_mapped = self.rows_mapped(),
            rows_total = self.rows_total(),
            "Run summary"
        );
    }
}
