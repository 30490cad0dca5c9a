use anyhow::{Context, Result};
use futures::{StreamExt, stream};
use indicatif::{ProgressBar, ProgressStyle};
use rusqlite::{Connection as SqliteConnection, OptionalExtension, params};
use serde::Deserialize;
use std::{fs, path::Path, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    client::TerminologyServer,
    common::{min_request_interval, now_unix_seconds, truncate_for_log, wait_for_rate_slot},
    constants::{EQUIVALENT_CONCEPT_PROPERTY, LOINC_SYSTEM_URI},
    error::TerminologyError,
    model::{Concept, MappingRow, SctRelease},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Mapped(String),
    Unmapped,
}

/// Per-concept `$lookup` results for one SNOMED CT release, so an interrupted
/// build resumes where it stopped. Failed lookups are retried on the next build.
pub struct LookupCache {
    conn: SqliteConnection,
    version_uri: String,
}

impl LookupCache {
    pub fn open(path: &Path, release: &SctRelease) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating cache dir {}", parent.display()))?;
        }
        let conn = SqliteConnection::open(path)
            .with_context(|| format!("Failed opening cache DB {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS concept_lookup (
                version_uri TEXT NOT NULL,
                code TEXT NOT NULL,
                loinc_code TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                error_message TEXT,
                fetched_at_unix INTEGER NOT NULL,
                PRIMARY KEY (version_uri, code)
            );
            CREATE INDEX IF NOT EXISTS idx_concept_lookup_status
                ON concept_lookup(version_uri, status);
            ",
        )
        .context("Failed initializing concept lookup cache schema")?;
        Ok(Self {
            conn,
            version_uri: release.version_uri(),
        })
    }

    pub fn classify_for_lookup(&self, concepts: &[Concept]) -> Result<(usize, Vec<Concept>)> {
        let mut resolved = 0usize;
        let mut missing = Vec::new();

        for concept in concepts {
            match self.status(&concept.code)?.as_deref() {
                Some("mapped") | Some("unmapped") => resolved += 1,
                Some(_) | None => missing.push(concept.clone()),
            }
        }

        Ok((resolved, missing))
    }

    pub fn record_outcome(&self, code: &str, outcome: &LookupOutcome) -> Result<()> {
        match outcome {
            LookupOutcome::Mapped(loinc) => self.upsert(code, loinc, "mapped", None),
            LookupOutcome::Unmapped => self.upsert(code, "", "unmapped", None),
        }
    }

    pub fn record_error(&self, code: &str, message: &str) -> Result<()> {
        self.upsert(code, "", "error", Some(&truncate_for_log(message)))
    }

    fn status(&self, code: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT status FROM concept_lookup WHERE version_uri = ?1 AND code = ?2")
            .context("Failed preparing concept lookup cache statement")?;
        stmt.query_row(params![self.version_uri, code], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed concept lookup cache read for {code}"))
    }

    fn upsert(
        &self,
        code: &str,
        loinc_code: &str,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn
            .execute(
                "
                INSERT INTO concept_lookup (version_uri, code, loinc_code, status, error_message, fetched_at_unix)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(version_uri, code) DO UPDATE SET
                    loinc_code = excluded.loinc_code,
                    status = excluded.status,
                    error_message = excluded.error_message,
                    fetched_at_unix = excluded.fetched_at_unix
                ",
                params![
                    self.version_uri,
                    code,
                    loinc_code,
                    status,
                    error_message,
                    now_unix_seconds()
                ],
            )
            .with_context(|| format!("Failed updating concept lookup cache for {code}"))?;
        Ok(())
    }

    /// One row per concept in the given order; anything not `mapped` gets an
    /// empty `loinc_code`.
    pub fn mapping_rows(&self, concepts: &[Concept]) -> Result<Vec<MappingRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT loinc_code FROM concept_lookup
                 WHERE version_uri = ?1 AND code = ?2 AND status = 'mapped'",
            )
            .context("Failed preparing mapping export query")?;

        let mut rows = Vec::with_capacity(concepts.len());
        for concept in concepts {
            let loinc: Option<String> = stmt
                .query_row(params![self.version_uri, concept.code], |row| row.get(0))
                .optional()
                .with_context(|| format!("Failed reading cached mapping for {}", concept.code))?;
            rows.push(MappingRow::from_concept(concept, loinc));
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone)]
pub struct LookupSettings {
    pub concurrency: usize,
    pub requests_per_second: u32,
}

impl Default for LookupSettings {
    fn default() -> Self {
        Self {
            concurrency: 1,
            requests_per_second: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LookupTally {
    pub mapped: usize,
    pub unmapped: usize,
    pub failed: usize,
}

#[derive(Debug, Deserialize)]
struct Parameters {
    #[serde(default)]
    parameter: Vec<Parameter>,
}

#[derive(Debug, Deserialize)]
struct Parameter {
    name: Option<String>,
    #[serde(default)]
    part: Vec<Parameter>,
    #[serde(rename = "valueCode")]
    value_code: Option<String>,
    #[serde(rename = "valueCoding")]
    value_coding: Option<Coding>,
}

#[derive(Debug, Deserialize)]
struct Coding {
    system: Option<String>,
    code: Option<String>,
}

/// Resolves the LOINC equivalent of every concept, using the cache for
/// concepts already resolved for this release. Always returns exactly one
/// row per concept, in input order.
pub async fn resolve_equivalents<S: TerminologyServer>(
    server: &S,
    cache: &LookupCache,
    release: &SctRelease,
    concepts: &[Concept],
    settings: &LookupSettings,
) -> Result<Vec<MappingRow>> {
    let (resolved_count, missing) = cache.classify_for_lookup(concepts)?;
    info!(
        "Lookup cache status: {} resolved in cache, {} unresolved.",
        resolved_count,
        missing.len()
    );

    if !missing.is_empty() {
        let tally = resolve_missing(server, cache, release, &missing, settings).await?;
        info!(
            mapped = tally.mapped,
            unmapped = tally.unmapped,
            failed = tally.failed,
            "Property lookups finished"
        );
    }

    cache.mapping_rows(concepts)
}

async fn resolve_missing<S: TerminologyServer>(
    server: &S,
    cache: &LookupCache,
    release: &SctRelease,
    missing: &[Concept],
    settings: &LookupSettings,
) -> Result<LookupTally> {
    let total = missing.len();
    let version_uri = release.version_uri();
    let version_uri = version_uri.as_str();
    let min_interval: Duration = min_request_interval(settings.requests_per_second);
    let next_slot = Arc::new(Mutex::new(Instant::now()));

    let progress = ProgressBar::new(total as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [$lookup {elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    ) {
        progress.set_style(style.progress_chars("=> "));
    }
    progress.set_message("starting lookups");

    // `buffered` yields in submission order, so cache writes follow expansion order.
    let mut results = stream::iter(missing.iter().enumerate())
        .map(|(idx, concept)| {
            let next_slot = Arc::clone(&next_slot);
            async move {
                wait_for_rate_slot(&next_slot, min_interval).await;
                debug!(
                    "Looking up properties for {} - {} ({}/{})",
                    concept.code,
                    concept.display,
                    idx + 1,
                    total
                );
                let result = fetch_equivalent(server, version_uri, &concept.code).await;
                (concept, result)
            }
        })
        .buffered(settings.concurrency.max(1));

    let mut tally = LookupTally::default();
    while let Some((concept, result)) = results.next().await {
        progress.inc(1);
        match result {
            Ok(outcome) => {
                cache.record_outcome(&concept.code, &outcome)?;
                match outcome {
                    LookupOutcome::Mapped(_) => tally.mapped += 1,
                    LookupOutcome::Unmapped => tally.unmapped += 1,
                }
            }
            Err(err) => {
                warn!(
                    code = %concept.code,
                    display = %concept.display,
                    error = %err,
                    "Failed to lookup properties; recording empty mapping"
                );
                cache.record_error(&concept.code, &err.to_string())?;
                tally.failed += 1;
            }
        }
        progress.set_message(format!(
            "mapped={} unmapped={} failed={}",
            tally.mapped, tally.unmapped, tally.failed
        ));
    }

    progress.finish_with_message(format!(
        "done: mapped={} unmapped={} failed={}",
        tally.mapped, tally.unmapped, tally.failed
    ));
    Ok(tally)
}

async fn fetch_equivalent<S: TerminologyServer>(
    server: &S,
    version_uri: &str,
    code: &str,
) -> Result<LookupOutcome, TerminologyError> {
    let body = server.lookup(version_uri, code).await?;
    let params: Parameters =
        serde_json::from_value(body).map_err(|err| TerminologyError::Decode {
            url: format!("{}/CodeSystem/$lookup?code={code}", server.endpoint()),
            message: err.to_string(),
        })?;
    Ok(match extract_loinc_equivalent(&params) {
        Some(loinc) => LookupOutcome::Mapped(loinc),
        None => LookupOutcome::Unmapped,
    })
}

/// First `equivalentConcept` property whose coding is in the LOINC namespace.
fn extract_loinc_equivalent(params: &Parameters) -> Option<String> {
    params
        .parameter
        .iter()
        .filter(|p| p.name.as_deref() == Some("property"))
        .find_map(|property| {
            let is_equivalence = property.part.iter().any(|part| {
                part.name.as_deref() == Some("code")
                    && part.value_code.as_deref() == Some(EQUIVALENT_CONCEPT_PROPERTY)
            });
            if !is_equivalence {
                return None;
            }
            let coding = property
                .part
                .iter()
                .filter(|part| part.name.as_deref() == Some("value"))
                .find_map(|part| part.value_coding.as_ref())?;
            if coding.system.as_deref() != Some(LOINC_SYSTEM_URI) {
                return None;
            }
            coding
                .code
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToOwned::to_owned)
        })
}
