use chrono::NaiveDate;
use clap::Parser;
use std::path::PathBuf;

use crate::constants::{DEFAULT_SCT_EDITION, DEFAULT_SCT_VERSION, DEFAULT_TX_ENDPOINT};
use crate::table::DuplicatePolicy;

#[derive(Debug, Parser)]
#[command(name = "sct_loinc_map")]
#[command(about = "Build a SNOMED CT Observable -> LOINC map and annotate lab spreadsheets with SNOMED CT codes")]
pub struct Args {
    /// Root data folder holding in/, out/, maps/ and logs/. Defaults to $HOME/data/loinc-sct-map.
    #[arg(short = 'r', long = "rootdir")]
    pub root_dir: Option<PathBuf>,

    /// FHIR terminology server endpoint.
    #[arg(short = 't', long = "txendpoint", default_value = DEFAULT_TX_ENDPOINT)]
    pub tx_endpoint: String,

    /// SNOMED CT edition (module) id.
    #[arg(short = 'e', long, default_value = DEFAULT_SCT_EDITION)]
    pub edition: String,

    /// SNOMED CT version date (YYYYMMDD).
    #[arg(short = 'v', long, default_value = DEFAULT_SCT_VERSION, value_parser = parse_version_date)]
    pub version: String,

    /// Rebuild the map file even if one already exists for this version.
    /// Concepts already resolved in the lookup cache are reused.
    #[arg(long, default_value_t = false)]
    pub rebuild_map: bool,

    /// Delete the map file and the lookup cache before building.
    #[arg(long, default_value_t = false)]
    pub reset_map: bool,

    /// Build (or locate) the map file only, skip spreadsheet mapping.
    #[arg(long, default_value_t = false)]
    pub build_map_only: bool,

    /// Abort when the endpoint is not a FHIR 4.0.1 terminology server.
    #[arg(long, default_value_t = false)]
    pub strict_capability: bool,

    /// Max concurrent in-flight $lookup requests. Results are still recorded in expansion order.
    #[arg(long, default_value_t = 1)]
    pub concurrency: usize,

    /// Global request start rate for $lookup calls (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pub requests_per_second: u32,

    /// Max attempts per request for transient failures (429/5xx, transport errors).
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Which SNOMED CT concept wins when several share a LOINC code.
    #[arg(long, value_enum, default_value_t = DuplicatePolicy::KeepLast)]
    pub duplicate_loinc: DuplicatePolicy,
}

impl Args {
    pub fn root_dir(&self) -> PathBuf {
        self.root_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("data")
                .join("loinc-sct-map")
        })
    }
}

fn parse_version_date(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.len() != 8 || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("expected YYYYMMDD, got '{value}'"));
    }
    NaiveDate::parse_from_str(trimmed, "%Y%m%d")
        .map_err(|err| format!("invalid release date '{value}': {err}"))?;
    Ok(trimmed.to_string())
}
