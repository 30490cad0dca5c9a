mod args;
mod build;
mod capability;
mod client;
mod common;
mod constants;
mod error;
mod expand;
mod logging;
mod lookup;
mod mapper;
mod model;
mod report;
mod sheet;
mod table;

use anyhow::{Context, Result};
use clap::Parser;
use reqwest::Client;
use std::process::ExitCode;
use tracing::{error, info, info_span, warn};

use args::Args;
use build::{BuildOptions, build_lookup_table, reset_map_state};
use capability::probe_capability;
use client::{FhirClient, TerminologyServer};
use common::{DataDirs, run_timestamp};
use constants::LOOKUP_CACHE_FILE;
use logging::init_logging;
use lookup::LookupSettings;
use mapper::SpreadsheetMapper;
use model::SctRelease;
use report::RunReport;
use sheet::list_spreadsheets;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let dirs = DataDirs::new(&args.root_dir());
    dirs.ensure()?;
    let _log_guard = init_logging(&dirs.logs, &run_timestamp())?;

    let release = SctRelease::new(&args.edition, &args.version);
    info!(
        root = %dirs.root.display(),
        endpoint = %args.tx_endpoint,
        version_uri = %release.version_uri(),
        "Starting SNOMED CT Observable to LOINC mapping"
    );

    let client = Client::builder()
        .user_agent(concat!("sct-loinc-map/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed creating HTTP client")?;
    let server = FhirClient::new(client, &args.tx_endpoint, args.max_retries);

    let capability = probe_capability(&server).await;
    if !capability.is_ready() {
        if !args.strict_capability {
            warn!("Continuing anyway; pass --strict-capability to abort instead");
        } else if let Some(err) = capability.into_error(server.endpoint()) {
            error!("{err}. Aborting (--strict-capability).");
            return Ok(ExitCode::FAILURE);
        }
    }

    let map_path = dirs.maps.join(release.map_file_name());
    let cache_path = dirs.maps.join(LOOKUP_CACHE_FILE);
    if args.reset_map {
        reset_map_state(&map_path, &cache_path)?;
    }

    let options = BuildOptions {
        rebuild: args.rebuild_map || args.reset_map,
        lookup: LookupSettings {
            concurrency: args.concurrency.max(1),
            requests_per_second: args.requests_per_second,
        },
    };
    let table = match build_lookup_table(&server, &release, &dirs.maps, &cache_path, &options).await
    {
        Ok(table) => table,
        Err(err) => {
            error!("Failed to create or locate the SNOMED-LOINC map file: {err:#}");
            return Ok(ExitCode::FAILURE);
        }
    };
    let table_path = table.path().to_path_buf();
    let mut report = RunReport::default();
    report.set_table(table);

    if args.build_map_only {
        info!("--build-map-only set; skipping spreadsheet mapping");
        report.log_summary();
        return Ok(ExitCode::SUCCESS);
    }

    let inputs = list_spreadsheets(&dirs.inbound)?;
    if inputs.is_empty() {
        info!(dir = %dirs.inbound.display(), "No spreadsheets to map");
    }

    let mapper = SpreadsheetMapper::new(args.duplicate_loinc);
    for input in &inputs {
        let file = input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let summary = info_span!("map_file", %file)
            .in_scope(|| mapper.map_file(input, &table_path, &dirs.outbound));
        report.record(input, summary);
    }

    report.log_summary();
    if report.failed() > 0 {
        error!("{} of {} spreadsheets failed", report.failed(), inputs.len());
        return Ok(ExitCode::FAILURE);
    }
    info!("Processing complete");
    Ok(ExitCode::SUCCESS)
}
