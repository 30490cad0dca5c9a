use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Console logging on stderr plus a per-run log file in `logs_dir`.
/// `RUST_LOG` overrides the default `info` level. Keep the returned guard
/// alive until exit or buffered file lines are lost.
pub fn init_logging(logs_dir: &Path, run_ts: &str) -> Result<WorkerGuard> {
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(format!("loinc-sct-map-{run_ts}"))
        .filename_suffix("log")
        .build(logs_dir)
        .with_context(|| format!("Failed creating log file in {}", logs_dir.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed initializing logging")?;
    Ok(guard)
}
