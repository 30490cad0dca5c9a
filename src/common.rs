use anyhow::{Context, Result};
use chrono::Local;
use reqwest::StatusCode;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};

use crate::constants::RUN_TIMESTAMP_FORMAT;

/// Working directories under the root data folder.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub root: PathBuf,
    pub inbound: PathBuf,
    pub outbound: PathBuf,
    pub maps: PathBuf,
    pub logs: PathBuf,
}

impl DataDirs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            inbound: root.join("in"),
            outbound: root.join("out"),
            maps: root.join("maps"),
            logs: root.join("logs"),
        }
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.inbound,
            &self.outbound,
            &self.maps,
            &self.logs,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed creating directory {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn delete_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("Failed deleting {}", path.display()))?;
    }
    Ok(())
}

pub fn run_timestamp() -> String {
    Local::now().format(RUN_TIMESTAMP_FORMAT).to_string()
}

pub fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    let secs = value.parse::<u64>().ok()?;
    Some(Duration::from_secs(secs))
}

pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_len = 300usize;
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let mut cut = max_len;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &trimmed[..cut])
}

pub async fn wait_for_rate_slot(next_slot: &Arc<Mutex<Instant>>, min_interval: Duration) {
    if min_interval.is_zero() {
        return;
    }
    let mut guard = next_slot.lock().await;
    let now = Instant::now();
    if *guard > now {
        sleep(*guard - now).await;
    }
    *guard = Instant::now() + min_interval;
}

pub fn min_request_interval(requests_per_second: u32) -> Duration {
    if requests_per_second == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(1.0 / requests_per_second as f64)
    }
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_creates_all_working_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::new(&tmp.path().join("loinc-sct-map"));
        dirs.ensure().unwrap();
        assert!(dirs.inbound.is_dir());
        assert!(dirs.outbound.is_dir());
        assert!(dirs.maps.is_dir());
        assert!(dirs.logs.is_dir());
        // Second call is a no-op.
        dirs.ensure().unwrap();
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(400);
        let out = truncate_for_log(&long);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 303);
        assert_eq!(truncate_for_log("  short  "), "short");
    }

    #[test]
    fn rate_interval() {
        assert_eq!(min_request_interval(0), Duration::ZERO);
        assert_eq!(min_request_interval(4), Duration::from_millis(250));
    }

    #[test]
    fn timestamp_shape() {
        let ts = run_timestamp();
        assert_eq!(ts.len(), 15);
        assert_eq!(&ts[8..9], "-");
    }
}
