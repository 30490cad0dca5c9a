use std::path::PathBuf;
use thiserror::Error;

/// Failures talking to the FHIR terminology server.
#[derive(Debug, Clone, Error)]
pub enum TerminologyError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} returned HTTP {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("unreadable response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error(
        "{endpoint} is not a FHIR {expected_version} terminology server \
         (instantiates={instantiates:?}, fhirVersion={fhir_version:?})"
    )]
    ProtocolMismatch {
        endpoint: String,
        expected_version: &'static str,
        instantiates: Option<String>,
        fhir_version: Option<String>,
    },

    #[error("ValueSet $expand failed: {0}")]
    Expansion(#[source] Box<TerminologyError>),
}

impl TerminologyError {
    /// HTTP status carried by this error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Expansion(inner) => inner.status(),
            _ => None,
        }
    }
}

/// Failures mapping a single lab spreadsheet.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("unsupported spreadsheet format '{extension}' for {path}")]
    UnsupportedFormat { path: PathBuf, extension: String },

    #[error("no '{column}' column in header rows 1-{tried} of {path}")]
    MissingColumn {
        path: PathBuf,
        column: &'static str,
        tried: usize,
        last_columns: Vec<String>,
    },

    #[error("map file {path} is missing required columns: {}", missing.join(", "))]
    MalformedTable {
        path: PathBuf,
        missing: Vec<&'static str>,
        available: Vec<String>,
    },

    #[error("failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("failed to write {path}: {message}")]
    Write { path: PathBuf, message: String },
}
