use serde_json::Value;
use tracing::{info, warn};

use crate::{
    client::TerminologyServer,
    constants::{EXPECTED_FHIR_VERSION, TERMINOLOGY_SERVER_PROFILE},
    error::TerminologyError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityStatus {
    /// FHIR 4.0.1 terminology server.
    Ready,
    /// Reachable, but the profile or FHIR version differs (upgraded server?).
    Unexpected {
        instantiates: Option<String>,
        fhir_version: Option<String>,
    },
    /// Non-2xx or transport failure.
    Unreachable { status: Option<u16>, reason: String },
}

impl CapabilityStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Converts a non-ready status into the error used by strict mode.
    pub fn into_error(self, endpoint: &str) -> Option<TerminologyError> {
        match self {
            Self::Ready => None,
            Self::Unexpected {
                instantiates,
                fhir_version,
            } => Some(TerminologyError::ProtocolMismatch {
                endpoint: endpoint.to_string(),
                expected_version: EXPECTED_FHIR_VERSION,
                instantiates,
                fhir_version,
            }),
            Self::Unreachable { status, reason } => Some(match status {
                Some(status) => TerminologyError::Status {
                    url: format!("{endpoint}/metadata"),
                    status,
                    body: reason,
                },
                None => TerminologyError::Transport {
                    url: format!("{endpoint}/metadata"),
                    message: reason,
                },
            }),
        }
    }
}

/// Fetches the CapabilityStatement and checks it declares the terminology
/// server profile at FHIR 4.0.1.
pub async fn probe_capability<S: TerminologyServer>(server: &S) -> CapabilityStatus {
    let status = match server.metadata().await {
        Ok(doc) => assess_capability(&doc),
        Err(err) => CapabilityStatus::Unreachable {
            status: err.status(),
            reason: err.to_string(),
        },
    };

    match &status {
        CapabilityStatus::Ready => info!(
            endpoint = server.endpoint(),
            "Terminology server is ready (FHIR {EXPECTED_FHIR_VERSION})"
        ),
        CapabilityStatus::Unexpected {
            instantiates,
            fhir_version,
        } => warn!(
            endpoint = server.endpoint(),
            ?instantiates,
            ?fhir_version,
            "Endpoint does not look like a FHIR {EXPECTED_FHIR_VERSION} terminology server"
        ),
        CapabilityStatus::Unreachable { status, reason } => warn!(
            endpoint = server.endpoint(),
            ?status,
            %reason,
            "Terminology server capability check failed"
        ),
    }
    status
}

pub fn assess_capability(doc: &Value) -> CapabilityStatus {
    let instantiates = first_string(doc.get("instantiates"));
    let fhir_version = first_string(doc.get("fhirVersion"));

    let is_terminology_server = instantiates.as_deref() == Some(TERMINOLOGY_SERVER_PROFILE);
    let is_r4 = fhir_version.as_deref() == Some(EXPECTED_FHIR_VERSION);
    if is_terminology_server && is_r4 {
        CapabilityStatus::Ready
    } else {
        CapabilityStatus::Unexpected {
            instantiates,
            fhir_version,
        }
    }
}

// Accepts both `"x"` and `["x", ...]`.
fn first_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first()?.as_str().map(str::to_string),
        _ => None,
    }
}
