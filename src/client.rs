use reqwest::{
    Client,
    header::{ACCEPT, RETRY_AFTER},
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    common::{is_retryable_status, parse_retry_after, truncate_for_log},
    constants::{FHIR_JSON, SNOMED_SYSTEM_URI},
    error::TerminologyError,
};

/// The three read-only FHIR interactions the pipeline consumes.
pub trait TerminologyServer {
    fn endpoint(&self) -> &str;

    /// `GET [base]/metadata`
    async fn metadata(&self) -> Result<Value, TerminologyError>;

    /// `GET [base]/ValueSet/$expand?url=...`
    async fn expand(&self, valueset_url: &str) -> Result<Value, TerminologyError>;

    /// `GET [base]/CodeSystem/$lookup` for a SNOMED CT code, all properties.
    async fn lookup(&self, version_uri: &str, code: &str) -> Result<Value, TerminologyError>;
}

pub struct FhirClient {
    client: Client,
    endpoint: String,
    max_retries: u32,
}

impl FhirClient {
    pub fn new(client: Client, endpoint: &str, max_retries: u32) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            max_retries: max_retries.max(1),
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, TerminologyError> {
        let url = format!("{}/{}", self.endpoint, path);
        let attempts = self.max_retries;
        let mut backoff = Duration::from_secs(1);

        for attempt in 1..=attempts {
            let mut request = self.client.get(&url).header(ACCEPT, FHIR_JSON);
            if !query.is_empty() {
                request = request.query(query);
            }
            debug!(%url, attempt, "GET");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await.map_err(|err| TerminologyError::Decode {
                            url: url.clone(),
                            message: err.to_string(),
                        })?;
                        return serde_json::from_str(&text).map_err(|err| {
                            TerminologyError::Decode {
                                url: url.clone(),
                                message: err.to_string(),
                            }
                        });
                    }

                    let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
                    let body = resp.text().await.unwrap_or_default();
                    if is_retryable_status(status) && attempt < attempts {
                        let wait = retry_after.unwrap_or(backoff);
                        warn!(%url, %status, attempt, ?wait, "retryable status, backing off");
                        tokio::time::sleep(wait).await;
                        backoff = (backoff + backoff).min(Duration::from_secs(60));
                        continue;
                    }

                    return Err(TerminologyError::Status {
                        url,
                        status: status.as_u16(),
                        body: truncate_for_log(&body),
                    });
                }
                Err(err) => {
                    if attempt == attempts {
                        return Err(TerminologyError::Transport {
                            url,
                            message: err.to_string(),
                        });
                    }
                    warn!(%url, attempt, error = %err, "request failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff + backoff).min(Duration::from_secs(60));
                }
            }
        }

        Err(TerminologyError::Transport {
            url,
            message: "no request attempts were made".to_string(),
        })
    }
}

impl TerminologyServer for FhirClient {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn metadata(&self) -> Result<Value, TerminologyError> {
        self.get_json("metadata", &[]).await
    }

    async fn expand(&self, valueset_url: &str) -> Result<Value, TerminologyError> {
        self.get_json("ValueSet/$expand", &[("url", valueset_url)])
            .await
    }

    async fn lookup(&self, version_uri: &str, code: &str) -> Result<Value, TerminologyError> {
        self.get_json(
            "CodeSystem/$lookup",
            &[
                ("version", version_uri),
                ("code", code),
                ("property", "*"),
                ("system", SNOMED_SYSTEM_URI),
            ],
        )
        .await
    }
}

#[cfg(test)]
pub mod testing {
    use serde_json::{Value, json};
    use std::{collections::HashMap, sync::Mutex};

    use super::TerminologyServer;
    use crate::{constants::LOINC_SYSTEM_URI, error::TerminologyError};

    /// In-memory terminology server recording every call it receives.
    pub struct FakeServer {
        pub metadata: Result<Value, TerminologyError>,
        pub expansion: Result<Value, TerminologyError>,
        pub lookups: HashMap<String, Result<Value, TerminologyError>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeServer {
        pub fn new() -> Self {
            Self {
                metadata: Ok(json!({
                    "resourceType": "CapabilityStatement",
                    "instantiates": ["http://hl7.org/fhir/CapabilityStatement/terminology-server"],
                    "fhirVersion": "4.0.1"
                })),
                expansion: Ok(expansion(&[])),
                lookups: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_concepts(mut self, concepts: &[(&str, &str)]) -> Self {
            self.expansion = Ok(expansion(concepts));
            self
        }

        pub fn with_loinc(mut self, code: &str, loinc: &str) -> Self {
            self.lookups
                .insert(code.to_string(), Ok(lookup_with_equivalent(LOINC_SYSTEM_URI, loinc)));
            self
        }

        pub fn with_lookup(mut self, code: &str, result: Result<Value, TerminologyError>) -> Self {
            self.lookups.insert(code.to_string(), result);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn lookup_calls(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|c| c.strip_prefix("lookup:").map(str::to_string))
                .collect()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl TerminologyServer for FakeServer {
        fn endpoint(&self) -> &str {
            "http://fake.test/fhir"
        }

        async fn metadata(&self) -> Result<Value, TerminologyError> {
            self.record("metadata".to_string());
            self.metadata.clone()
        }

        async fn expand(&self, valueset_url: &str) -> Result<Value, TerminologyError> {
            self.record(format!("expand:{valueset_url}"));
            self.expansion.clone()
        }

        async fn lookup(&self, _version_uri: &str, code: &str) -> Result<Value, TerminologyError> {
            self.record(format!("lookup:{code}"));
            self.lookups
                .get(code)
                .cloned()
                .unwrap_or_else(|| Ok(json!({"resourceType": "Parameters", "parameter": []})))
        }
    }

    pub fn expansion(concepts: &[(&str, &str)]) -> Value {
        let contains: Vec<Value> = concepts
            .iter()
            .map(|(code, display)| {
                json!({"system": "http://snomed.info/sct", "code": code, "display": display})
            })
            .collect();
        json!({
            "resourceType": "ValueSet",
            "expansion": {"total": contains.len(), "contains": contains}
        })
    }

    pub fn lookup_with_equivalent(system: &str, code: &str) -> Value {
        json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "display", "valueString": "Observable"},
                {
                    "name": "property",
                    "part": [
                        {"name": "code", "valueCode": "equivalentConcept"},
                        {"name": "value", "valueCoding": {"system": system, "code": code}}
                    ]
                }
            ]
        })
    }

    pub fn transport_error(code: &str) -> TerminologyError {
        TerminologyError::Transport {
            url: format!("http://fake.test/fhir/CodeSystem/$lookup?code={code}"),
            message: "connection refused".to_string(),
        }
    }
}
