use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    client::TerminologyServer, constants::OBSERVABLE_ENTITY_ECL, error::TerminologyError,
    model::Concept, model::SctRelease,
};

#[derive(Debug, Deserialize)]
struct ValueSetResponse {
    expansion: Option<Expansion>,
}

#[derive(Debug, Deserialize)]
struct Expansion {
    total: Option<u64>,
    #[serde(default)]
    contains: Vec<ExpansionContains>,
}

#[derive(Debug, Deserialize)]
struct ExpansionContains {
    code: Option<String>,
    display: Option<String>,
}

/// Implicit value set URL for an ECL expression against one SNOMED CT release.
/// The ECL is percent-encoded here; the whole URL is encoded again as a query
/// parameter by the HTTP client.
pub fn ecl_valueset_url(release: &SctRelease, ecl: &str) -> String {
    format!(
        "{}?fhir_vs=ecl/{}",
        release.version_uri(),
        urlencoding::encode(ecl)
    )
}

pub async fn expand_observables<S: TerminologyServer>(
    server: &S,
    release: &SctRelease,
) -> Result<Vec<Concept>, TerminologyError> {
    expand_ecl(server, release, OBSERVABLE_ENTITY_ECL).await
}

pub async fn expand_ecl<S: TerminologyServer>(
    server: &S,
    release: &SctRelease,
    ecl: &str,
) -> Result<Vec<Concept>, TerminologyError> {
    info!(%ecl, version_uri = %release.version_uri(), "Expanding ValueSet");
    let valueset_url = ecl_valueset_url(release, ecl);
    let body = server
        .expand(&valueset_url)
        .await
        .map_err(|err| TerminologyError::Expansion(Box::new(err)))?;

    let url = format!("{}/ValueSet/$expand", server.endpoint());
    let concepts = parse_expansion(&url, body)?;
    info!("Found {} Observable entity concepts", concepts.len());
    Ok(concepts)
}

fn parse_expansion(url: &str, body: serde_json::Value) -> Result<Vec<Concept>, TerminologyError> {
    let response: ValueSetResponse = serde_json::from_value(body).map_err(|err| {
        TerminologyError::Expansion(Box::new(TerminologyError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        }))
    })?;

    let Some(expansion) = response.expansion else {
        warn!("ValueSet response has no expansion element");
        return Ok(Vec::new());
    };

    let returned = expansion.contains.len();
    if let Some(total) = expansion.total {
        if total > returned as u64 {
            warn!(
                total,
                returned, "Expansion is truncated by the server; only returned concepts are mapped"
            );
        }
    }

    let mut concepts = Vec::with_capacity(returned);
    for entry in expansion.contains {
        match entry.code.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()) {
            Some(code) => concepts.push(Concept::new(code, entry.display.unwrap_or_default())),
            None => warn!(display = ?entry.display, "Skipping expansion entry without a code"),
        }
    }
    Ok(concepts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::FakeServer;
    use serde_json::json;

    fn release() -> SctRelease {
        SctRelease::new("11010000107", "20250921")
    }

    #[test]
    fn valueset_url_encodes_ecl() {
        let url = ecl_valueset_url(&release(), "<< 177301010000109");
        assert_eq!(
            url,
            "http://snomed.info/sct/11010000107/version/20250921?fhir_vs=ecl/%3C%3C%20177301010000109"
        );
    }

    #[test]
    fn observable_ecl_has_no_raw_reserved_chars_after_encoding() {
        let url = ecl_valueset_url(&release(), OBSERVABLE_ENTITY_ECL);
        let (_, encoded) = url.split_once("ecl/").unwrap();
        assert!(!encoded.contains(' '));
        assert!(!encoded.contains('<'));
        assert!(encoded.starts_with("%28%20%3C%20363787002"));
    }

    #[tokio::test]
    async fn keeps_server_order() {
        let server = FakeServer::new().with_concepts(&[("B", "Db"), ("A", "Da")]);
        let concepts = expand_observables(&server, &release()).await.unwrap();
        assert_eq!(concepts, vec![Concept::new("B", "Db"), Concept::new("A", "Da")]);
        assert_eq!(server.calls().len(), 1);
        assert!(server.calls()[0].starts_with("expand:http://snomed.info/sct/11010000107/version/20250921?fhir_vs=ecl/"));
    }

    #[tokio::test]
    async fn empty_expansion_is_not_an_error() {
        let server = FakeServer::new();
        let concepts = expand_observables(&server, &release()).await.unwrap();
        assert!(concepts.is_empty());
    }

    #[tokio::test]
    async fn server_error_becomes_expansion_error() {
        let mut server = FakeServer::new();
        server.expansion = Err(TerminologyError::Status {
            url: "http://fake.test/fhir/ValueSet/$expand".to_string(),
            status: 400,
            body: "invalid ECL".to_string(),
        });
        let err = expand_observables(&server, &release()).await.unwrap_err();
        assert!(matches!(err, TerminologyError::Expansion(_)));
        assert_eq!(err.status(), Some(400));
    }

    #[test]
    fn entries_without_code_are_skipped() {
        let body = json!({
            "expansion": {
                "contains": [
                    {"code": "A", "display": "Da"},
                    {"display": "orphan"},
                    {"code": "C"}
                ]
            }
        });
        let concepts = parse_expansion("http://tx", body).unwrap();
        assert_eq!(concepts, vec![Concept::new("A", "Da"), Concept::new("C", "")]);
    }

    #[test]
    fn malformed_expansion_is_decode_error() {
        let body = json!({"expansion": {"contains": "nope"}});
        let err = parse_expansion("http://tx", body).unwrap_err();
        match err {
            TerminologyError::Expansion(inner) => {
                assert!(matches!(*inner, TerminologyError::Decode { .. }))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
