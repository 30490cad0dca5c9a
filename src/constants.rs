pub const DEFAULT_TX_ENDPOINT: &str = "http://localhost:8080/fhir";
// LOINC-SNOMED extension module and its current production release.
pub const DEFAULT_SCT_EDITION: &str = "11010000107";
pub const DEFAULT_SCT_VERSION: &str = "20250921";

pub const SNOMED_SYSTEM_URI: &str = "http://snomed.info/sct";
pub const LOINC_SYSTEM_URI: &str = "http://loinc.org";
pub const TERMINOLOGY_SERVER_PROFILE: &str =
    "http://hl7.org/fhir/CapabilityStatement/terminology-server";
pub const EXPECTED_FHIR_VERSION: &str = "4.0.1";
pub const FHIR_JSON: &str = "application/fhir+json";

/// Descendants of 363787002 |Observable entity| minus the exam, specimen and
/// qualifier branches.
pub const OBSERVABLE_ENTITY_ECL: &str =
    "( < 363787002 ) MINUS ( (<< 78064003 OR << 246464006 OR << 363788007 ) )";
pub const EQUIVALENT_CONCEPT_PROPERTY: &str = "equivalentConcept";

pub const LOINC_COLUMN: &str = "LOINC";
pub const SNOMED_CODE_COLUMN: &str = "SNOMED_CT_Code";
pub const SNOMED_DISPLAY_COLUMN: &str = "SNOMED_CT_Display";

pub const LOOKUP_CACHE_FILE: &str = "concept-lookup-cache.sqlite";
pub const RUN_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
