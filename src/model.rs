/// A SNOMED CT concept returned by a value set expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Concept {
    pub code: String,
    pub display: String,
}

impl Concept {
    pub fn new(code: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            display: display.into(),
        }
    }
}

/// One row of the persisted SNOMED -> LOINC map. `loinc_code` is empty when
/// the concept has no LOINC equivalent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRow {
    pub code: String,
    pub display: String,
    pub loinc_code: String,
}

impl MappingRow {
    pub fn from_concept(concept: &Concept, loinc_code: Option<String>) -> Self {
        Self {
            code: concept.code.clone(),
            display: concept.display.clone(),
            loinc_code: loinc_code.unwrap_or_default(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        !self.loinc_code.trim().is_empty()
    }
}

/// A SNOMED CT edition and release date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctRelease {
    pub edition: String,
    pub version: String,
}

impl SctRelease {
    pub fn new(edition: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            edition: edition.into(),
            version: version.into(),
        }
    }

    pub fn version_uri(&self) -> String {
        format!(
            "http://snomed.info/sct/{}/version/{}",
            self.edition, self.version
        )
    }

    pub fn map_file_name(&self) -> String {
        format!("snomed-loinc-map-{}.tsv", self.version)
    }
}
