use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::{
    common::run_timestamp,
    constants::{LOINC_COLUMN, SNOMED_CODE_COLUMN, SNOMED_DISPLAY_COLUMN},
    error::MapError,
    sheet::{Cell, Sheet, load_sheets, write_xlsx},
    table::{DuplicatePolicy, ReverseIndex, log_index_stats, log_table_stats, read_lookup_table},
};

/// Where the header row is and which column holds the LOINC codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMatch {
    pub header_row: usize,
    pub loinc_col: usize,
}

/// One way of finding the LOINC column in a sheet. On a miss the locator
/// returns the header cells it inspected.
pub trait HeaderLocator {
    fn describe(&self) -> String;
    fn locate(&self, sheet: &Sheet) -> Result<HeaderMatch, Vec<String>>;
}

/// Treats a fixed row (0-based) as the header.
#[derive(Debug, Clone)]
pub struct HeaderRow {
    pub row: usize,
}

impl HeaderLocator for HeaderRow {
    fn describe(&self) -> String {
        format!("header row {}", self.row + 1)
    }

    fn locate(&self, sheet: &Sheet) -> Result<HeaderMatch, Vec<String>> {
        let columns: Vec<String> = sheet
            .rows
            .get(self.row)
            .map(|cells| cells.iter().map(Cell::as_text).collect())
            .unwrap_or_default();
        columns
            .iter()
            .position(|name| name.trim().eq_ignore_ascii_case(LOINC_COLUMN))
            .map(|loinc_col| HeaderMatch {
                header_row: self.row,
                loinc_col,
            })
            .ok_or(columns)
    }
}

pub fn default_locators() -> Vec<Box<dyn HeaderLocator>> {
    (0..3)
        .map(|row| Box::new(HeaderRow { row }) as Box<dyn HeaderLocator>)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSummary {
    pub output: PathBuf,
    pub mapped: usize,
    pub unmapped: usize,
    pub total: usize,
}

/// Annotates lab spreadsheets with the SNOMED CT concept for each LOINC code.
pub struct SpreadsheetMapper {
    locators: Vec<Box<dyn HeaderLocator>>,
    duplicate_policy: DuplicatePolicy,
}

impl SpreadsheetMapper {
    pub fn new(duplicate_policy: DuplicatePolicy) -> Self {
        Self {
            locators: default_locators(),
            duplicate_policy,
        }
    }

    #[cfg(test)]
    pub fn with_locators(mut self, locators: Vec<Box<dyn HeaderLocator>>) -> Self {
        self.locators = locators;
        self
    }

    /// Maps one spreadsheet. Failures are logged here and never propagate.
    pub fn map_file(&self, input: &Path, table: &Path, out_dir: &Path) -> Option<MapSummary> {
        match self.try_map_file(input, table, out_dir) {
            Ok(summary) => {
                log_summary(&summary);
                Some(summary)
            }
            Err(err) => {
                log_failure(&err);
                None
            }
        }
    }

    pub fn try_map_file(
        &self,
        input: &Path,
        table: &Path,
        out_dir: &Path,
    ) -> Result<MapSummary, MapError> {
        info!(input = %input.display(), "Starting SNOMED CT mapping");
        let (_, sheets) = load_sheets(input)?;
        if sheets.len() > 1 {
            let names: Vec<&str> = sheets.iter().map(|s| s.name.as_str()).collect();
            info!("Workbook contains sheets: {}", names.join(", "));
        }

        let sheet = self.select_sheet(&sheets).ok_or_else(|| MapError::Read {
            path: input.to_path_buf(),
            message: "workbook has no sheets".to_string(),
        })?;
        let found = self.discover_header(sheet).map_err(|last_columns| {
            MapError::MissingColumn {
                path: input.to_path_buf(),
                column: LOINC_COLUMN,
                tried: self.locators.len(),
                last_columns,
            }
        })?;
        info!(
            sheet = %sheet.name,
            header_row = found.header_row + 1,
            "Found '{LOINC_COLUMN}' column"
        );

        let rows = read_lookup_table(table)?;
        log_table_stats(table, &rows);
        let index = ReverseIndex::build(&rows, self.duplicate_policy);
        log_index_stats(&index, self.duplicate_policy);
        if index.is_empty() {
            warn!(table = %table.display(), "Map file has no LOINC codes; every row will be unmapped");
        }

        let records = data_records(sheet, found.header_row);
        let width = records
            .iter()
            .map(Vec::len)
            .chain(sheet.rows.get(found.header_row).map(Vec::len))
            .max()
            .unwrap_or(0);
        let mut header: Vec<String> = sheet.rows[found.header_row]
            .iter()
            .map(Cell::as_text)
            .collect();
        header.resize(width, String::new());
        header.push(SNOMED_CODE_COLUMN.to_string());
        header.push(SNOMED_DISPLAY_COLUMN.to_string());

        let (annotated, mapped) = annotate_records(&records, width, found.loinc_col, &index);

        std::fs::create_dir_all(out_dir).map_err(|err| MapError::Write {
            path: out_dir.to_path_buf(),
            message: err.to_string(),
        })?;
        let output = unique_output_path(out_dir, input, &run_timestamp());
        write_xlsx(&output, &sheet.name, &header, &annotated)?;

        Ok(MapSummary {
            output,
            mapped,
            unmapped: annotated.len() - mapped,
            total: annotated.len(),
        })
    }

    /// First sheet where a locator finds the LOINC column, else the first sheet.
    fn select_sheet<'a>(&self, sheets: &'a [Sheet]) -> Option<&'a Sheet> {
        if sheets.len() == 1 {
            return sheets.first();
        }
        for sheet in sheets {
            if self.locators.iter().any(|l| l.locate(sheet).is_ok()) {
                info!(sheet = %sheet.name, "Selected sheet");
                return Some(sheet);
            }
        }
        let first = sheets.first()?;
        warn!(
            sheet = %first.name,
            "No sheet has a '{LOINC_COLUMN}' column; using the first sheet"
        );
        Some(first)
    }

    fn discover_header(&self, sheet: &Sheet) -> Result<HeaderMatch, Vec<String>> {
        let mut last_columns = Vec::new();
        for locator in &self.locators {
            match locator.locate(sheet) {
                Ok(found) => return Ok(found),
                Err(columns) => {
                    warn!(
                        strategy = %locator.describe(),
                        "'{LOINC_COLUMN}' column not found. Columns: {}",
                        preview(&columns)
                    );
                    last_columns = columns;
                }
            }
        }
        Err(last_columns)
    }
}

/// Rows below the header, without the ones that have no cells at all.
/// Whitespace-only cells count as data.
fn data_records(sheet: &Sheet, header_row: usize) -> Vec<Vec<Cell>> {
    sheet
        .rows
        .iter()
        .skip(header_row + 1)
        .filter(|row| !row.iter().all(Cell::is_empty))
        .cloned()
        .collect()
}

/// Returns the records padded to `width` with the two SNOMED CT columns
/// appended, plus the number of mapped records.
pub fn annotate_records(
    records: &[Vec<Cell>],
    width: usize,
    loinc_col: usize,
    index: &ReverseIndex,
) -> (Vec<Vec<Cell>>, usize) {
    let mut mapped = 0;
    let annotated = records
        .iter()
        .map(|record| {
            let target = record
                .get(loinc_col)
                .and_then(normalize_loinc)
                .and_then(|loinc| index.get(&loinc));
            let mut out = record.clone();
            out.resize(width, Cell::Empty);
            match target {
                Some(target) => {
                    mapped += 1;
                    out.push(Cell::text(target.snomed_code.as_str()));
                    out.push(Cell::text(target.snomed_display.as_str()));
                }
                None => {
                    out.push(Cell::Empty);
                    out.push(Cell::Empty);
                }
            }
            out
        })
        .collect();
    (annotated, mapped)
}

/// Trimmed LOINC text of a cell. Empty cells and the `nan` placeholder have
/// no code.
pub fn normalize_loinc(cell: &Cell) -> Option<String> {
    let text = cell.as_text();
    let text = text.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(text.to_string())
    }
}

pub fn output_file_name(input: &Path, timestamp: &str) -> String {
    let stem = input
        .file_stem()
        .and_then(|x| x.to_str())
        .unwrap_or("spreadsheet");
    format!("{stem}-snomed-mapped-{timestamp}.xlsx")
}

/// Output path in `out_dir` not yet taken. Inputs sharing a stem (`lab.csv`,
/// `lab.tsv`) get their extension added to the name, then a counter.
pub fn unique_output_path(out_dir: &Path, input: &Path, timestamp: &str) -> PathBuf {
    let output = out_dir.join(output_file_name(input, timestamp));
    if !output.exists() {
        return output;
    }

    let stem = input
        .file_stem()
        .and_then(|x| x.to_str())
        .unwrap_or("spreadsheet");
    let extension = input
        .extension()
        .and_then(|x| x.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let mut counter = 1usize;
    loop {
        let suffix = if counter == 1 {
            String::new()
        } else {
            format!("-{counter}")
        };
        let candidate =
            out_dir.join(format!("{stem}-{extension}-snomed-mapped-{timestamp}{suffix}.xlsx"));
        if !candidate.exists() {
            warn!(
                taken = %output.display(),
                output = %candidate.display(),
                "Output name already taken; writing to a distinct file"
            );
            return candidate;
        }
        counter += 1;
    }
}

fn preview(columns: &[String]) -> String {
    const MAX: usize = 10;
    let mut shown = columns.iter().take(MAX).cloned().collect::<Vec<_>>().join(", ");
    if columns.len() > MAX {
        shown.push_str(", ...");
    }
    shown
}

fn log_summary(summary: &MapSummary) {
    info!(
        output = %summary.output.display(),
        total = summary.total,
        mapped = summary.mapped,
        unmapped = summary.unmapped,
        "Mapping summary: {} of {} rows mapped to SNOMED CT",
        summary.mapped,
        summary.total
    );
}

fn log_failure(err: &MapError) {
    error!("{err}");
    match err {
        MapError::MissingColumn { last_columns, .. } => {
            error!("Last candidate columns: {}", preview(last_columns));
        }
        MapError::MalformedTable { available, .. } => {
            error!("Map file columns: {}", available.join(", "));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::MappingRow, table::write_lookup_table};
    use rust_xlsxwriter::Workbook;
    use std::fs;

    fn write_table(dir: &Path) -> PathBuf {
        let path = dir.join("snomed-loinc-map-20250921.tsv");
        write_lookup_table(
            &path,
            &[
                MappingRow {
                    code: "A".to_string(),
                    display: "Da".to_string(),
                    loinc_code: "718-7".to_string(),
                },
                MappingRow {
                    code: "B".to_string(),
                    display: "Db".to_string(),
                    loinc_code: String::new(),
                },
            ],
        )
        .unwrap();
        path
    }

    fn outputs(dir: &Path) -> Vec<PathBuf> {
        if !dir.exists() {
            return Vec::new();
        }
        fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect()
    }

    fn read_output(path: &Path) -> Sheet {
        let (_, mut sheets) = load_sheets(path).unwrap();
        sheets.remove(0)
    }

    #[test]
    fn header_in_third_row_is_found() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("panel.csv");
        fs::write(
            &input,
            "Lab report,,\nGenerated,,\nTest,Loinc ,Units\nHemoglobin,718-7 ,g/dL\n",
        )
        .unwrap();
        let table = write_table(dir.path());
        let out = dir.path().join("out");

        let summary = SpreadsheetMapper::new(DuplicatePolicy::KeepLast)
            .map_file(&input, &table, &out)
            .unwrap();
        assert_eq!((summary.mapped, summary.unmapped, summary.total), (1, 0, 1));

        let sheet = read_output(&summary.output);
        assert_eq!(
            sheet.rows[0].iter().map(Cell::as_text).collect::<Vec<_>>(),
            vec!["Test", "Loinc ", "Units", SNOMED_CODE_COLUMN, SNOMED_DISPLAY_COLUMN]
        );
        assert_eq!(sheet.rows[1][3], Cell::text("A"));
        assert_eq!(sheet.rows[1][4], Cell::text("Da"));
    }

    #[test]
    fn missing_loinc_column_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("panel.csv");
        fs::write(&input, "a,b\nc,d\ne,f\nTest,LOINC\n").unwrap();
        let table = write_table(dir.path());
        let out = dir.path().join("out");

        let mapper = SpreadsheetMapper::new(DuplicatePolicy::KeepLast);
        match mapper.try_map_file(&input, &table, &out).unwrap_err() {
            MapError::MissingColumn {
                tried,
                last_columns,
                ..
            } => {
                assert_eq!(tried, 3);
                assert_eq!(last_columns, vec!["e", "f"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(mapper.map_file(&input, &table, &out).is_none());
        assert!(outputs(&out).is_empty());
    }

    #[test]
    fn unmatched_and_placeholder_codes_are_blank() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("panel.tsv");
        fs::write(&input, "LOINC\tTest\nnan\tx\n\tblank\n9999-9\tother\n\n718-7\tHb\n").unwrap();
        let table = write_table(dir.path());
        let out = dir.path().join("out");

        let summary = SpreadsheetMapper::new(DuplicatePolicy::KeepLast)
            .map_file(&input, &table, &out)
            .unwrap();
        assert_eq!((summary.mapped, summary.unmapped, summary.total), (1, 3, 4));

        let sheet = read_output(&summary.output);
        let codes: Vec<String> = sheet.rows[1..]
            .iter()
            .map(|row| row.get(2).map(Cell::as_text).unwrap_or_default())
            .collect();
        assert_eq!(codes, vec!["", "", "", "A"]);
    }

    #[test]
    fn picks_the_sheet_with_a_loinc_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("lab.xlsx");
        let mut workbook = Workbook::new();
        let notes = workbook.add_worksheet();
        notes.set_name("Notes").unwrap();
        notes.write_string(0, 0, "Read me").unwrap();
        let results = workbook.add_worksheet();
        results.set_name("Results").unwrap();
        results.write_string(0, 0, "LOINC").unwrap();
        results.write_string(1, 0, "718-7").unwrap();
        workbook.save(&input).unwrap();
        let table = write_table(dir.path());
        let out = dir.path().join("out");

        let summary = SpreadsheetMapper::new(DuplicatePolicy::KeepLast)
            .map_file(&input, &table, &out)
            .unwrap();
        assert_eq!(summary.mapped, 1);
        let sheet = read_output(&summary.output);
        assert_eq!(sheet.name, "Results");
        assert_eq!(sheet.rows[1][1], Cell::text("A"));
    }

    #[test]
    fn unsupported_extension_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("panel.pdf");
        fs::write(&input, "LOINC\n718-7\n").unwrap();
        let table = write_table(dir.path());
        let out = dir.path().join("out");

        let mapper = SpreadsheetMapper::new(DuplicatePolicy::KeepLast);
        assert!(matches!(
            mapper.try_map_file(&input, &table, &out),
            Err(MapError::UnsupportedFormat { .. })
        ));
        assert!(outputs(&out).is_empty());
    }

    #[test]
    fn malformed_table_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("panel.csv");
        fs::write(&input, "LOINC\n718-7\n").unwrap();
        let table = dir.path().join("map.tsv");
        fs::write(&table, "code\tdisplay\nA\tDa\n").unwrap();
        let out = dir.path().join("out");

        let mapper = SpreadsheetMapper::new(DuplicatePolicy::KeepLast);
        assert!(matches!(
            mapper.try_map_file(&input, &table, &out),
            Err(MapError::MalformedTable { .. })
        ));
        assert!(mapper.map_file(&input, &table, &out).is_none());
        assert!(outputs(&out).is_empty());
    }

    #[test]
    fn numeric_loinc_cells_match_without_fraction() {
        let index = ReverseIndex::build(
            &[MappingRow {
                code: "C".to_string(),
                display: "Dc".to_string(),
                loinc_code: "1234".to_string(),
            }],
            DuplicatePolicy::KeepLast,
        );
        let records = vec![vec![Cell::Number(1234.0)], vec![Cell::text("NaN")]];
        let (annotated, mapped) = annotate_records(&records, 1, 0, &index);
        assert_eq!(mapped, 1);
        assert_eq!(annotated[0][1], Cell::text("C"));
        assert_eq!(annotated[1][1], Cell::Empty);
        assert_eq!(annotated[1][2], Cell::Empty);
    }

    #[test]
    fn custom_locators_replace_defaults() {
        let sheet = Sheet {
            name: "s".to_string(),
            rows: vec![
                vec![Cell::text("x")],
                vec![Cell::text("x")],
                vec![Cell::text("x")],
                vec![Cell::text("x")],
                vec![Cell::text("LOINC")],
            ],
        };
        let mapper = SpreadsheetMapper::new(DuplicatePolicy::KeepLast)
            .with_locators(vec![Box::new(HeaderRow { row: 4 })]);
        assert_eq!(
            mapper.discover_header(&sheet),
            Ok(HeaderMatch {
                header_row: 4,
                loinc_col: 0
            })
        );
    }

    #[test]
    fn same_stem_inputs_get_distinct_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let table = write_table(dir.path());
        let out = dir.path().join("out");
        let csv = dir.path().join("lab.csv");
        let tsv = dir.path().join("lab.tsv");
        fs::write(&csv, "LOINC,Src\n718-7,csv\n").unwrap();
        fs::write(&tsv, "LOINC\tSrc\n718-7\ttsv\n").unwrap();

        let mapper = SpreadsheetMapper::new(DuplicatePolicy::KeepLast);
        let first = mapper.map_file(&csv, &table, &out).unwrap();
        let second = mapper.map_file(&tsv, &table, &out).unwrap();

        assert_ne!(first.output, second.output);
        assert_eq!(outputs(&out).len(), 2);
        assert_eq!(read_output(&first.output).rows[1][1], Cell::text("csv"));
        assert_eq!(read_output(&second.output).rows[1][1], Cell::text("tsv"));
    }

    #[test]
    fn taken_output_names_fall_back_to_extension_then_counter() {
        let dir = tempfile::tempdir().unwrap();
        let ts = "20250102-030405";
        let input = Path::new("/in/lab.TSV");

        let first = unique_output_path(dir.path(), input, ts);
        assert_eq!(first, dir.path().join("lab-snomed-mapped-20250102-030405.xlsx"));
        fs::write(&first, "").unwrap();

        let second = unique_output_path(dir.path(), input, ts);
        assert_eq!(second, dir.path().join("lab-tsv-snomed-mapped-20250102-030405.xlsx"));
        fs::write(&second, "").unwrap();

        let third = unique_output_path(dir.path(), input, ts);
        assert_eq!(third, dir.path().join("lab-tsv-snomed-mapped-20250102-030405-2.xlsx"));
    }

    #[test]
    fn whitespace_only_rows_are_kept() {
        let sheet = Sheet {
            name: "s".to_string(),
            rows: vec![
                vec![Cell::text("LOINC"), Cell::text("Note")],
                vec![Cell::text("  "), Cell::Empty],
                vec![Cell::Empty, Cell::Empty],
                vec![],
                vec![Cell::text("718-7"), Cell::Empty],
            ],
        };
        let records = data_records(&sheet, 0);
        assert_eq!(
            records,
            vec![
                vec![Cell::text("  "), Cell::Empty],
                vec![Cell::text("718-7"), Cell::Empty],
            ]
        );
    }

    #[test]
    fn output_name_uses_stem_and_timestamp() {
        assert_eq!(
            output_file_name(Path::new("/in/chem panel.xlsx"), "20250102-030405"),
            "chem panel-snomed-mapped-20250102-030405.xlsx"
        );
    }
}
