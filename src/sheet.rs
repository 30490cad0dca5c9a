use anyhow::{Context, Result};
use calamine::{Data, Range, Reader, open_workbook_auto};
use csv::ReaderBuilder;
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::error::MapError;

/// A spreadsheet cell, keeping enough of the source type to write it back.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Int(i64),
    Bool(bool),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Self::Empty
        } else {
            Self::Text(value)
        }
    }

    /// String form used for header matching and LOINC lookups. Integral
    /// floats render without a fraction, so 1234.0 reads as "1234".
    pub fn as_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Text(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Number(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 => {
                format!("{}", *n as i64)
            }
            Self::Number(n) => n.to_string(),
            Self::Bool(b) => b.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl From<&Data> for Cell {
    fn from(value: &Data) -> Self {
        match value {
            Data::Empty => Self::Empty,
            Data::String(s) => Self::text(s.as_str()),
            Data::Int(i) => Self::Int(*i),
            Data::Float(f) => Self::Number(*f),
            Data::Bool(b) => Self::Bool(*b),
            Data::DateTime(dt) => match dt.as_datetime() {
                Some(ts) if ts.time() == chrono::NaiveTime::MIN => {
                    Self::Text(ts.format("%Y-%m-%d").to_string())
                }
                Some(ts) => Self::Text(ts.format("%Y-%m-%d %H:%M:%S").to_string()),
                None => Self::Number(dt.as_f64()),
            },
            Data::DateTimeIso(s) | Data::DurationIso(s) => Self::text(s.as_str()),
            Data::Error(err) => Self::Text(err.to_string()),
        }
    }
}

/// A sheet as a grid anchored at A1.
#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetFormat {
    Workbook,
    Delimited(u8),
}

impl SheetFormat {
    pub fn from_path(path: &Path) -> Result<Self, MapError> {
        let extension = path
            .extension()
            .and_then(|x| x.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match extension.as_str() {
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Ok(Self::Workbook),
            "csv" => Ok(Self::Delimited(b',')),
            "tsv" => Ok(Self::Delimited(b'\t')),
            _ => Err(MapError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            }),
        }
    }
}

pub fn load_sheets(path: &Path) -> Result<(SheetFormat, Vec<Sheet>), MapError> {
    let format = SheetFormat::from_path(path)?;
    let sheets = match format {
        SheetFormat::Workbook => load_workbook(path)?,
        SheetFormat::Delimited(delimiter) => vec![load_delimited(path, delimiter)?],
    };
    Ok((format, sheets))
}

fn load_workbook(path: &Path) -> Result<Vec<Sheet>, MapError> {
    let read_err = |message: String| MapError::Read {
        path: path.to_path_buf(),
        message,
    };
    let mut workbook = open_workbook_auto(path).map_err(|err| read_err(err.to_string()))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|err| read_err(format!("sheet '{name}': {err}")))?;
        sheets.push(sheet_from_range(name, &range));
    }
    Ok(sheets)
}

fn sheet_from_range(name: String, range: &Range<Data>) -> Sheet {
    let (first_row, first_col) = range.start().unwrap_or((0, 0));
    let mut rows: Vec<Vec<Cell>> = vec![Vec::new(); first_row as usize];
    for source in range.rows() {
        let mut cells = vec![Cell::Empty; first_col as usize];
        cells.extend(source.iter().map(Cell::from));
        rows.push(cells);
    }
    Sheet { name, rows }
}

fn load_delimited(path: &Path, delimiter: u8) -> Result<Sheet, MapError> {
    let read_err = |message: String| MapError::Read {
        path: path.to_path_buf(),
        message,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_path(path)
        .map_err(|err| read_err(err.to_string()))?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| read_err(err.to_string()))?;
        rows.push(record.iter().map(Cell::text).collect::<Vec<_>>());
    }
    if let Some(Cell::Text(first)) = rows.first_mut().and_then(|row| row.first_mut()) {
        if first.starts_with('\u{feff}') {
            first.remove(0);
        }
    }

    let name = path
        .file_stem()
        .and_then(|x| x.to_str())
        .unwrap_or("Sheet1")
        .to_string();
    Ok(Sheet { name, rows })
}

/// Spreadsheets in `dir` that the mapper can read, sorted by file name.
/// Office lock files and hidden files are ignored.
pub fn list_spreadsheets(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed listing {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("Failed reading entry in {}", dir.display()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with("~$") || file_name.starts_with('.') {
            debug!(file = %file_name, "Skipping lock/hidden file");
            continue;
        }
        match SheetFormat::from_path(&path) {
            Ok(_) => files.push(path),
            Err(err) => warn!(file = %file_name, "Skipping: {err}"),
        }
    }
    files.sort();
    Ok(files)
}

/// Writes a single-sheet workbook: a bold header row followed by `rows`.
pub fn write_xlsx(
    path: &Path,
    sheet_name: &str,
    header: &[String],
    rows: &[Vec<Cell>],
) -> Result<(), MapError> {
    let write_err = |err: XlsxError| MapError::Write {
        path: path.to_path_buf(),
        message: err.to_string(),
    };

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    if let Err(err) = worksheet.set_name(sheet_name) {
        debug!(sheet = sheet_name, error = %err, "Keeping default worksheet name");
    }

    let bold = Format::new().set_bold();
    for (col, name) in header.iter().enumerate() {
        let col = grid_col(path, col)?;
        worksheet
            .write_string_with_format(0, col, name, &bold)
            .map_err(write_err)?;
    }
    for (idx, cells) in rows.iter().enumerate() {
        let row = grid_row(path, idx + 1)?;
        for (col, cell) in cells.iter().enumerate() {
            let col = grid_col(path, col)?;
            write_cell(worksheet, row, col, cell).map_err(write_err)?;
        }
    }

    workbook.save(path).map_err(write_err)
}

fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, cell: &Cell) -> Result<(), XlsxError> {
    match cell {
        Cell::Empty => {}
        Cell::Text(s) => {
            worksheet.write_string(row, col, s)?;
        }
        Cell::Int(i) => {
            worksheet.write_number(row, col, *i as f64)?;
        }
        Cell::Number(n) if n.is_finite() => {
            worksheet.write_number(row, col, *n)?;
        }
        Cell::Number(n) => {
            worksheet.write_string(row, col, n.to_string())?;
        }
        Cell::Bool(b) => {
            worksheet.write_boolean(row, col, *b)?;
        }
    }
    Ok(())
}

fn grid_row(path: &Path, idx: usize) -> Result<u32, MapError> {
    u32::try_from(idx).map_err(|_| MapError::Write {
        path: path.to_path_buf(),
        message: format!("row {idx} exceeds the worksheet limit"),
    })
}

fn grid_col(path: &Path, idx: usize) -> Result<u16, MapError> {
    u16::try_from(idx).map_err(|_| MapError::Write {
        path: path.to_path_buf(),
        message: format!("column {idx} exceeds the worksheet limit"),
    })
}
