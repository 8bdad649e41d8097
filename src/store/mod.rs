//! Reading sheets from `.xlsx`/`.xls`/`.ods`/`.csv` sources and writing output columns back.
//!
//! Writes never touch cells outside the output columns. Every flush re-opens the file,
//! builds the new document in a temp file beside it and renames it into place.

mod csv_file;
mod xlsx;

use crate::model::{
    targets_from_grid, CellValue, PrimaryTable, SheetGrid, TargetEntry, PRIMARY_COLUMNS, TARGET_COLUMNS,
    YM_ID_HEADER, YM_NAME_HEADER,
};
use log::{info, warn};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub use csv_file::read_csv_grid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, #[source] source: io::Error },
    #[error("cannot read spreadsheet {path}: {source}")]
    Spreadsheet { path: PathBuf, #[source] source: calamine::Error },
    #[error("CSV error in {path}: {source}")]
    Csv { path: PathBuf, #[source] source: csv::Error },
    #[error("ZIP error in {path}: {source}")]
    Zip { path: PathBuf, #[source] source: zip::result::ZipError },
    #[error("XML error in {path} (part {part}): {source}")]
    Xml { path: PathBuf, part: String, #[source] source: quick_xml::Error },
    #[error("sheet '{sheet}' not found in {path}")]
    MissingSheet { path: PathBuf, sheet: String },
    #[error("sheet '{sheet}' in {path} is missing columns: {}", .columns.join(", "))]
    MissingColumns { path: PathBuf, sheet: String, columns: Vec<String> },
    #[error("cannot insert a column into sheet '{sheet}' in {path}: {reason}")]
    InsertBlocked { path: PathBuf, sheet: String, reason: String },
    #[error("unsupported file type: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("malformed workbook {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(io::Error) -> StoreError + '_ {
        move |source| StoreError::Io { path: path.to_path_buf(), source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Xlsx,
    /// Read-only spreadsheet formats calamine understands but we cannot patch.
    Spreadsheet,
    Csv,
}

impl Format {
    pub fn detect(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Format::Csv);
        }
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "xlsx" | "xlsm" => Some(Format::Xlsx),
            "xls" | "xlsb" | "ods" => Some(Format::Spreadsheet),
            "csv" | "txt" => Some(Format::Csv),
            _ => None,
        }
    }
}

/// A named sheet inside a backing file. For CSV the sheet name only matters when
/// `path` is a directory, in which case the sheet lives at `<path>/<sheet>.csv`.
#[derive(Debug, Clone, PartialEq)]
pub struct SheetRef {
    pub path: PathBuf,
    pub sheet: String,
    pub delimiter: u8,
}

impl SheetRef {
    pub fn new(path: impl Into<PathBuf>, sheet: impl Into<String>) -> Self {
        Self { path: path.into(), sheet: sheet.into(), delimiter: b',' }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn format(&self) -> Result<Format, StoreError> {
        Format::detect(&self.path).ok_or_else(|| StoreError::UnsupportedFormat(self.path.clone()))
    }

    fn csv_path(&self) -> PathBuf {
        if self.path.is_dir() {
            self.path.join(format!("{}.csv", self.sheet))
        } else {
            self.path.clone()
        }
    }

    pub fn describe(&self) -> String {
        match self.format() {
            Ok(Format::Csv) => self.csv_path().display().to_string(),
            _ => format!("{} [{}]", self.path.display(), self.sheet),
        }
    }
}

pub fn read_sheet(sheet: &SheetRef) -> Result<SheetGrid, StoreError> {
    match sheet.format()? {
        Format::Xlsx | Format::Spreadsheet => xlsx::read_sheet(&sheet.path, &sheet.sheet),
        Format::Csv => read_csv_grid(&sheet.csv_path(), sheet.delimiter, false),
    }
}

/// First sheet of a spreadsheet file, used for auxiliary tables whose sheet name is not fixed.
pub fn read_first_sheet(path: &Path) -> Result<SheetGrid, StoreError> {
    xlsx::read_first_sheet(path)
}

fn require_columns(sheet: &SheetRef, grid: &SheetGrid, required: &[&str]) -> Result<(), StoreError> {
    let missing = grid.missing_columns(required);
    if missing.is_empty() {
        return Ok(());
    }
    Err(StoreError::MissingColumns { path: sheet.path.clone(), sheet: sheet.sheet.clone(), columns: missing })
}

pub fn load_primary(sheet: &SheetRef, mirror_names: bool) -> Result<PrimaryTable, StoreError> {
    let grid = read_sheet(sheet)?;
    require_columns(sheet, &grid, &PRIMARY_COLUMNS)?;
    let table = PrimaryTable::from_grid(&grid, mirror_names);
    let unmatchable = table.rows.iter().filter(|r| !r.is_matchable()).count();
    info!(
        "Primary sheet {} loaded: {} rows, {} columns, {} already mapped.",
        sheet.describe(),
        table.len(),
        grid.headers.len(),
        table.matched_count()
    );
    if unmatchable > 0 {
        warn!("{} primary rows have neither subject_id nor parent_id and can never match.", unmatchable);
    }
    Ok(table)
}

pub fn load_targets(sheet: &SheetRef) -> Result<Vec<TargetEntry>, StoreError> {
    let grid = read_sheet(sheet)?;
    require_columns(sheet, &grid, &TARGET_COLUMNS)?;
    let (targets, skipped) = targets_from_grid(&grid);
    info!("Target sheet {} loaded: {} entries.", sheet.describe(), targets.len());
    if skipped > 0 {
        warn!("Skipped {} target rows with an empty last_id or last_name.", skipped);
    }
    Ok(targets)
}

/// Column values to persist. `values[i]` goes to sheet row `i + 2`.
#[derive(Debug, Clone)]
pub struct ColumnWrite {
    pub anchor: String,
    pub values: Vec<CellValue>,
    /// Written next to the anchor; the column is inserted right after it when missing.
    pub companion: Option<(String, Vec<CellValue>)>,
}

impl ColumnWrite {
    pub fn for_table(table: &PrimaryTable) -> Self {
        Self {
            anchor: YM_ID_HEADER.to_string(),
            values: table.ym_id_cells(),
            companion: table.mirror_names.then(|| (YM_NAME_HEADER.to_string(), table.ym_name_cells())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub rows_written: usize,
    pub inserted_companion: bool,
}

/// Checkpoint: writes the table's output columns into the backing file as it is on disk now.
pub fn flush(sheet: &SheetRef, table: &PrimaryTable) -> Result<FlushReport, StoreError> {
    let write = ColumnWrite::for_table(table);
    match sheet.format()? {
        Format::Xlsx => xlsx::write_columns(&sheet.path, &sheet.sheet, &write),
        Format::Csv => csv_file::write_columns(&sheet.csv_path(), sheet.delimiter, &sheet.sheet, &write),
        Format::Spreadsheet => Err(StoreError::UnsupportedFormat(sheet.path.clone())),
    }
}

/// Builds the replacement in a temp file next to `path`, then renames it over the original.
pub(crate) fn persist_atomically<F>(path: &Path, write: F) -> Result<(), StoreError>
where
    F: FnOnce(&mut File) -> Result<(), StoreError>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(StoreError::io(dir))?;
    write(tmp.as_file_mut())?;
    if let Ok(meta) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(meta.permissions()).map_err(StoreError::io(path))?;
    }
    tmp.as_file().sync_all().map_err(StoreError::io(path))?;
    tmp.persist(path).map_err(|e| StoreError::Io { path: path.to_path_buf(), source: e.error })?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::CategoryId;
    use std::fs;

    pub(crate) use super::xlsx::tests::{write_fixture_workbook, write_workbook_with_first_sheet};

    pub(crate) const PRIMARY_CSV: &str = "parent_id,parent_name,subject_id,subject_name,YM_id,comment\n\
        1,Обувь,101,Кроссовки,,keep me\n\
        1,Обувь,202,Ботинки,,\"quoted, value\"\n\
        2,Сумки,,,,\n";

    #[test]
    fn test_format_detection() {
        assert_eq!(Format::detect(Path::new("wb-ym.xlsx")), Some(Format::Xlsx));
        assert_eq!(Format::detect(Path::new("legacy.XLS")), Some(Format::Spreadsheet));
        assert_eq!(Format::detect(Path::new("wb.csv")), Some(Format::Csv));
        assert_eq!(Format::detect(Path::new("notes.docx")), None);
    }

    #[test]
    fn test_load_primary_from_csv_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("WB.csv"), PRIMARY_CSV).unwrap();
        fs::write(dir.path().join("YM.csv"), "last_id,last_name\n55,Shoes\n,Broken\n").unwrap();

        let table = load_primary(&SheetRef::new(dir.path(), "WB"), false).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.rows[1].subject_id, CategoryId::parse("202"));
        assert!(table.rows[2].subject_id.is_none());

        let targets = load_targets(&SheetRef::new(dir.path(), "YM")).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].ym_name, "Shoes");
    }

    #[test]
    fn test_missing_required_column_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wb.csv");
        fs::write(&path, "parent_id,subject_id,YM_id\n1,101,\n").unwrap();
        match load_primary(&SheetRef::new(&path, "WB"), false) {
            Err(StoreError::MissingColumns { columns, .. }) => {
                assert_eq!(columns, vec!["parent_name".to_string(), "subject_name".to_string()]);
            }
            other => panic!("expected missing columns, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_targets(&SheetRef::new(dir.path().join("absent.csv"), "YM"));
        assert!(matches!(result, Err(StoreError::Csv { .. }) | Err(StoreError::Io { .. })));
    }
}
