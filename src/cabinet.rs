use crate::model::{CategoryId, SheetGrid};
use crate::store::{self, StoreError};
use anyhow::{bail, Context, Result};
use glob::glob;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const CABINET_NAME_COLUMN: &str = "Категория_YMname";
pub const CABINET_ID_COLUMN: &str = "Категория_YMid";
const CABINET_CSV_DELIMITER: u8 = b';';

/// Display name -> YM category id, merged from every cabinet export in a directory.
#[derive(Debug, Clone, Default)]
pub struct CabinetMapping {
    entries: HashMap<String, CategoryId>,
    pub files_loaded: usize,
    pub rows_read: usize,
}

impl CabinetMapping {
    /// Later pairs override earlier ones with the same name.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, CategoryId)>) -> Self {
        let mut mapping = Self::default();
        for (name, id) in pairs {
            mapping.rows_read += 1;
            mapping.entries.insert(name, id);
        }
        mapping
    }

    pub fn get(&self, name: &str) -> Option<&CategoryId> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn absorb(&mut self, grid: &SheetGrid, name_col: usize, id_col: usize) -> usize {
        let mut taken = 0;
        for r in 0..grid.rows.len() {
            let name = grid.cell(r, name_col).as_text();
            let Some(id) = CategoryId::from_cell(grid.cell(r, id_col)) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            self.entries.insert(name, id);
            taken += 1;
        }
        self.rows_read += taken;
        taken
    }
}

fn read_cabinet_file(path: &Path) -> Result<Option<SheetGrid>, StoreError> {
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).unwrap_or_default();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xls" | "xlsb" | "ods" => store::read_first_sheet(path).map(Some),
        "csv" => store::read_csv_grid(path, CABINET_CSV_DELIMITER, true).map(Some),
        _ => Ok(None),
    }
}

fn find_cabinet_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("*");
    let pattern_str = pattern.to_string_lossy();
    debug!("Searching for cabinet files matching pattern: {}", pattern_str);
    let mut paths: Vec<PathBuf> = glob(&pattern_str)?.filter_map(Result::ok).filter(|p| p.is_file()).collect();
    paths.sort();
    Ok(paths)
}

/// Loads every readable cabinet export in `dir`, in file-name order. Files that cannot be
/// read or lack the name/id columns are skipped; it is an error if none are usable.
pub fn load_cabinet_dir(dir: &Path) -> Result<CabinetMapping> {
    if !dir.is_dir() {
        bail!("Cabinet directory '{}' does not exist or is not a directory", dir.display());
    }
    let files = find_cabinet_files(dir).with_context(|| format!("Failed to list cabinet files in {}", dir.display()))?;

    let mut mapping = CabinetMapping::default();
    for file in &files {
        let grid = match read_cabinet_file(file) {
            Ok(Some(grid)) => grid,
            Ok(None) => {
                warn!("File '{}' has an unsupported format and was skipped.", file.display());
                continue;
            }
            Err(e) => {
                error!("Failed to read cabinet file '{}': {}", file.display(), e);
                continue;
            }
        };
        let (Some(name_col), Some(id_col)) = (grid.column(CABINET_NAME_COLUMN), grid.column(CABINET_ID_COLUMN)) else {
            error!(
                "File '{}' is missing columns: {}",
                file.display(),
                grid.missing_columns(&[CABINET_NAME_COLUMN, CABINET_ID_COLUMN]).join(", ")
            );
            continue;
        };
        let taken = mapping.absorb(&grid, name_col, id_col);
        mapping.files_loaded += 1;
        info!("Cabinet file '{}' read: {} mappings.", file.display(), taken);
    }

    if mapping.files_loaded == 0 {
        bail!("No cabinet file in {} could be read with valid data", dir.display());
    }
    info!(
        "Merged {} cabinet files: {} rows, {} distinct names.",
        mapping.files_loaded,
        mapping.rows_read,
        mapping.len()
    );
    Ok(mapping)
}
