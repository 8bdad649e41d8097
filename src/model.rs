use calamine::Data;
use std::fmt;

pub const PRIMARY_COLUMNS: [&str; 5] = ["parent_id", "parent_name", "subject_id", "subject_name", "YM_id"];
pub const TARGET_COLUMNS: [&str; 2] = ["last_id", "last_name"];
pub const YM_ID_HEADER: &str = "YM_id";
pub const YM_NAME_HEADER: &str = "YM_name";

/// Category identifier normalized from whatever the cell held (`101`, `101.0`, `" 101 "`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CategoryId(String);

impl CategoryId {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
            return None;
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 {
                return Some(Self(format!("{}", f as i64)));
            }
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn from_number(n: u64) -> Self {
        Self(n.to_string())
    }

    pub fn from_cell(cell: &CellValue) -> Option<Self> {
        match cell {
            CellValue::Empty => None,
            CellValue::Int(i) => Some(Self(i.to_string())),
            CellValue::Float(f) => Self::parse(&f.to_string()),
            CellValue::Text(s) => Self::parse(s),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric ids go back as numbers as long as their text survives the round trip.
    pub fn to_cell(&self) -> CellValue {
        if let Ok(i) = self.0.parse::<i64>() {
            return CellValue::Int(i);
        }
        match self.0.parse::<f64>() {
            Ok(f) if f.is_finite() && f.to_string() == self.0 => CellValue::Float(f),
            _ => CellValue::Text(self.0.clone()),
        }
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The subset of cell shapes the reconciler reads and writes.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Int(i64),
    Float(f64),
    Text(String),
}

impl CellValue {
    pub fn from_calamine(data: &Data) -> Self {
        match data {
            Data::Empty => CellValue::Empty,
            Data::Int(i) => CellValue::Int(*i),
            Data::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => CellValue::Int(*f as i64),
            Data::Float(f) => CellValue::Float(*f),
            Data::String(s) if s.is_empty() => CellValue::Empty,
            Data::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn from_text(raw: &str) -> Self {
        if raw.is_empty() { CellValue::Empty } else { CellValue::Text(raw.to_string()) }
    }

    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}

/// A header row plus data rows, as read from one sheet. `rows[i]` is sheet row `i + 2`.
#[derive(Debug, Clone, Default)]
pub struct SheetGrid {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl SheetGrid {
    pub fn column(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h.trim() == header)
    }

    pub fn missing_columns(&self, required: &[&str]) -> Vec<String> {
        required.iter().filter(|c| self.column(c).is_none()).map(|c| c.to_string()).collect()
    }

    pub fn cell(&self, row: usize, col: usize) -> &CellValue {
        const EMPTY: &CellValue = &CellValue::Empty;
        self.rows.get(row).and_then(|r| r.get(col)).unwrap_or(EMPTY)
    }
}

/// One marketplace category row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimaryRow {
    pub parent_id: Option<CategoryId>,
    pub parent_name: String,
    pub subject_id: Option<CategoryId>,
    pub subject_name: String,
    pub ym_id: Option<CategoryId>,
    pub ym_name: Option<String>,
}

impl PrimaryRow {
    pub fn is_matchable(&self) -> bool {
        self.subject_id.is_some() || self.parent_id.is_some()
    }

    /// Fine-grained id when present, otherwise the parent id.
    pub fn join_key(&self) -> Option<&CategoryId> {
        self.subject_id.as_ref().or(self.parent_id.as_ref())
    }
}

#[derive(Debug, Clone, Default)]
pub struct PrimaryTable {
    pub rows: Vec<PrimaryRow>,
    /// When set, `YM_name` is maintained next to `YM_id`.
    pub mirror_names: bool,
}

impl PrimaryTable {
    pub fn from_grid(grid: &SheetGrid, mirror_names: bool) -> Self {
        let col = |name: &str| grid.column(name);
        let (parent_id, parent_name, subject_id, subject_name, ym_id) =
            (col("parent_id"), col("parent_name"), col("subject_id"), col("subject_name"), col(YM_ID_HEADER));
        let ym_name = col(YM_NAME_HEADER);

        let id_at = |r: usize, c: Option<usize>| c.and_then(|c| CategoryId::from_cell(grid.cell(r, c)));
        let text_at = |r: usize, c: Option<usize>| c.map(|c| grid.cell(r, c).as_text()).unwrap_or_default();

        let rows = (0..grid.rows.len())
            .map(|r| PrimaryRow {
                parent_id: id_at(r, parent_id),
                parent_name: text_at(r, parent_name),
                subject_id: id_at(r, subject_id),
                subject_name: text_at(r, subject_name),
                ym_id: id_at(r, ym_id),
                ym_name: ym_name.map(|c| grid.cell(r, c).as_text()).filter(|s| !s.is_empty()),
            })
            .collect();
        Self { rows, mirror_names }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn matched_count(&self) -> usize {
        self.rows.iter().filter(|r| r.ym_id.is_some()).count()
    }

    pub fn ym_id_cells(&self) -> Vec<CellValue> {
        self.rows.iter().map(|r| r.ym_id.as_ref().map_or(CellValue::Empty, CategoryId::to_cell)).collect()
    }

    pub fn ym_name_cells(&self) -> Vec<CellValue> {
        self.rows.iter().map(|r| r.ym_name.as_deref().map_or(CellValue::Empty, CellValue::from_text)).collect()
    }
}

/// One row of the YM reference list.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetEntry {
    pub ym_id: CategoryId,
    pub ym_name: String,
}

pub fn targets_from_grid(grid: &SheetGrid) -> (Vec<TargetEntry>, usize) {
    let (Some(id_col), Some(name_col)) = (grid.column("last_id"), grid.column("last_name")) else {
        return (Vec::new(), grid.rows.len());
    };
    let mut skipped = 0;
    let targets = (0..grid.rows.len())
        .filter_map(|r| {
            let id = CategoryId::from_cell(grid.cell(r, id_col));
            let name = grid.cell(r, name_col).as_text().trim().to_string();
            match id {
                Some(ym_id) if !name.is_empty() => Some(TargetEntry { ym_id, ym_name: name }),
                _ => {
                    skipped += 1;
                    None
                }
            }
        })
        .collect();
    (targets, skipped)
}
