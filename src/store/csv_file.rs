use super::{persist_atomically, ColumnWrite, FlushReport, StoreError};
use crate::model::{CellValue, SheetGrid};
use csv::{ReaderBuilder, WriterBuilder};
use log::debug;
use std::fs;
use std::io::Write;
use std::path::Path;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> StoreError + '_ {
    move |source| StoreError::Csv { path: path.to_path_buf(), source }
}

/// Raw records of a delimited file, header included, and whether it began with a UTF-8 BOM.
fn read_records(path: &Path, delimiter: u8, skip_malformed: bool) -> Result<(Vec<Vec<String>>, bool), StoreError> {
    let bytes = fs::read(path).map_err(StoreError::io(path))?;
    let bom = bytes.starts_with(UTF8_BOM);
    let body = if bom { &bytes[UTF8_BOM.len()..] } else { &bytes[..] };
    let mut reader = ReaderBuilder::new().delimiter(delimiter).has_headers(false).flexible(true).from_reader(body);

    let mut records: Vec<Vec<String>> = Vec::new();
    let mut skipped = 0;
    for result in reader.records() {
        let record = match result {
            Ok(r) => r,
            Err(e) if skip_malformed => {
                skipped += 1;
                debug!("Skipping unreadable line in {}: {}", path.display(), e);
                continue;
            }
            Err(e) => return Err(csv_err(path)(e)),
        };
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        if records.is_empty() {
            if let Some(first) = fields.first_mut() {
                *first = first.trim_start_matches('\u{feff}').to_string();
            }
        } else if skip_malformed && fields.len() > records[0].len() {
            skipped += 1;
            continue;
        }
        records.push(fields);
    }
    if skipped > 0 {
        debug!("Skipped {} malformed lines in {}", skipped, path.display());
    }
    Ok((records, bom))
}

/// Reads a delimited file; row 1 is the header. With `skip_malformed`, lines with more
/// fields than the header are dropped.
pub fn read_csv_grid(path: &Path, delimiter: u8, skip_malformed: bool) -> Result<SheetGrid, StoreError> {
    let mut records = read_records(path, delimiter, skip_malformed)?.0.into_iter();
    let headers = records.next().unwrap_or_default();
    let rows = records.map(|r| r.iter().map(|f| CellValue::from_text(f)).collect()).collect();
    Ok(SheetGrid { headers, rows })
}

fn set_field(record: &mut Vec<String>, col: usize, value: String) {
    if record.len() <= col {
        record.resize(col + 1, String::new());
    }
    record[col] = value;
}

pub(super) fn write_columns(
    path: &Path,
    delimiter: u8,
    sheet: &str,
    write: &ColumnWrite,
) -> Result<FlushReport, StoreError> {
    let (mut records, bom) = read_records(path, delimiter, false)?;
    let header = records.first().ok_or_else(|| StoreError::Malformed {
        path: path.to_path_buf(),
        reason: "file has no header row".to_string(),
    })?;
    let anchor = header.iter().position(|h| h.trim() == write.anchor).ok_or_else(|| StoreError::MissingColumns {
        path: path.to_path_buf(),
        sheet: sheet.to_string(),
        columns: vec![write.anchor.clone()],
    })?;

    let mut inserted_companion = false;
    let companion = match &write.companion {
        None => None,
        Some((name, values)) => {
            let col = match header.iter().position(|h| h.trim() == name) {
                Some(col) => col,
                None => {
                    let col = anchor + 1;
                    for (i, record) in records.iter_mut().enumerate() {
                        if i == 0 {
                            record.insert(col.min(record.len()), name.clone());
                        } else if record.len() > col {
                            record.insert(col, String::new());
                        }
                    }
                    inserted_companion = true;
                    col
                }
            };
            Some((col, values))
        }
    };

    for (i, value) in write.values.iter().enumerate() {
        while records.len() <= i + 1 {
            records.push(Vec::new());
        }
        set_field(&mut records[i + 1], anchor, value.as_text());
        if let Some((col, values)) = &companion {
            let name = values.get(i).map(CellValue::as_text).unwrap_or_default();
            set_field(&mut records[i + 1], *col, name);
        }
    }

    persist_atomically(path, |file| {
        if bom {
            file.write_all(UTF8_BOM).map_err(StoreError::io(path))?;
        }
        let mut writer = WriterBuilder::new().delimiter(delimiter).flexible(true).from_writer(file);
        for record in &records {
            writer.write_record(record).map_err(csv_err(path))?;
        }
        writer.flush().map_err(StoreError::io(path))
    })?;

    Ok(FlushReport { rows_written: write.values.len(), inserted_companion })
}

#[cfg(test)]
mod tests {
    use super::super::tests::PRIMARY_CSV;
    use super::super::{flush, load_primary, SheetRef};
    use super::*;
    use crate::model::CategoryId;
    use std::fs;

    #[test]
    fn test_flush_writes_only_output_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wb.csv");
        fs::write(&path, PRIMARY_CSV).unwrap();
        let sheet = SheetRef::new(&path, "WB");

        let mut table = load_primary(&sheet, false).unwrap();
        table.rows[0].ym_id = CategoryId::parse("55");
        let report = flush(&sheet, &table).unwrap();
        assert_eq!(report, FlushReport { rows_written: 3, inserted_companion: false });

        let written = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "parent_id,parent_name,subject_id,subject_name,YM_id,comment");
        assert_eq!(lines[1], "1,Обувь,101,Кроссовки,55,keep me");
        assert_eq!(lines[2], "1,Обувь,202,Ботинки,,\"quoted, value\"");
    }

    #[test]
    fn test_flush_inserts_name_column_after_ym_id_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wb.csv");
        fs::write(&path, PRIMARY_CSV).unwrap();
        let sheet = SheetRef::new(&path, "WB");

        let mut table = load_primary(&sheet, true).unwrap();
        table.rows[1].ym_id = CategoryId::parse("56");
        table.rows[1].ym_name = Some("Boots".into());
        assert!(flush(&sheet, &table).unwrap().inserted_companion);
        assert!(!flush(&sheet, &table).unwrap().inserted_companion);

        let grid = read_csv_grid(&path, b',', false).unwrap();
        assert_eq!(grid.headers, vec!["parent_id", "parent_name", "subject_id", "subject_name", "YM_id", "YM_name", "comment"]);
        assert_eq!(grid.cell(1, 5), &CellValue::Text("Boots".into()));
        assert_eq!(grid.cell(1, 6), &CellValue::Text("quoted, value".into()));
        assert_eq!(grid.cell(0, 6), &CellValue::Text("keep me".into()));
    }

    #[test]
    fn test_flush_keeps_byte_order_mark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wb.csv");
        fs::write(&path, format!("\u{feff}{}", PRIMARY_CSV)).unwrap();
        let sheet = SheetRef::new(&path, "WB");

        let mut table = load_primary(&sheet, false).unwrap();
        table.rows[0].ym_id = CategoryId::parse("55");
        flush(&sheet, &table).unwrap();

        let written = fs::read(&path).unwrap();
        assert!(written.starts_with(b"\xEF\xBB\xBFparent_id,"));
        assert!(!written[3..].starts_with(b"\xEF\xBB\xBF"));
        assert_eq!(read_csv_grid(&path, b',', false).unwrap().headers[0], "parent_id");

        let plain = dir.path().join("plain.csv");
        fs::write(&plain, PRIMARY_CSV).unwrap();
        flush(&SheetRef::new(&plain, "WB"), &table).unwrap();
        assert!(fs::read(&plain).unwrap().starts_with(b"parent_id,"));
    }

    #[test]
    fn test_flush_rereads_file_and_keeps_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wb.csv");
        fs::write(&path, PRIMARY_CSV).unwrap();
        let sheet = SheetRef::new(&path, "WB");
        let mut table = load_primary(&sheet, false).unwrap();

        let edited = PRIMARY_CSV.replace("keep me", "edited outside");
        fs::write(&path, edited).unwrap();
        table.rows[0].ym_id = CategoryId::parse("55");
        flush(&sheet, &table).unwrap();

        let grid = read_csv_grid(&path, b',', false).unwrap();
        assert_eq!(grid.cell(0, 5), &CellValue::Text("edited outside".into()));
        assert_eq!(grid.cell(0, 4), &CellValue::Text("55".into()));
    }

    #[test]
    fn test_flush_without_anchor_column_fails_and_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wb.csv");
        let original = "parent_id,subject_id\n1,101\n";
        fs::write(&path, original).unwrap();
        let table = crate::model::PrimaryTable::default();
        let result = flush(&SheetRef::new(&path, "WB"), &table);
        assert!(matches!(result, Err(StoreError::MissingColumns { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_semicolon_file_skips_overlong_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cab.csv");
        fs::write(&path, "\u{feff}Категория_YMname;Категория_YMid\nОбувь;500\nbad;line;extra\nСумки;600\n").unwrap();
        let grid = read_csv_grid(&path, b';', true).unwrap();
        assert_eq!(grid.headers[0], "Категория_YMname");
        assert_eq!(grid.rows.len(), 2);
        assert_eq!(grid.cell(1, 1), &CellValue::Text("600".into()));
    }
}
