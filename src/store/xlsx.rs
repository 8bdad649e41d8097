//! Workbook access. Reads go through calamine; writes patch the one worksheet part in
//! place and copy every other package entry byte for byte.

use super::{persist_atomically, ColumnWrite, FlushReport, StoreError};
use crate::model::{CellValue, SheetGrid};
use calamine::{open_workbook_auto, Data, Range, Reader};
use quick_xml::escape::{partial_escape, unescape};
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader as XmlReader, Writer as XmlWriter};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const WORKBOOK: &str = "xl/workbook.xml";
const WORKBOOK_RELS: &str = "xl/_rels/workbook.xml.rels";
const SHARED_STRINGS: &str = "xl/sharedStrings.xml";
const CALC_CHAIN: &str = "xl/calcChain.xml";
const CONTENT_TYPES: &str = "[Content_Types].xml";

fn spreadsheet_err(path: &Path) -> impl FnOnce(calamine::Error) -> StoreError + '_ {
    move |source| StoreError::Spreadsheet { path: path.to_path_buf(), source }
}

fn xml_err<'a>(path: &'a Path, part: &'a str) -> impl FnOnce(quick_xml::Error) -> StoreError + 'a {
    move |source| StoreError::Xml { path: path.to_path_buf(), part: part.to_string(), source }
}

fn malformed(path: &Path, reason: impl Into<String>) -> StoreError {
    StoreError::Malformed { path: path.to_path_buf(), reason: reason.into() }
}

fn grid_from_range(range: &Range<Data>) -> SheetGrid {
    let Some((end_row, end_col)) = range.end() else {
        return SheetGrid::default();
    };
    let cell = |r: u32, c: u32| range.get_value((r, c)).map_or(CellValue::Empty, CellValue::from_calamine);
    let headers = (0..=end_col).map(|c| cell(0, c).as_text()).collect();
    let rows = (1..=end_row).map(|r| (0..=end_col).map(|c| cell(r, c)).collect()).collect();
    SheetGrid { headers, rows }
}

pub(super) fn read_sheet(path: &Path, sheet: &str) -> Result<SheetGrid, StoreError> {
    let mut workbook = open_workbook_auto(path).map_err(spreadsheet_err(path))?;
    if !workbook.sheet_names().iter().any(|n| n == sheet) {
        return Err(StoreError::MissingSheet { path: path.to_path_buf(), sheet: sheet.to_string() });
    }
    let range = workbook.worksheet_range(sheet).map_err(spreadsheet_err(path))?;
    Ok(grid_from_range(&range))
}

pub(super) fn read_first_sheet(path: &Path) -> Result<SheetGrid, StoreError> {
    let mut workbook = open_workbook_auto(path).map_err(spreadsheet_err(path))?;
    let first = workbook.sheet_names().first().cloned().ok_or_else(|| malformed(path, "workbook has no sheets"))?;
    let range = workbook.worksheet_range(&first).map_err(spreadsheet_err(path))?;
    Ok(grid_from_range(&range))
}

pub(super) fn write_columns(path: &Path, sheet: &str, write: &ColumnWrite) -> Result<FlushReport, StoreError> {
    let bytes = fs::read(path).map_err(StoreError::io(path))?;
    let zip_err = |source: ZipError| StoreError::Zip { path: path.to_path_buf(), source };
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_err)?;

    let part = sheet_part(&mut archive, path, sheet)?;
    let shared = match read_zip_entry(&mut archive, SHARED_STRINGS).map_err(zip_err)? {
        Some(xml) => parse_shared_strings(&xml).map_err(xml_err(path, SHARED_STRINGS))?,
        None => Vec::new(),
    };
    let sheet_xml = read_zip_entry(&mut archive, &part)
        .map_err(zip_err)?
        .ok_or_else(|| malformed(path, format!("worksheet part {} is missing", part)))?;

    let headers = header_cells(&sheet_xml, &shared).map_err(xml_err(path, &part))?;
    let find = |name: &str| headers.iter().find(|(_, h)| h.trim() == name).map(|(c, _)| *c);
    let anchor = find(&write.anchor).ok_or_else(|| StoreError::MissingColumns {
        path: path.to_path_buf(),
        sheet: sheet.to_string(),
        columns: vec![write.anchor.clone()],
    })?;

    let mut patch = SheetPatch::default();
    for (i, value) in write.values.iter().enumerate() {
        patch.set(i as u32 + 2, anchor, value.clone());
    }
    let mut inserted_companion = false;
    if let Some((name, values)) = &write.companion {
        let col = match find(name) {
            Some(col) => col,
            None => {
                inserted_companion = true;
                patch.insert_at = Some(anchor + 1);
                patch.set(1, anchor + 1, CellValue::Text(name.clone()));
                anchor + 1
            }
        };
        for (i, value) in values.iter().enumerate() {
            patch.set(i as u32 + 2, col, value.clone());
        }
    }

    let mut replacements: HashMap<String, Vec<u8>> = HashMap::new();
    if let Some(at) = patch.insert_at {
        if has_element(&sheet_xml, b"tablePart").map_err(xml_err(path, &part))? {
            return Err(StoreError::InsertBlocked {
                path: path.to_path_buf(),
                sheet: sheet.to_string(),
                reason: "the sheet has table parts whose ranges cannot be moved; add the column by hand".to_string(),
            });
        }
        let workbook = read_zip_entry(&mut archive, WORKBOOK)
            .map_err(zip_err)?
            .ok_or_else(|| malformed(path, format!("{} is missing", WORKBOOK)))?;
        if let Some(rewritten) = shift_defined_names(&workbook, sheet, at).map_err(xml_err(path, WORKBOOK))? {
            replacements.insert(WORKBOOK.to_string(), rewritten);
        }
    }
    let patched = patch_sheet_xml(&sheet_xml, patch).map_err(xml_err(path, &part))?;
    replacements.insert(part.clone(), patched);

    let drop_calc_chain = archive.file_names().any(|n| n == CALC_CHAIN);
    if drop_calc_chain {
        if let Some(xml) = read_zip_entry(&mut archive, CONTENT_TYPES).map_err(zip_err)? {
            let cleaned = drop_elements(&xml, is_calc_chain_override).map_err(xml_err(path, CONTENT_TYPES))?;
            replacements.insert(CONTENT_TYPES.to_string(), cleaned);
        }
        if let Some(xml) = read_zip_entry(&mut archive, WORKBOOK_RELS).map_err(zip_err)? {
            let cleaned = drop_elements(&xml, is_calc_chain_relationship).map_err(xml_err(path, WORKBOOK_RELS))?;
            replacements.insert(WORKBOOK_RELS.to_string(), cleaned);
        }
    }

    persist_atomically(path, |file| {
        let mut writer = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i).map_err(zip_err)?;
            let name = entry.name().to_string();
            if drop_calc_chain && name == CALC_CHAIN {
                continue;
            }
            match replacements.get(&name) {
                Some(bytes) => {
                    drop(entry);
                    writer.start_file(name.as_str(), options).map_err(zip_err)?;
                    writer.write_all(bytes).map_err(StoreError::io(path))?;
                }
                None => writer.raw_copy_file(entry).map_err(zip_err)?,
            }
        }
        writer.finish().map_err(zip_err)?;
        Ok(())
    })?;

    Ok(FlushReport { rows_written: write.values.len(), inserted_companion })
}

fn read_zip_entry<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Option<Vec<u8>>, ZipError> {
    match zip.by_name(name) {
        Ok(mut entry) => {
            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            Ok(Some(bytes))
        }
        Err(ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

fn sheet_part<R: Read + Seek>(archive: &mut ZipArchive<R>, path: &Path, sheet: &str) -> Result<String, StoreError> {
    let zip_err = |source: ZipError| StoreError::Zip { path: path.to_path_buf(), source };
    let workbook = read_zip_entry(archive, WORKBOOK)
        .map_err(zip_err)?
        .ok_or_else(|| malformed(path, format!("{} is missing", WORKBOOK)))?;
    let rel_id = sheet_relationship_id(&workbook, sheet)
        .map_err(xml_err(path, WORKBOOK))?
        .ok_or_else(|| StoreError::MissingSheet { path: path.to_path_buf(), sheet: sheet.to_string() })?;
    let rels = read_zip_entry(archive, WORKBOOK_RELS)
        .map_err(zip_err)?
        .ok_or_else(|| malformed(path, format!("{} is missing", WORKBOOK_RELS)))?;
    let targets = parse_relationships(&rels).map_err(xml_err(path, WORKBOOK_RELS))?;
    let target = targets
        .get(&rel_id)
        .ok_or_else(|| malformed(path, format!("relationship {} for sheet '{}' not found", rel_id, sheet)))?;
    Ok(resolve_part(target))
}

fn resolve_part(target: &str) -> String {
    let target = target.replace('\\', "/");
    match target.strip_prefix('/') {
        Some(absolute) => absolute.to_string(),
        None => format!("xl/{}", target),
    }
}

fn attr(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == key)
        .and_then(|a| attr_text(&a))
}

fn attr_text(a: &Attribute<'_>) -> Option<String> {
    unescape(&String::from_utf8_lossy(&a.value)).ok().map(|v| v.into_owned())
}

fn local_name(e: &BytesStart<'_>) -> Vec<u8> {
    e.local_name().as_ref().to_vec()
}

fn sheet_relationship_id(xml: &[u8], sheet: &str) -> quick_xml::Result<Option<String>> {
    let mut reader = XmlReader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"sheet" => {
                if attr(&e, b"name").as_deref() == Some(sheet) {
                    return Ok(attr(&e, b"id"));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

fn parse_relationships(xml: &[u8]) -> quick_xml::Result<HashMap<String, String>> {
    let mut reader = XmlReader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == b"Relationship" => {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    out.insert(id, target);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn parse_shared_strings(xml: &[u8]) -> quick_xml::Result<Vec<String>> {
    let mut reader = XmlReader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut current = String::new();
    let (mut in_text, mut in_phonetic) = (false, false);
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"rPh" => in_phonetic = true,
                b"t" => in_text = !in_phonetic,
                _ => {}
            },
            Event::Empty(e) if e.local_name().as_ref() == b"si" => out.push(String::new()),
            Event::Text(t) if in_text => current.push_str(&t.unescape()?),
            Event::End(e) => match e.local_name().as_ref() {
                b"si" => out.push(std::mem::take(&mut current)),
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Text of the cells in sheet row 1, keyed by 0-based column.
fn header_cells(xml: &[u8], shared: &[String]) -> quick_xml::Result<Vec<(u32, String)>> {
    let mut reader = XmlReader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut in_header = false;
    let mut last_row = 0u32;
    let mut cell: Option<(u32, Option<String>)> = None;
    let mut last_col: Option<u32> = None;
    let mut capture = false;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == b"row" => {
                let number = attr(&e, b"r").and_then(|r| r.parse().ok()).unwrap_or(last_row + 1);
                last_row = number;
                if number > 1 {
                    break;
                }
                in_header = number == 1;
            }
            Event::End(e) if e.local_name().as_ref() == b"row" && in_header => break,
            Event::Start(e) if in_header && e.local_name().as_ref() == b"c" => {
                let col = attr(&e, b"r")
                    .and_then(|r| parse_cell_ref(&r))
                    .map(|(c, _)| c)
                    .unwrap_or_else(|| last_col.map_or(0, |c| c + 1));
                last_col = Some(col);
                cell = Some((col, attr(&e, b"t")));
                text.clear();
            }
            Event::Empty(e) if in_header && e.local_name().as_ref() == b"c" => {
                last_col = attr(&e, b"r").and_then(|r| parse_cell_ref(&r)).map(|(c, _)| c).or(last_col.map(|c| c + 1));
            }
            Event::Start(e) if cell.is_some() && matches!(e.local_name().as_ref(), b"v" | b"t") => capture = true,
            Event::End(e) if matches!(e.local_name().as_ref(), b"v" | b"t") => capture = false,
            Event::Text(t) if capture => text.push_str(&t.unescape()?),
            Event::End(e) if e.local_name().as_ref() == b"c" => {
                if let Some((col, kind)) = cell.take() {
                    let value = match kind.as_deref() {
                        Some("s") => text.trim().parse::<usize>().ok().and_then(|i| shared.get(i).cloned()).unwrap_or_default(),
                        _ => text.clone(),
                    };
                    out.push((col, value));
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// Streams `xml` through, dropping every element (and its subtree) matched by `drop`.
fn drop_elements(xml: &[u8], dropped: fn(&BytesStart<'_>) -> bool) -> quick_xml::Result<Vec<u8>> {
    let mut reader = XmlReader::from_reader(xml);
    reader.trim_text(false);
    let mut writer = XmlWriter::new(Vec::new());
    let mut buf = Vec::new();
    let mut skip_depth = 0usize;
    loop {
        let event = reader.read_event_into(&mut buf)?;
        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => break,
                _ => {}
            }
        } else {
            match event {
                Event::Eof => break,
                Event::Start(ref e) if dropped(e) => skip_depth = 1,
                Event::Empty(ref e) if dropped(e) => {}
                other => writer.write_event(other)?,
            }
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

fn is_calc_chain_override(e: &BytesStart<'_>) -> bool {
    e.local_name().as_ref() == b"Override"
        && attr(e, b"PartName").is_some_and(|p| p.eq_ignore_ascii_case("/xl/calcChain.xml"))
}

fn is_calc_chain_relationship(e: &BytesStart<'_>) -> bool {
    if e.local_name().as_ref() != b"Relationship" {
        return false;
    }
    let by_type = attr(e, b"Type").is_some_and(|t| t.to_ascii_lowercase().contains("relationships/calcchain"));
    let by_target = attr(e, b"Target").is_some_and(|t| t.to_ascii_lowercase().ends_with("calcchain.xml"));
    by_type || by_target
}

/// `"AB12"` -> `(27, 12)`: 0-based column, 1-based row.
fn parse_cell_ref(raw: &str) -> Option<(u32, u32)> {
    let cleaned = raw.replace('$', "");
    let split = cleaned.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = cleaned.split_at(split);
    Some((column_index(letters)?, digits.parse().ok()?))
}

/// `"A"` -> 0, `"AB"` -> 27.
fn column_index(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut col = 0u32;
    for ch in letters.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        col = col * 26 + (ch.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
    }
    Some(col - 1)
}

fn column_letters(col: u32) -> String {
    let mut n = col + 1;
    let mut letters = Vec::new();
    while n > 0 {
        letters.push(char::from(b'A' + ((n - 1) % 26) as u8));
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn cell_ref(col: u32, row: u32) -> String {
    format!("{}{}", column_letters(col), row)
}

/// Moves one reference (`E2`, `$E$2`, `E:E` parts) right by a column when it sits at or past `at`.
fn shift_ref(raw: &str, at: u32) -> String {
    let (marker, rest) = match raw.strip_prefix('$') {
        Some(rest) => ("$", rest),
        None => ("", raw),
    };
    let split = rest.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(rest.len());
    let (letters, row) = rest.split_at(split);
    let row_ok = row.strip_prefix('$').unwrap_or(row).chars().all(|c| c.is_ascii_digit());
    match column_index(letters) {
        Some(col) if row_ok && col >= at => format!("{}{}{}", marker, column_letters(col + 1), row),
        _ => raw.to_string(),
    }
}

fn shift_range(raw: &str, at: u32) -> String {
    raw.split(' ')
        .map(|range| range.split(':').map(|r| shift_ref(r, at)).collect::<Vec<_>>().join(":"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Like [`shift_range`], and also grows the range to cover a column inserted past its end.
fn widen_dimension(raw: &str, at: u32) -> String {
    let shifted = shift_range(raw, at);
    match shifted.split_once(':') {
        Some((start, end)) => match parse_cell_ref(end) {
            Some((col, row)) if col < at => format!("{}:{}", start, cell_ref(at, row)),
            _ => shifted,
        },
        None => shifted,
    }
}

/// `<col min max>` spans are 1-based; a span covering the insert point absorbs the new column.
fn shift_col_span(min: u32, max: u32, at: u32) -> (u32, u32) {
    let inserted = at + 1;
    if min >= inserted {
        (min + 1, max + 1)
    } else if max >= inserted {
        (min, max + 1)
    } else {
        (min, max)
    }
}

enum AttrEdit {
    Keep,
    Replace(String),
    Drop,
}

fn rebuild(e: &BytesStart<'_>, mut edit: impl FnMut(&[u8], &str) -> AttrEdit) -> BytesStart<'static> {
    let mut out = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes().flatten() {
        let value = attr_text(&attr).unwrap_or_default();
        let decision = edit(attr.key.local_name().as_ref(), &value);
        match decision {
            AttrEdit::Keep => out.push_attribute(attr),
            AttrEdit::Replace(v) => out.push_attribute((attr.key.as_ref(), v.as_bytes())),
            AttrEdit::Drop => {}
        }
    }
    out
}

fn shift_attrs(e: &BytesStart<'_>, at: u32, keys: &[&[u8]]) -> BytesStart<'static> {
    rebuild(e, |k, v| if keys.contains(&k) { AttrEdit::Replace(shift_range(v, at)) } else { AttrEdit::Keep })
}

/// Worksheet elements outside `sheetData` that carry cell references.
fn shift_layout(e: BytesStart<'static>, at: u32) -> BytesStart<'static> {
    match local_name(&e).as_slice() {
        b"dimension" => rebuild(&e, |k, v| if k == b"ref" { AttrEdit::Replace(widen_dimension(v, at)) } else { AttrEdit::Keep }),
        b"mergeCell" | b"autoFilter" | b"sortState" | b"sortCondition" | b"hyperlink" => {
            shift_attrs(&e, at, &[b"ref".as_slice()])
        }
        b"conditionalFormatting" | b"dataValidation" | b"protectedRange" | b"ignoredError" => {
            shift_attrs(&e, at, &[b"sqref".as_slice()])
        }
        b"selection" => shift_attrs(&e, at, &[b"sqref".as_slice(), b"activeCell".as_slice()]),
        b"pane" => shift_attrs(&e, at, &[b"topLeftCell".as_slice()]),
        b"col" => {
            let span = attr(&e, b"min").and_then(|v| v.parse().ok()).zip(attr(&e, b"max").and_then(|v| v.parse().ok()));
            let Some((min, max)) = span else {
                return e;
            };
            let (min, max) = shift_col_span(min, max, at);
            rebuild(&e, |k, _| match k {
                b"min" => AttrEdit::Replace(min.to_string()),
                b"max" => AttrEdit::Replace(max.to_string()),
                _ => AttrEdit::Keep,
            })
        }
        _ => e,
    }
}

/// Shifts references qualified with `sheet` (`WB!$A$1:$F$4`, `'My WB'!E:E`) inside a formula.
/// Unqualified references and other sheets are left alone.
fn shift_sheet_refs(formula: &str, sheet: &str, at: u32) -> String {
    let prefixes = [format!("'{}'!", sheet.replace('\'', "''")), format!("{}!", sheet)];
    let mut out = String::with_capacity(formula.len() + 4);
    let mut i = 0;
    while i < formula.len() {
        let rest = &formula[i..];
        let boundary = formula[..i].chars().last().map_or(true, |c| !(c.is_alphanumeric() || matches!(c, '_' | '.' | '\'')));
        match prefixes.iter().find(|p| boundary && rest.starts_with(p.as_str())) {
            Some(prefix) => {
                let body = &rest[prefix.len()..];
                let len = body.find(|c: char| !(c.is_ascii_alphanumeric() || c == '$' || c == ':')).unwrap_or(body.len());
                out.push_str(prefix);
                out.push_str(&body[..len].split(':').map(|r| shift_ref(r, at)).collect::<Vec<_>>().join(":"));
                i += prefix.len() + len;
            }
            None => {
                let Some(ch) = rest.chars().next() else { break };
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    out
}

/// Rewrites `<definedName>` formulas of `workbook.xml` that point into `sheet`; `None` when none do.
fn shift_defined_names(xml: &[u8], sheet: &str, at: u32) -> quick_xml::Result<Option<Vec<u8>>> {
    let mut reader = XmlReader::from_reader(xml);
    reader.trim_text(false);
    let mut writer = XmlWriter::new(Vec::new());
    let mut buf = Vec::new();
    let (mut in_name, mut changed) = (false, false);
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Eof => break,
            Event::Start(e) => {
                in_name = e.local_name().as_ref() == b"definedName";
                writer.write_event(Event::Start(e))?;
            }
            Event::End(e) => {
                in_name = false;
                writer.write_event(Event::End(e))?;
            }
            Event::Text(t) if in_name => {
                let formula = t.unescape()?.into_owned();
                let shifted = shift_sheet_refs(&formula, sheet, at);
                if shifted == formula {
                    writer.write_event(Event::Text(t))?;
                } else {
                    changed = true;
                    writer.write_event(Event::Text(BytesText::from_escaped(partial_escape(&shifted))))?;
                }
            }
            other => writer.write_event(other)?,
        }
        buf.clear();
    }
    Ok(changed.then(|| writer.into_inner()))
}

fn has_element(xml: &[u8], name: &[u8]) -> quick_xml::Result<bool> {
    let mut reader = XmlReader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.local_name().as_ref() == name => return Ok(true),
            Event::Eof => return Ok(false),
            _ => {}
        }
        buf.clear();
    }
}

/// Cell edits for one worksheet, in post-insert coordinates.
#[derive(Debug, Default)]
struct SheetPatch {
    /// 0-based column where a new column is inserted; existing cells at or past it move right.
    insert_at: Option<u32>,
    /// Sheet row (1-based) -> column (0-based) -> value.
    edits: BTreeMap<u32, BTreeMap<u32, CellValue>>,
}

impl SheetPatch {
    fn set(&mut self, row: u32, col: u32, value: CellValue) {
        self.edits.entry(row).or_default().insert(col, value);
    }
}

struct OpenRow {
    number: u32,
    edits: BTreeMap<u32, CellValue>,
    last_col: Option<u32>,
}

struct Patcher {
    out: XmlWriter<Vec<u8>>,
    insert_at: Option<u32>,
    pending: BTreeMap<u32, BTreeMap<u32, CellValue>>,
    prefix: String,
    in_sheet_data: bool,
    last_row: u32,
    row: Option<OpenRow>,
    /// First column of the open `autoFilter`; `filterColumn colId` is relative to it.
    filter_start: Option<u32>,
    in_sqref_text: bool,
}

impl Patcher {
    fn new(patch: SheetPatch) -> Self {
        Self {
            out: XmlWriter::new(Vec::new()),
            insert_at: patch.insert_at,
            pending: patch.edits,
            prefix: String::new(),
            in_sheet_data: false,
            last_row: 0,
            row: None,
            filter_start: None,
            in_sqref_text: false,
        }
    }

    fn emit(&mut self, event: Event<'_>) -> quick_xml::Result<()> {
        self.out.write_event(event)
    }

    fn shift(&self, col: u32) -> u32 {
        match self.insert_at {
            Some(at) if col >= at => col + 1,
            _ => col,
        }
    }

    fn enter_sheet_data(&mut self, e: &BytesStart<'_>) {
        let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
        self.prefix = name.strip_suffix("sheetData").unwrap_or_default().to_string();
        self.in_sheet_data = true;
    }

    fn write_cell(&mut self, row: u32, col: u32, style: Option<&str>, value: &CellValue) -> quick_xml::Result<()> {
        let name = format!("{}c", self.prefix);
        let mut start = BytesStart::new(name.clone());
        let reference = cell_ref(col, row);
        start.push_attribute(("r", reference.as_str()));
        if let Some(style) = style {
            start.push_attribute(("s", style));
        }
        match value {
            CellValue::Empty => self.emit(Event::Empty(start)),
            CellValue::Int(_) | CellValue::Float(_) => {
                self.emit(Event::Start(start))?;
                self.text_element("v", &value.as_text(), false)?;
                self.emit(Event::End(BytesEnd::new(name)))
            }
            CellValue::Text(text) => {
                start.push_attribute(("t", "inlineStr"));
                self.emit(Event::Start(start))?;
                let is = format!("{}is", self.prefix);
                self.emit(Event::Start(BytesStart::new(is.clone())))?;
                let padded = text.trim() != text;
                self.text_element("t", text, padded)?;
                self.emit(Event::End(BytesEnd::new(is)))?;
                self.emit(Event::End(BytesEnd::new(name)))
            }
        }
    }

    fn text_element(&mut self, local: &str, text: &str, preserve_space: bool) -> quick_xml::Result<()> {
        let name = format!("{}{}", self.prefix, local);
        let mut start = BytesStart::new(name.clone());
        if preserve_space {
            start.push_attribute(("xml:space", "preserve"));
        }
        self.emit(Event::Start(start))?;
        self.emit(Event::Text(BytesText::new(text)))?;
        self.emit(Event::End(BytesEnd::new(name)))
    }

    fn write_new_row(&mut self, number: u32, cells: BTreeMap<u32, CellValue>) -> quick_xml::Result<()> {
        if cells.values().all(CellValue::is_empty) {
            return Ok(());
        }
        let name = format!("{}row", self.prefix);
        let mut start = BytesStart::new(name.clone());
        start.push_attribute(("r", number.to_string().as_str()));
        self.emit(Event::Start(start))?;
        for (col, value) in cells.iter().filter(|(_, v)| !v.is_empty()) {
            self.write_cell(number, *col, None, value)?;
        }
        self.emit(Event::End(BytesEnd::new(name)))
    }

    fn flush_rows_before(&mut self, number: u32) -> quick_xml::Result<()> {
        let due: Vec<u32> = self.pending.range(..number).map(|(r, _)| *r).collect();
        for r in due {
            if let Some(cells) = self.pending.remove(&r) {
                self.write_new_row(r, cells)?;
            }
        }
        Ok(())
    }

    fn flush_all_rows(&mut self) -> quick_xml::Result<()> {
        let rows = std::mem::take(&mut self.pending);
        for (r, cells) in rows {
            self.write_new_row(r, cells)?;
        }
        Ok(())
    }

    fn open_row(&mut self, e: BytesStart<'static>, self_closing: bool) -> quick_xml::Result<()> {
        let number = attr(&e, b"r").and_then(|r| r.parse().ok()).unwrap_or(self.last_row + 1);
        self.flush_rows_before(number)?;
        self.last_row = number;
        let edits = self.pending.remove(&number).unwrap_or_default();
        let start = if self.insert_at.is_some() || !edits.is_empty() {
            rebuild(&e, |k, _| if k == b"spans" { AttrEdit::Drop } else { AttrEdit::Keep })
        } else {
            e
        };

        if self_closing && edits.values().all(CellValue::is_empty) {
            return self.emit(Event::Empty(start));
        }
        let end = start.to_end().into_owned();
        self.emit(Event::Start(start))?;
        self.row = Some(OpenRow { number, edits, last_col: None });
        if self_closing {
            return self.close_row(end);
        }
        Ok(())
    }

    fn close_row(&mut self, end: BytesEnd<'static>) -> quick_xml::Result<()> {
        if let Some(row) = self.row.take() {
            for (col, value) in row.edits.iter().filter(|(_, v)| !v.is_empty()) {
                self.write_cell(row.number, *col, None, value)?;
            }
        }
        self.emit(Event::End(end))
    }

    fn finish_cell(
        &mut self,
        start: BytesStart<'static>,
        children: Vec<Event<'static>>,
        end: Option<BytesEnd<'static>>,
    ) -> quick_xml::Result<()> {
        let Some(mut row) = self.row.take() else {
            return self.replay(start, children, end);
        };
        let original = attr(&start, b"r").and_then(|r| parse_cell_ref(&r)).map(|(c, _)| c);
        let col = match original {
            Some(c) => self.shift(c),
            None => row.last_col.map_or(0, |c| c + 1),
        };
        row.last_col = Some(col);

        let earlier: Vec<u32> = row.edits.range(..col).map(|(c, _)| *c).collect();
        for c in earlier {
            if let Some(value) = row.edits.remove(&c).filter(|v| !v.is_empty()) {
                self.write_cell(row.number, c, None, &value)?;
            }
        }

        let result = match row.edits.remove(&col) {
            Some(value) => {
                let style = attr(&start, b"s");
                self.write_cell(row.number, col, style.as_deref(), &value)
            }
            None => {
                let children = self.shift_formula_refs(children);
                let start = match original {
                    Some(c) if c != col => {
                        let moved = cell_ref(col, row.number);
                        rebuild(&start, |k, _| if k == b"r" { AttrEdit::Replace(moved.clone()) } else { AttrEdit::Keep })
                    }
                    _ => start,
                };
                self.replay(start, children, end)
            }
        };
        self.row = Some(row);
        result
    }

    fn replay(
        &mut self,
        start: BytesStart<'static>,
        children: Vec<Event<'static>>,
        end: Option<BytesEnd<'static>>,
    ) -> quick_xml::Result<()> {
        let Some(end) = end else {
            return self.emit(Event::Empty(start));
        };
        self.emit(Event::Start(start))?;
        for event in children {
            self.emit(event)?;
        }
        self.emit(Event::End(end))
    }

    fn emit_other(&mut self, e: BytesStart<'static>, self_closing: bool) -> quick_xml::Result<()> {
        let Some(at) = self.insert_at else {
            return self.emit(if self_closing { Event::Empty(e) } else { Event::Start(e) });
        };
        let e = match local_name(&e).as_slice() {
            b"autoFilter" => {
                if !self_closing {
                    self.filter_start = attr(&e, b"ref")
                        .and_then(|r| parse_cell_ref(r.split(':').next().unwrap_or_default()))
                        .map(|(c, _)| c);
                }
                shift_layout(e, at)
            }
            b"filterColumn" => match self.filter_start {
                Some(start) if start < at => rebuild(&e, |k, v| match (k, v.parse::<u32>()) {
                    (b"colId", Ok(id)) if start + id >= at => AttrEdit::Replace((id + 1).to_string()),
                    _ => AttrEdit::Keep,
                }),
                _ => e,
            },
            b"sqref" => {
                self.in_sqref_text = !self_closing;
                e
            }
            _ => shift_layout(e, at),
        };
        self.emit(if self_closing { Event::Empty(e) } else { Event::Start(e) })
    }

    fn emit_end(&mut self, e: BytesEnd<'static>) -> quick_xml::Result<()> {
        match e.local_name().as_ref() {
            b"autoFilter" => self.filter_start = None,
            b"sqref" => self.in_sqref_text = false,
            _ => {}
        }
        self.emit(Event::End(e))
    }

    /// `<xm:sqref>` bodies of extension conditional formats and validations.
    fn emit_text(&mut self, t: BytesText<'static>) -> quick_xml::Result<()> {
        match self.insert_at {
            Some(at) if self.in_sqref_text => {
                let shifted = shift_range(&t.unescape()?, at);
                self.emit(Event::Text(BytesText::new(&shifted)))
            }
            _ => self.emit(Event::Text(t)),
        }
    }

    /// Shared and array formulas name the range they cover in `<f ref>`.
    fn shift_formula_refs(&self, children: Vec<Event<'static>>) -> Vec<Event<'static>> {
        let Some(at) = self.insert_at else {
            return children;
        };
        children
            .into_iter()
            .map(|event| match event {
                Event::Start(e) if local_name(&e) == b"f" => Event::Start(shift_attrs(&e, at, &[b"ref".as_slice()])),
                Event::Empty(e) if local_name(&e) == b"f" => Event::Empty(shift_attrs(&e, at, &[b"ref".as_slice()])),
                other => other,
            })
            .collect()
    }
}

/// Applies `patch` to one worksheet document. Everything outside the edited cells, the
/// shifted references and dropped row `spans` is re-emitted unchanged.
fn patch_sheet_xml(xml: &[u8], patch: SheetPatch) -> quick_xml::Result<Vec<u8>> {
    let mut reader = XmlReader::from_reader(xml);
    reader.trim_text(false);
    let mut p = Patcher::new(patch);
    let mut buf = Vec::new();
    let mut cell: Option<(BytesStart<'static>, Vec<Event<'static>>)> = None;

    loop {
        let event = reader.read_event_into(&mut buf)?.into_owned();
        buf.clear();

        if let Some((start, mut children)) = cell.take() {
            match event {
                Event::End(end) if end.local_name().as_ref() == b"c" => p.finish_cell(start, children, Some(end))?,
                Event::Eof => break,
                other => {
                    children.push(other);
                    cell = Some((start, children));
                }
            }
            continue;
        }

        match event {
            Event::Eof => break,
            Event::Start(e) => match local_name(&e).as_slice() {
                b"sheetData" => {
                    p.enter_sheet_data(&e);
                    p.emit(Event::Start(e))?;
                }
                b"row" if p.in_sheet_data => p.open_row(e, false)?,
                b"c" if p.row.is_some() => cell = Some((e, Vec::new())),
                _ => p.emit_other(e, false)?,
            },
            Event::Empty(e) => match local_name(&e).as_slice() {
                b"sheetData" => {
                    p.enter_sheet_data(&e);
                    let end = e.to_end().into_owned();
                    p.emit(Event::Start(e))?;
                    p.flush_all_rows()?;
                    p.in_sheet_data = false;
                    p.emit(Event::End(end))?;
                }
                b"row" if p.in_sheet_data => p.open_row(e, true)?,
                b"c" if p.row.is_some() => p.finish_cell(e, Vec::new(), None)?,
                _ => p.emit_other(e, true)?,
            },
            Event::End(e) => match e.local_name().as_ref().to_vec().as_slice() {
                b"row" if p.row.is_some() => p.close_row(e)?,
                b"sheetData" => {
                    p.flush_all_rows()?;
                    p.in_sheet_data = false;
                    p.emit(Event::End(e))?;
                }
                _ => p.emit_end(e)?,
            },
            Event::Text(t) => p.emit_text(t)?,
            other => p.emit(other)?,
        }
    }
    Ok(p.out.into_inner())
}
