use crate::model::{CategoryId, SheetGrid};
use crate::store::{self, SheetRef};
use anyhow::{bail, Context, Result};
use csv::Writer;
use log::info;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const WB_COLUMNS: [&str; 3] = ["parent_id", "subject_id", "YM_id"];
const PRODUCT_COLUMNS: [&str; 2] = ["subjectID", "vendorCode"];
const ITEM_COLUMNS: [&str; 2] = ["Артикул", "Категория_YMid"];

#[derive(Debug, Clone)]
pub struct MergeInputs {
    pub workbook: SheetRef,
    pub products: PathBuf,
    pub items: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
struct CategoryRow {
    parent_id: String,
    subject_id: String,
    ym_id: String,
    join_key: Option<CategoryId>,
}

#[derive(Debug, Clone, PartialEq)]
struct ProductRow {
    subject_id: Option<CategoryId>,
    vendor_code: String,
}

#[derive(Debug, Clone, PartialEq)]
struct ItemRow {
    article: String,
    ym_id: String,
}

/// One line of the merged report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedRow {
    pub parent_id: String,
    pub subject_id: String,
    #[serde(rename = "YM_id")]
    pub ym_id: String,
    pub join_key: String,
    #[serde(rename = "subjectID")]
    pub product_subject_id: String,
    #[serde(rename = "vendorCode")]
    pub vendor_code: String,
    #[serde(rename = "Артикул")]
    pub article: String,
    #[serde(rename = "Категория_YMid")]
    pub article_ym_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub category_rows: usize,
    pub product_rows: usize,
    pub item_rows: usize,
    pub joined_with_products: usize,
    pub final_rows: usize,
}

fn require(grid: &SheetGrid, source: &Path, columns: &[&str]) -> Result<Vec<usize>> {
    let missing = grid.missing_columns(columns);
    if !missing.is_empty() {
        bail!(
            "{} is missing columns: {} (available: {})",
            source.display(),
            missing.join(", "),
            grid.headers.join(", ")
        );
    }
    Ok(columns.iter().filter_map(|c| grid.column(c)).collect())
}

fn text(grid: &SheetGrid, row: usize, col: usize) -> String {
    grid.cell(row, col).as_text().trim().to_string()
}

fn category_rows(grid: &SheetGrid, source: &Path) -> Result<Vec<CategoryRow>> {
    let cols = require(grid, source, &WB_COLUMNS)?;
    Ok((0..grid.rows.len())
        .map(|r| {
            let parent = CategoryId::from_cell(grid.cell(r, cols[0]));
            let subject = CategoryId::from_cell(grid.cell(r, cols[1]));
            CategoryRow {
                parent_id: parent.as_ref().map(ToString::to_string).unwrap_or_default(),
                subject_id: subject.as_ref().map(ToString::to_string).unwrap_or_default(),
                ym_id: text(grid, r, cols[2]),
                join_key: subject.or(parent),
            }
        })
        .collect())
}

fn product_rows(grid: &SheetGrid, source: &Path) -> Result<Vec<ProductRow>> {
    let cols = require(grid, source, &PRODUCT_COLUMNS)?;
    Ok((0..grid.rows.len())
        .map(|r| ProductRow {
            subject_id: CategoryId::from_cell(grid.cell(r, cols[0])),
            vendor_code: text(grid, r, cols[1]),
        })
        .collect())
}

fn item_rows(grid: &SheetGrid, source: &Path) -> Result<Vec<ItemRow>> {
    let cols = require(grid, source, &ITEM_COLUMNS)?;
    Ok((0..grid.rows.len())
        .map(|r| ItemRow { article: text(grid, r, cols[0]), ym_id: text(grid, r, cols[1]) })
        .collect())
}

/// Two inner joins: `join_key == subjectID`, then `vendorCode == Артикул`.
/// Output follows category row order, then product order, then item order.
fn join(categories: &[CategoryRow], products: &[ProductRow], items: &[ItemRow]) -> (Vec<MergedRow>, usize) {
    let mut products_by_subject: HashMap<&CategoryId, Vec<&ProductRow>> = HashMap::new();
    for product in products {
        if let Some(id) = &product.subject_id {
            products_by_subject.entry(id).or_default().push(product);
        }
    }
    let mut items_by_article: HashMap<&str, Vec<&ItemRow>> = HashMap::new();
    for item in items.iter().filter(|i| !i.article.is_empty()) {
        items_by_article.entry(item.article.as_str()).or_default().push(item);
    }

    let mut first_stage = 0;
    let mut merged = Vec::new();
    for category in categories {
        let Some(key) = &category.join_key else { continue };
        let Some(matched) = products_by_subject.get(key) else { continue };
        for product in matched {
            first_stage += 1;
            let Some(articles) = items_by_article.get(product.vendor_code.as_str()) else { continue };
            for item in articles {
                merged.push(MergedRow {
                    parent_id: category.parent_id.clone(),
                    subject_id: category.subject_id.clone(),
                    ym_id: category.ym_id.clone(),
                    join_key: key.to_string(),
                    product_subject_id: key.to_string(),
                    vendor_code: product.vendor_code.clone(),
                    article: item.article.clone(),
                    article_ym_id: item.ym_id.clone(),
                });
            }
        }
    }
    (merged, first_stage)
}

pub fn run_merge(inputs: &MergeInputs) -> Result<MergeSummary> {
    let wb_grid = store::read_sheet(&inputs.workbook)
        .with_context(|| format!("Failed to read category sheet {}", inputs.workbook.describe()))?;
    let categories = category_rows(&wb_grid, &inputs.workbook.path)?;
    info!("Category sheet {} read: {} rows.", inputs.workbook.describe(), categories.len());

    let products_grid = store::read_csv_grid(&inputs.products, b',', false)
        .with_context(|| format!("Failed to read products file {}", inputs.products.display()))?;
    let products = product_rows(&products_grid, &inputs.products)?;
    info!("Products file {} read: {} rows.", inputs.products.display(), products.len());

    let items_grid = store::read_csv_grid(&inputs.items, b';', true)
        .with_context(|| format!("Failed to read cabinet items file {}", inputs.items.display()))?;
    let items = item_rows(&items_grid, &inputs.items)?;
    info!("Cabinet items file {} read: {} rows.", inputs.items.display(), items.len());

    let (merged, joined_with_products) = join(&categories, &products, &items);
    info!("Categories joined with products: {} rows.", joined_with_products);
    info!("Final join with cabinet items: {} rows.", merged.len());

    write_report(&inputs.output, &merged)?;
    Ok(MergeSummary {
        category_rows: categories.len(),
        product_rows: products.len(),
        item_rows: items.len(),
        joined_with_products,
        final_rows: merged.len(),
    })
}

fn write_report(path: &Path, rows: &[MergedRow]) -> Result<()> {
    let mut writer =
        Writer::from_path(path).with_context(|| format!("Failed to create report file {}", path.display()))?;
    if rows.is_empty() {
        writer.write_record([
            "parent_id", "subject_id", "YM_id", "join_key", "subjectID", "vendorCode", "Артикул", "Категория_YMid",
        ])?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush().with_context(|| format!("Failed to flush report file {}", path.display()))?;
    info!("Merged report written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn category(parent: &str, subject: &str, ym: &str) -> CategoryRow {
        let parent_id = CategoryId::parse(parent);
        let subject_id = CategoryId::parse(subject);
        CategoryRow {
            parent_id: parent.into(),
            subject_id: subject.into(),
            ym_id: ym.into(),
            join_key: subject_id.or(parent_id),
        }
    }

    #[test]
    fn test_join_falls_back_to_parent_and_fans_out() {
        let categories = vec![category("1", "101", "55"), category("2", "", "60"), category("3", "", "")];
        let products = vec![
            ProductRow { subject_id: CategoryId::parse("101"), vendor_code: "A-1".into() },
            ProductRow { subject_id: CategoryId::parse("2.0"), vendor_code: "B-1".into() },
            ProductRow { subject_id: CategoryId::parse("101"), vendor_code: "A-2".into() },
        ];
        let items = vec![
            ItemRow { article: "A-1".into(), ym_id: "900".into() },
            ItemRow { article: "B-1".into(), ym_id: "901".into() },
            ItemRow { article: "A-1".into(), ym_id: "902".into() },
        ];

        let (merged, first_stage) = join(&categories, &products, &items);
        assert_eq!(first_stage, 3);
        let keys: Vec<(&str, &str, &str)> =
            merged.iter().map(|m| (m.join_key.as_str(), m.vendor_code.as_str(), m.article_ym_id.as_str())).collect();
        assert_eq!(keys, vec![("101", "A-1", "900"), ("101", "A-1", "902"), ("2", "B-1", "901")]);
        assert_eq!(merged[2].subject_id, "");
        assert_eq!(merged[2].ym_id, "60");
    }

    #[test]
    fn test_run_merge_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("WB.csv"), "parent_id,parent_name,subject_id,subject_name,YM_id\n1,Обувь,101,Кроссовки,55\n").unwrap();
        let products = dir.path().join("products.csv");
        fs::write(&products, "subjectID,vendorCode,price\n101,A-1,10\n999,Z-9,5\n").unwrap();
        let items = dir.path().join("items.csv");
        fs::write(&items, " Артикул ;Категория_YMid\nA-1;900\nbroken;line;here\n").unwrap();
        let output = dir.path().join("merged.csv");

        let summary = run_merge(&MergeInputs {
            workbook: SheetRef::new(dir.path(), "WB"),
            products,
            items,
            output: output.clone(),
        })
        .unwrap();
        assert_eq!(summary.final_rows, 1);
        assert_eq!(summary.item_rows, 1);

        let written = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "parent_id,subject_id,YM_id,join_key,subjectID,vendorCode,Артикул,Категория_YMid");
        assert_eq!(lines[1], "1,101,55,101,101,A-1,A-1,900");
    }

    #[test]
    fn test_missing_product_columns_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("WB.csv"), "parent_id,subject_id,YM_id\n1,101,55\n").unwrap();
        let products = dir.path().join("products.csv");
        fs::write(&products, "subject,vendor\n101,A-1\n").unwrap();
        let items = dir.path().join("items.csv");
        fs::write(&items, "Артикул;Категория_YMid\n").unwrap();

        let err = run_merge(&MergeInputs {
            workbook: SheetRef::new(dir.path(), "WB"),
            products,
            items,
            output: dir.path().join("out.csv"),
        })
        .unwrap_err();
        assert!(err.to_string().contains("subjectID"));
    }
}
