use crate::lookup::DEFAULT_ENDPOINT;
use anyhow::{bail, Context, Result};
use log::info;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 100;

fn default_workbook() -> PathBuf {
    PathBuf::from("data").join("wb-ym.xlsx")
}
fn default_primary_sheet() -> String {
    "WB".to_string()
}
fn default_target_sheet() -> String {
    "YM".to_string()
}
fn default_delimiter() -> char {
    ','
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_cabinets_dir() -> PathBuf {
    PathBuf::from("data").join("cabinets")
}

/// Run configuration, usually read from `--config <yaml>`. Every field is optional.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub description: Option<String>,
    #[serde(default = "default_workbook")]
    pub workbook: PathBuf,
    #[serde(default = "default_primary_sheet")]
    pub primary_sheet: String,
    #[serde(default = "default_target_sheet")]
    pub target_sheet: String,
    /// Field delimiter when the workbook is a CSV file or a directory of CSV sheets.
    #[serde(default = "default_delimiter")]
    pub csv_delimiter: char,
    /// Maintain `YM_name` next to `YM_id`. Unset means on for lookups, off for cabinet runs.
    pub mirror_names: Option<bool>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    pub max_in_flight: Option<usize>,
    pub lookup: LookupConfig,
    pub reference: ReferenceConfig,
    #[serde(default = "default_cabinets_dir")]
    pub cabinets_dir: PathBuf,
    pub merge: MergeConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            description: None,
            workbook: default_workbook(),
            primary_sheet: default_primary_sheet(),
            target_sheet: default_target_sheet(),
            csv_delimiter: default_delimiter(),
            mirror_names: None,
            batch_size: default_batch_size(),
            max_in_flight: None,
            lookup: LookupConfig::default(),
            reference: ReferenceConfig::default(),
            cabinets_dir: default_cabinets_dir(),
            merge: MergeConfig::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LookupConfig {
    pub endpoint: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout_secs: 30,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
        }
    }
}

impl LookupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where the offline name -> id table lives. `path: None` means the run's workbook.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReferenceConfig {
    pub path: Option<PathBuf>,
    pub sheet: String,
    pub id_column: String,
    pub name_column: String,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            path: None,
            sheet: default_primary_sheet(),
            id_column: "subject_id".to_string(),
            name_column: "subject_name".to_string(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MergeConfig {
    pub products: PathBuf,
    pub items: PathBuf,
    pub output: PathBuf,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let data = PathBuf::from("data");
        Self {
            products: data.join("productsWBMarusya.csv"),
            items: data.join("48342725_МИ.csv"),
            output: data.join("merged.csv"),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading run configuration from: {}", path.display());
        let file = File::open(path)
            .with_context(|| format!("Failed to open run configuration file: {}", path.display()))?;
        let config: RunConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse run configuration YAML from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_in_flight == Some(0) {
            bail!("max_in_flight must be at least 1");
        }
        if !self.csv_delimiter.is_ascii() {
            bail!("csv_delimiter must be a single ASCII character, got '{}'", self.csv_delimiter);
        }
        Ok(())
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.csv_delimiter as u8
    }

    pub fn reference_path(&self) -> &Path {
        self.reference.path.as_deref().unwrap_or(&self.workbook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(&path, "description: nightly\nworkbook: /tmp/book.xlsx\nbatch_size: 25\nlookup:\n  timeout_secs: 5\n").unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.description.as_deref(), Some("nightly"));
        assert_eq!(config.workbook, PathBuf::from("/tmp/book.xlsx"));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.primary_sheet, "WB");
        assert_eq!(config.lookup.timeout(), Duration::from_secs(5));
        assert_eq!(config.lookup.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.reference_path(), Path::new("/tmp/book.xlsx"));
        assert_eq!(config.mirror_names, None);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(&path, "batch_size: 0\n").unwrap();
        assert!(RunConfig::load(&path).is_err());
        fs::write(&path, "batch_size: [oops\n").unwrap();
        assert!(RunConfig::load(&path).is_err());
        assert!(RunConfig::load(&dir.path().join("missing.yaml")).is_err());
    }

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config: RunConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, RunConfig::default());
    }
}
