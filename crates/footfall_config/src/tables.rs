//! Per-table ETL rules.

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Partition columns the loader knows how to derive.
pub const SUPPORTED_PARTITIONS: &[&str] = &["year", "month"];

/// One cleaning rule: apply `action` to `column` (named in source form).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleaningRule {
    pub column: String,
    pub action: String,
}

/// How a single source table lands in the analytical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub source_table: String,
    pub dest_table: String,
    #[serde(default = "default_incremental")]
    pub incremental: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_processing_order")]
    pub processing_order: i32,
    #[serde(default)]
    pub rename_map: BTreeMap<String, String>,
    #[serde(default)]
    pub partition_cols: Vec<String>,
    #[serde(default)]
    pub cleaning_rules: Vec<CleaningRule>,
    #[serde(default)]
    pub timestamp_col: Option<String>,
}

fn default_incremental() -> bool {
    true
}

fn default_processing_order() -> i32 {
    99
}

impl TableConfig {
    /// Column name after `rename_map` is applied.
    pub fn final_name<'a>(&'a self, source_col: &'a str) -> &'a str {
        self.rename_map
            .get(source_col)
            .map(String::as_str)
            .unwrap_or(source_col)
    }

    /// Timestamp column in post-rename form.
    pub fn final_timestamp_col(&self) -> Option<&str> {
        self.timestamp_col.as_deref().map(|col| self.final_name(col))
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partition_cols.is_empty()
    }

    fn validate(&self, logical_name: &str, errors: &mut Vec<String>) {
        if self.source_table.trim().is_empty() {
            errors.push(format!("table '{}': source_table is empty", logical_name));
        } else if !is_source_identifier(&self.source_table) {
            errors.push(format!(
                "table '{}': source_table '{}' must match [A-Za-z0-9_.]+",
                logical_name, self.source_table
            ));
        }

        if !is_identifier(&self.dest_table) {
            errors.push(format!(
                "table '{}': dest_table '{}' must match [A-Za-z0-9_]+",
                logical_name, self.dest_table
            ));
        }

        if self.incremental && self.timestamp_col.is_none() {
            errors.push(format!(
                "table '{}': timestamp_col is required when incremental is true",
                logical_name
            ));
        }

        if let Some(col) = &self.timestamp_col {
            if !is_identifier(col) {
                errors.push(format!(
                    "table '{}': timestamp_col '{}' must match [A-Za-z0-9_]+",
                    logical_name, col
                ));
            }
        }

        for col in &self.partition_cols {
            if !SUPPORTED_PARTITIONS.contains(&col.as_str()) {
                errors.push(format!(
                    "table '{}': unsupported partition column '{}' (supported: {})",
                    logical_name,
                    col,
                    SUPPORTED_PARTITIONS.join(", ")
                ));
            }
        }
        if self.is_partitioned() && self.timestamp_col.is_none() {
            errors.push(format!(
                "table '{}': partition_cols require a timestamp_col",
                logical_name
            ));
        }
    }
}

/// `[A-Za-z0-9_]+`
pub fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Identifier optionally qualified by schema, e.g. `dbo.num_crowd`.
pub fn is_source_identifier(name: &str) -> bool {
    name.split('.').all(is_identifier)
}

/// Ordered mapping of logical table name to its rules.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSet {
    entries: Vec<(String, TableConfig)>,
}

impl TableSet {
    pub fn new(entries: Vec<(String, TableConfig)>) -> Self {
        Self { entries }
    }

    /// Parse the YAML mapping `logical_name -> TableConfig`, keeping file order.
    pub fn from_yaml_str(raw: &str, path: &Path) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(ConfigError::invalid(format!(
                "table config {} is empty",
                path.display()
            )));
        }
        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::TableFileParse {
                path: path.to_path_buf(),
                source,
            })?;

        let mapping = match value {
            serde_yaml::Value::Mapping(mapping) => mapping,
            serde_yaml::Value::Null => {
                return Err(ConfigError::invalid(format!(
                    "table config {} is empty",
                    path.display()
                )))
            }
            _ => {
                return Err(ConfigError::invalid(format!(
                    "table config {} must be a mapping of table name to settings",
                    path.display()
                )))
            }
        };

        let mut entries = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let name = key.as_str().map(str::to_string).ok_or_else(|| {
                ConfigError::invalid(format!(
                    "table config {}: table names must be strings",
                    path.display()
                ))
            })?;
            let config: TableConfig =
                serde_yaml::from_value(value).map_err(|source| ConfigError::TableFileParse {
                    path: path.to_path_buf(),
                    source,
                })?;
            entries.push((name, config));
        }

        if entries.is_empty() {
            return Err(ConfigError::invalid(format!(
                "table config {} is empty",
                path.display()
            )));
        }

        Ok(Self { entries })
    }

    /// Read the YAML file at `path`; `Ok(None)` when it does not exist.
    pub fn from_yaml_file(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml_str(&raw, path).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ConfigError::TableFileRead {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Built-in rules for the store / num_crowd / ErrLog source tables.
    pub fn builtin() -> Self {
        let rename = |pairs: &[(&str, &str)]| -> BTreeMap<String, String> {
            pairs
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect()
        };
        let strip = |column: &str| CleaningRule {
            column: column.to_string(),
            action: "strip".to_string(),
        };
        let year_month = vec!["year".to_string(), "month".to_string()];

        Self::new(vec![
            (
                "store".to_string(),
                TableConfig {
                    source_table: "store".to_string(),
                    dest_table: "dim_stores".to_string(),
                    incremental: false,
                    description: Some("Store directory".to_string()),
                    processing_order: 1,
                    rename_map: rename(&[("tid", "store_id"), ("name", "store_name")]),
                    partition_cols: Vec::new(),
                    cleaning_rules: vec![strip("name")],
                    timestamp_col: None,
                },
            ),
            (
                "num_crowd".to_string(),
                TableConfig {
                    source_table: "num_crowd".to_string(),
                    dest_table: "fact_traffic".to_string(),
                    incremental: true,
                    description: Some("Per-sensor visitor counts".to_string()),
                    processing_order: 2,
                    rename_map: rename(&[
                        ("recordtime", "recorded_at"),
                        ("in_num", "visitors_in"),
                        ("out_num", "visitors_out"),
                        ("position", "device_position"),
                        ("storeid", "store_id"),
                    ]),
                    partition_cols: year_month.clone(),
                    cleaning_rules: vec![strip("position")],
                    timestamp_col: Some("recordtime".to_string()),
                },
            ),
            (
                "ErrLog".to_string(),
                TableConfig {
                    source_table: "ErrLog".to_string(),
                    dest_table: "fact_errors".to_string(),
                    incremental: true,
                    description: Some("Device error events".to_string()),
                    processing_order: 3,
                    rename_map: rename(&[
                        ("ID", "log_id"),
                        ("storeid", "store_id"),
                        ("DeviceCode", "device_code"),
                        ("LogTime", "logged_at"),
                        ("Errorcode", "error_code"),
                        ("ErrorMessage", "error_message"),
                    ]),
                    partition_cols: year_month,
                    cleaning_rules: vec![strip("ErrorMessage")],
                    timestamp_col: Some("LogTime".to_string()),
                },
            ),
        ])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TableConfig)> {
        self.entries.iter().map(|(name, config)| (name.as_str(), config))
    }

    pub fn get(&self, logical_name: &str) -> Option<&TableConfig> {
        self.entries
            .iter()
            .find(|(name, _)| name == logical_name)
            .map(|(_, config)| config)
    }

    pub fn by_dest(&self, dest_table: &str) -> Option<&TableConfig> {
        self.entries
            .iter()
            .map(|(_, config)| config)
            .find(|config| config.dest_table == dest_table)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tables in ascending `processing_order`; ties keep declaration order.
    pub fn in_processing_order(&self) -> Vec<TableConfig> {
        let mut tables: Vec<TableConfig> =
            self.entries.iter().map(|(_, config)| config.clone()).collect();
        tables.sort_by_key(|config| config.processing_order);
        tables
    }

    pub(crate) fn validate(&self, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for (name, config) in &self.entries {
            config.validate(name, errors);
            if !seen.insert(config.dest_table.as_str()) {
                errors.push(format!(
                    "table '{}': dest_table '{}' is used by more than one table",
                    name, config.dest_table
                ));
            }
        }
    }
}
