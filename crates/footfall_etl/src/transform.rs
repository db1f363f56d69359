//! Per-chunk transformation: rename, clean, clamp, parse, derive, coerce,
//! then validate against the destination contract.
//!
//! Every step is a pure function of the chunk and the table config.

use arrow::array::RecordBatch;
use chrono::{Datelike, NaiveDateTime};
use tracing::{debug, warn};

use footfall_config::timestamp::parse_timestamp;
use footfall_config::TableConfig;

use crate::contract::{contract_for, infer_batch, ContractViolation, FailureCase};
use crate::frame::{Column, Frame, Value};

/// Source names of the visitor count columns.
const COUNT_COLUMNS: &[&str] = &["in_num", "out_num"];

/// Source names of identifier columns coerced to nullable integers.
const IDENTIFIER_COLUMNS: &[&str] = &["storeid", "ID", "DeviceCode", "Errorcode"];

/// Text placeholders that stand for a missing value.
const NULL_MARKERS: &[&str] = &["None", "NaT", "nan"];

/// Counters gathered while transforming one chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformReport {
    pub input_rows: usize,
    pub clamped_negatives: usize,
    pub invalid_timestamps: usize,
    pub output_rows: usize,
}

/// A chunk ready for staging.
#[derive(Debug, Clone)]
pub struct TransformedChunk {
    pub batch: RecordBatch,
    /// Largest timestamp in the chunk; only tracked for incremental tables.
    pub max_timestamp: Option<NaiveDateTime>,
    pub report: TransformReport,
}

impl TransformedChunk {
    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn is_empty(&self) -> bool {
        self.batch.num_rows() == 0
    }
}

type CleaningFn = fn(&mut Column);

/// Cleaning actions by name.
fn cleaning_action(action: &str) -> Option<CleaningFn> {
    match action {
        "strip" => Some(strip),
        _ => None,
    }
}

fn strip(column: &mut Column) {
    for value in &mut column.values {
        if let Value::Text(s) = value {
            let trimmed = s.trim();
            if trimmed.len() != s.len() {
                *s = trimmed.to_string();
            }
        }
    }
}

/// Run all steps on one extracted chunk.
pub fn transform(frame: Frame, config: &TableConfig) -> Result<TransformedChunk, ContractViolation> {
    let mut report = TransformReport {
        input_rows: frame.num_rows(),
        ..TransformReport::default()
    };
    let mut frame = frame;

    frame.rename(&config.rename_map);
    apply_cleaning_rules(&mut frame, config);
    report.clamped_negatives = clamp_counts(&mut frame, config);
    report.invalid_timestamps = coerce_timestamps(&mut frame, config);
    derive_partitions(&mut frame, config);
    coerce_identifiers(&mut frame, config);
    harmonize_nulls(&mut frame);

    let max_timestamp = if config.incremental {
        max_timestamp(&frame, config)
    } else {
        None
    };

    let batch = match contract_for(&config.dest_table) {
        Some(contract) => {
            let names = contract.column_names();
            let frame = frame.select(&names);
            contract.apply(&frame)?
        }
        None => {
            warn!(
                "No contract declared for '{}'; skipping validation",
                config.dest_table
            );
            infer_batch(&frame).map_err(|e| ContractViolation {
                dest_table: config.dest_table.clone(),
                cases: vec![FailureCase {
                    column: "*".to_string(),
                    check: "infer_types".to_string(),
                    index: None,
                    failure_case: Some(e.to_string()),
                }],
            })?
        }
    };

    report.output_rows = batch.num_rows();
    debug!(
        "Transformed chunk for '{}': {} -> {} rows",
        config.dest_table, report.input_rows, report.output_rows
    );

    Ok(TransformedChunk {
        batch,
        max_timestamp,
        report,
    })
}

fn apply_cleaning_rules(frame: &mut Frame, config: &TableConfig) {
    for rule in &config.cleaning_rules {
        let name = config.final_name(&rule.column);
        let Some(column) = frame.column_mut(name) else {
            continue;
        };
        let Some(action) = cleaning_action(&rule.action) else {
            warn!(
                "Unknown cleaning action '{}' for column '{}'; skipped",
                rule.action, name
            );
            continue;
        };
        if !column.is_text() {
            warn!(
                "Cleaning action '{}' needs a text column; '{}' is {:?}, skipped",
                rule.action,
                name,
                column.kind()
            );
            continue;
        }
        action(column);
    }
}

/// Coerce count columns to integers; negatives and non-numbers become 0.
/// Returns how many negatives were clamped.
fn clamp_counts(frame: &mut Frame, config: &TableConfig) -> usize {
    let mut clamped = 0;
    for source in COUNT_COLUMNS {
        let name = config.final_name(source);
        let Some(column) = frame.column_mut(name) else {
            continue;
        };
        let mut column_clamped = 0;
        for value in &mut column.values {
            let n = value.to_int_lossy().unwrap_or(0);
            if n < 0 {
                column_clamped += 1;
            }
            *value = Value::Int(n.max(0));
        }
        if column_clamped > 0 {
            warn!(
                "Clamped {} negative values to 0 in '{}'",
                column_clamped, name
            );
        }
        clamped += column_clamped;
    }
    clamped
}

/// Parse the timestamp column and drop rows where it does not parse.
/// Returns the number of dropped rows.
fn coerce_timestamps(frame: &mut Frame, config: &TableConfig) -> usize {
    let Some(name) = config.final_timestamp_col() else {
        return 0;
    };
    let Some(column) = frame.column_mut(name) else {
        return 0;
    };

    let mut keep = Vec::with_capacity(column.values.len());
    for value in &mut column.values {
        let parsed = match value {
            Value::Timestamp(ts) => Some(*ts),
            Value::Text(s) => parse_timestamp(s),
            _ => None,
        };
        keep.push(parsed.is_some());
        *value = parsed.map(Value::Timestamp).unwrap_or(Value::Null);
    }

    let invalid = keep.iter().filter(|k| !**k).count();
    if invalid > 0 {
        warn!(
            "Found {} invalid timestamps in '{}'; dropping those rows",
            invalid, name
        );
        frame.retain_rows(&keep);
    }
    invalid
}

fn derive_partitions(frame: &mut Frame, config: &TableConfig) {
    let Some(name) = config.final_timestamp_col() else {
        return;
    };
    let Some(column) = frame.column(name) else {
        return;
    };

    let timestamps: Vec<Option<NaiveDateTime>> = column
        .values
        .iter()
        .map(|v| match v {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        })
        .collect();

    for part in &config.partition_cols {
        let values = timestamps
            .iter()
            .map(|ts| match (ts, part.as_str()) {
                (Some(ts), "year") => Value::Int(i64::from(ts.year())),
                (Some(ts), "month") => Value::Int(i64::from(ts.month())),
                _ => Value::Null,
            })
            .collect();
        frame.set_column(part, values);
    }
}

fn coerce_identifiers(frame: &mut Frame, config: &TableConfig) {
    for source in IDENTIFIER_COLUMNS {
        let name = config.final_name(source);
        let Some(column) = frame.column_mut(name) else {
            continue;
        };
        for value in &mut column.values {
            *value = value.to_int().map(Value::Int).unwrap_or(Value::Null);
        }
    }
}

fn harmonize_nulls(frame: &mut Frame) {
    for column in frame.columns_mut() {
        for value in &mut column.values {
            if let Value::Text(s) = value {
                if NULL_MARKERS.contains(&s.as_str()) {
                    *value = Value::Null;
                }
            }
        }
    }
}

fn max_timestamp(frame: &Frame, config: &TableConfig) -> Option<NaiveDateTime> {
    let name = config.final_timestamp_col()?;
    frame
        .column(name)?
        .values
        .iter()
        .filter_map(|v| match v {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        })
        .max()
}
