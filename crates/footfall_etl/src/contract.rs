//! Declared column contracts for destination tables and Arrow conversion.
//!
//! A contract is strict and coercing: only its columns survive, each value is
//! coerced to the declared type, and every failing value is collected before
//! the chunk is rejected.

use arrow::array::{
    new_null_array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, RecordBatch,
    StringArray, TimestampMicrosecondArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use footfall_config::timestamp::{format_timestamp, parse_timestamp};

use crate::frame::{Column, ColumnKind, Frame, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int64,
    Int32,
    Utf8,
    Timestamp,
}

impl FieldType {
    pub fn data_type(&self) -> DataType {
        match self {
            FieldType::Int64 => DataType::Int64,
            FieldType::Int32 => DataType::Int32,
            FieldType::Utf8 => DataType::Utf8,
            FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FieldType::Int64 => "int64",
            FieldType::Int32 => "int32",
            FieldType::Utf8 => "str",
            FieldType::Timestamp => "datetime64[us]",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldContract {
    pub name: &'static str,
    pub ty: FieldType,
    /// Nullable columns may also be absent from the chunk.
    pub nullable: bool,
    pub unique: bool,
    pub min: Option<i64>,
}

const fn field(name: &'static str, ty: FieldType) -> FieldContract {
    FieldContract {
        name,
        ty,
        nullable: true,
        unique: false,
        min: None,
    }
}

const fn required(name: &'static str, ty: FieldType) -> FieldContract {
    FieldContract {
        nullable: false,
        ..field(name, ty)
    }
}

const fn unique_key(name: &'static str) -> FieldContract {
    FieldContract {
        unique: true,
        ..required(name, FieldType::Int64)
    }
}

const fn count(name: &'static str) -> FieldContract {
    FieldContract {
        min: Some(0),
        ..field(name, FieldType::Int64)
    }
}

#[derive(Debug)]
pub struct TableContract {
    pub dest_table: &'static str,
    pub fields: &'static [FieldContract],
}

static DIM_STORES: TableContract = TableContract {
    dest_table: "dim_stores",
    fields: &[
        unique_key("store_id"),
        required("store_name", FieldType::Utf8),
    ],
};

static FACT_TRAFFIC: TableContract = TableContract {
    dest_table: "fact_traffic",
    fields: &[
        required("recorded_at", FieldType::Timestamp),
        count("visitors_in"),
        count("visitors_out"),
        field("device_position", FieldType::Utf8),
        required("store_id", FieldType::Int64),
        required("year", FieldType::Int32),
        required("month", FieldType::Int32),
    ],
};

static FACT_ERRORS: TableContract = TableContract {
    dest_table: "fact_errors",
    fields: &[
        unique_key("log_id"),
        required("store_id", FieldType::Int64),
        field("device_code", FieldType::Int64),
        required("logged_at", FieldType::Timestamp),
        field("error_code", FieldType::Int64),
        field("error_message", FieldType::Utf8),
        required("year", FieldType::Int32),
        required("month", FieldType::Int32),
    ],
};

/// Contract for a destination table, if one is declared.
pub fn contract_for(dest_table: &str) -> Option<&'static TableContract> {
    [&DIM_STORES, &FACT_TRAFFIC, &FACT_ERRORS]
        .into_iter()
        .find(|c| c.dest_table == dest_table)
}

/// One failing check: which column, which check, which row and value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureCase {
    pub column: String,
    pub check: String,
    pub index: Option<usize>,
    pub failure_case: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContractViolation {
    pub dest_table: String,
    pub cases: Vec<FailureCase>,
}

impl fmt::Display for ContractViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "contract violation in '{}': {} failing checks",
            self.dest_table,
            self.cases.len()
        )?;
        let mut checks: Vec<String> = self
            .cases
            .iter()
            .map(|c| format!("{}:{}", c.column, c.check))
            .collect();
        checks.dedup();
        if !checks.is_empty() {
            write!(f, " ({})", checks.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for ContractViolation {}

impl TableContract {
    pub fn column_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(
            self.fields
                .iter()
                .map(|f| Field::new(f.name, f.ty.data_type(), true))
                .collect::<Vec<_>>(),
        ))
    }

    /// Validate and coerce `frame` into a batch with exactly the contract columns.
    pub fn apply(&self, frame: &Frame) -> Result<RecordBatch, ContractViolation> {
        let num_rows = frame.num_rows();
        let mut cases = Vec::new();
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.fields.len());

        for spec in self.fields {
            match frame.column(spec.name) {
                Some(column) => arrays.push(coerce_column(spec, column, &mut cases)),
                None => {
                    if !spec.nullable {
                        cases.push(FailureCase {
                            column: spec.name.to_string(),
                            check: "column_in_dataframe".to_string(),
                            index: None,
                            failure_case: Some(spec.name.to_string()),
                        });
                    }
                    arrays.push(new_null_array(&spec.ty.data_type(), num_rows));
                }
            }
        }

        if !cases.is_empty() {
            return Err(ContractViolation {
                dest_table: self.dest_table.to_string(),
                cases,
            });
        }

        RecordBatch::try_new(self.schema(), arrays).map_err(|e| ContractViolation {
            dest_table: self.dest_table.to_string(),
            cases: vec![FailureCase {
                column: "*".to_string(),
                check: "record_batch".to_string(),
                index: None,
                failure_case: Some(e.to_string()),
            }],
        })
    }
}

fn coerce_column(spec: &FieldContract, column: &Column, cases: &mut Vec<FailureCase>) -> ArrayRef {
    let mut fail = |check: String, index: usize, value: &Value| {
        cases.push(FailureCase {
            column: spec.name.to_string(),
            check,
            index: Some(index),
            failure_case: Some(value.to_string()),
        });
    };
    let coerce_check = format!("coerce_dtype('{}')", spec.ty.label());

    let mut seen: HashSet<String> = HashSet::new();
    let mut check_row = |index: usize, value: &Value, present: bool, key: Option<String>| {
        if !present && value.is_null() && !spec.nullable {
            fail("not_nullable".to_string(), index, value);
        }
        if spec.unique {
            if let Some(key) = key {
                if !seen.insert(key) {
                    fail("field_uniqueness".to_string(), index, value);
                }
            }
        }
    };

    match spec.ty {
        FieldType::Int64 | FieldType::Int32 => {
            let mut out: Vec<Option<i64>> = Vec::with_capacity(column.values.len());
            let mut bad: Vec<(usize, String)> = Vec::new();
            for (index, value) in column.values.iter().enumerate() {
                let coerced = match value {
                    Value::Null => None,
                    other => match other.to_int() {
                        Some(v) if spec.ty == FieldType::Int32 && i32::try_from(v).is_err() => {
                            bad.push((index, coerce_check.clone()));
                            None
                        }
                        Some(v) => Some(v),
                        None => {
                            bad.push((index, coerce_check.clone()));
                            None
                        }
                    },
                };
                let present = coerced.is_some();
                check_row(index, value, present, coerced.map(|v| v.to_string()));
                if let (Some(min), Some(v)) = (spec.min, coerced) {
                    if v < min {
                        bad.push((index, format!("greater_than_or_equal_to({})", min)));
                    }
                }
                out.push(coerced);
            }
            for (index, check) in bad {
                fail(check, index, &column.values[index]);
            }
            if spec.ty == FieldType::Int32 {
                Arc::new(Int32Array::from(
                    out.into_iter()
                        .map(|v| v.and_then(|v| i32::try_from(v).ok()))
                        .collect::<Vec<_>>(),
                ))
            } else {
                Arc::new(Int64Array::from(out))
            }
        }
        FieldType::Utf8 => {
            let mut out: Vec<Option<String>> = Vec::with_capacity(column.values.len());
            for (index, value) in column.values.iter().enumerate() {
                let coerced = match value {
                    Value::Null => None,
                    other => Some(other.to_string()),
                };
                check_row(index, value, coerced.is_some(), coerced.clone());
                out.push(coerced);
            }
            Arc::new(StringArray::from(out))
        }
        FieldType::Timestamp => {
            let mut out: Vec<Option<i64>> = Vec::with_capacity(column.values.len());
            let mut bad: Vec<usize> = Vec::new();
            for (index, value) in column.values.iter().enumerate() {
                let coerced = match value {
                    Value::Null => None,
                    Value::Timestamp(ts) => Some(*ts),
                    Value::Text(s) => {
                        let parsed = parse_timestamp(s);
                        if parsed.is_none() {
                            bad.push(index);
                        }
                        parsed
                    }
                    _ => {
                        bad.push(index);
                        None
                    }
                };
                check_row(
                    index,
                    value,
                    coerced.is_some(),
                    coerced.map(|ts| format_timestamp(&ts)),
                );
                out.push(coerced.map(|ts| ts.and_utc().timestamp_micros()));
            }
            for index in bad {
                fail(coerce_check.clone(), index, &column.values[index]);
            }
            Arc::new(TimestampMicrosecondArray::from(out))
        }
    }
}

/// Arrow batch for a table without a contract; types inferred per column.
pub fn infer_batch(frame: &Frame) -> Result<RecordBatch, arrow::error::ArrowError> {
    let mut fields = Vec::with_capacity(frame.columns().len());
    let mut arrays: Vec<ArrayRef> = Vec::with_capacity(frame.columns().len());

    for column in frame.columns() {
        let (data_type, array): (DataType, ArrayRef) = match column.kind() {
            ColumnKind::Int => (
                DataType::Int64,
                Arc::new(Int64Array::from(
                    column.values.iter().map(Value::to_int).collect::<Vec<_>>(),
                )),
            ),
            ColumnKind::Float => (
                DataType::Float64,
                Arc::new(Float64Array::from(
                    column
                        .values
                        .iter()
                        .map(|v| match v {
                            Value::Int(i) => Some(*i as f64),
                            Value::Float(f) => Some(*f),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
            ),
            ColumnKind::Bool => (
                DataType::Boolean,
                Arc::new(BooleanArray::from(
                    column
                        .values
                        .iter()
                        .map(|v| match v {
                            Value::Bool(b) => Some(*b),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
            ),
            ColumnKind::Timestamp => (
                FieldType::Timestamp.data_type(),
                Arc::new(TimestampMicrosecondArray::from(
                    column
                        .values
                        .iter()
                        .map(|v| match v {
                            Value::Timestamp(ts) => Some(ts.and_utc().timestamp_micros()),
                            _ => None,
                        })
                        .collect::<Vec<_>>(),
                )),
            ),
            ColumnKind::Text | ColumnKind::Mixed | ColumnKind::Empty => (
                DataType::Utf8,
                Arc::new(StringArray::from(
                    column
                        .values
                        .iter()
                        .map(|v| (!v.is_null()).then(|| v.to_string()))
                        .collect::<Vec<_>>(),
                )),
            ),
        };
        fields.push(Field::new(column.name.as_str(), data_type, true));
        arrays.push(array);
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)
}

/// Write the failure cases of a rejected chunk under `dir` as Parquet.
pub fn write_rejected(
    dir: &Path,
    violation: &ContractViolation,
) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    fs::create_dir_all(dir)?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
    let path = dir.join(format!("rejected_{}.parquet", stamp));

    let cases = &violation.cases;
    let schema = Arc::new(Schema::new(vec![
        Field::new("column", DataType::Utf8, false),
        Field::new("check", DataType::Utf8, false),
        Field::new("index", DataType::UInt64, true),
        Field::new("failure_case", DataType::Utf8, true),
    ]));
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from_iter_values(cases.iter().map(|c| c.column.as_str()))),
            Arc::new(StringArray::from_iter_values(cases.iter().map(|c| c.check.as_str()))),
            Arc::new(UInt64Array::from(
                cases
                    .iter()
                    .map(|c| c.index.map(|i| i as u64))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                cases
                    .iter()
                    .map(|c| c.failure_case.clone())
                    .collect::<Vec<_>>(),
            )),
        ],
    )?;

    let file = File::create(&path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(path)
}
