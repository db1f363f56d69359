//! Column-oriented chunk of source rows.

use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt;

use footfall_config::timestamp::format_timestamp;

/// A decoded source cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Timestamp(NaiveDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of a cell: integral floats and numeric text convert,
    /// everything else is `None`.
    pub fn to_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.is_finite() && v.fract() == 0.0 => Some(*v as i64),
            Value::Bool(v) => Some(i64::from(*v)),
            Value::Text(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite() && f.fract() == 0.0)
                        .map(|f| f as i64)
                })
            }
            _ => None,
        }
    }

    /// Numeric view that truncates fractional values.
    pub fn to_int_lossy(&self) -> Option<i64> {
        match self {
            Value::Float(v) if v.is_finite() => Some(v.trunc() as i64),
            Value::Text(s) => {
                let s = s.trim();
                s.parse::<i64>().ok().or_else(|| {
                    s.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
            }
            other => other.to_int(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bool(_) => "bool",
            Value::Timestamp(_) => "timestamp",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Timestamp(v) => f.write_str(&format_timestamp(v)),
        }
    }
}

/// Dominant type of a column's non-null values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    /// No non-null values.
    Empty,
    Int,
    /// Floats, possibly mixed with ints.
    Float,
    Text,
    Bool,
    Timestamp,
    Mixed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn kind(&self) -> ColumnKind {
        let mut kind = ColumnKind::Empty;
        for value in &self.values {
            let next = match value {
                Value::Null => continue,
                Value::Int(_) => ColumnKind::Int,
                Value::Float(_) => ColumnKind::Float,
                Value::Text(_) => ColumnKind::Text,
                Value::Bool(_) => ColumnKind::Bool,
                Value::Timestamp(_) => ColumnKind::Timestamp,
            };
            kind = match (kind, next) {
                (ColumnKind::Empty, next) => next,
                (a, b) if a == b => a,
                (ColumnKind::Int, ColumnKind::Float) | (ColumnKind::Float, ColumnKind::Int) => {
                    ColumnKind::Float
                }
                _ => return ColumnKind::Mixed,
            };
        }
        kind
    }

    /// True when every non-null value is text.
    pub fn is_text(&self) -> bool {
        matches!(self.kind(), ColumnKind::Text | ColumnKind::Empty)
    }
}

/// A chunk of rows stored column by column. All columns have equal length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    columns: Vec<Column>,
    num_rows: usize,
}

impl Frame {
    /// Build from columns; shorter columns are padded with nulls.
    pub fn new(mut columns: Vec<Column>) -> Self {
        let num_rows = columns.iter().map(|c| c.values.len()).max().unwrap_or(0);
        for column in &mut columns {
            column.values.resize(num_rows, Value::Null);
        }
        Self { columns, num_rows }
    }

    /// Build from row-major cells, as decoded from a result set.
    pub fn from_rows(names: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let mut columns: Vec<Column> = names
            .into_iter()
            .map(|name| Column::new(name, Vec::with_capacity(rows.len())))
            .collect();
        for row in rows {
            let mut cells = row.into_iter();
            for column in &mut columns {
                column.values.push(cells.next().unwrap_or(Value::Null));
            }
        }
        Self::new(columns)
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_mut(&mut self, name: &str) -> Option<&mut Column> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    pub fn columns_mut(&mut self) -> impl Iterator<Item = &mut Column> {
        self.columns.iter_mut()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Rename columns found in `map`; others keep their name.
    pub fn rename(&mut self, map: &BTreeMap<String, String>) {
        for column in &mut self.columns {
            if let Some(new_name) = map.get(&column.name) {
                column.name = new_name.clone();
            }
        }
    }

    /// Add or replace a column. Values must have one entry per row.
    pub fn set_column(&mut self, name: &str, mut values: Vec<Value>) {
        values.resize(self.num_rows, Value::Null);
        match self.column_mut(name) {
            Some(column) => column.values = values,
            None => self.columns.push(Column::new(name, values)),
        }
    }

    /// Keep only rows whose mask entry is true.
    pub fn retain_rows(&mut self, keep: &[bool]) {
        for column in &mut self.columns {
            let mut idx = 0;
            column.values.retain(|_| {
                let kept = keep.get(idx).copied().unwrap_or(false);
                idx += 1;
                kept
            });
        }
        self.num_rows = keep
            .iter()
            .take(self.num_rows)
            .filter(|k| **k)
            .count();
    }

    /// Keep the named columns, in the given order, skipping absent ones.
    pub fn select(self, names: &[&str]) -> Frame {
        let num_rows = self.num_rows;
        let mut remaining = self.columns;
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            if let Some(pos) = remaining.iter().position(|c| c.name == *name) {
                columns.push(remaining.swap_remove(pos));
            }
        }
        Frame { columns, num_rows }
    }
}
