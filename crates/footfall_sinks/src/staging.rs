//! Per-table Parquet staging directory.

use arrow::array::{new_null_array, ArrayRef, RecordBatch, UInt32Array};
use arrow::compute::{cast, take_record_batch};
use arrow::datatypes::SchemaRef;
use arrow::util::display::array_value_to_string;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{SinkError, SinkResult};

/// File name of the single-file (non-partitioned) staging output.
pub const DATA_FILE_NAME: &str = "data.parquet";

const HIVE_NULL_PARTITION: &str = "__HIVE_DEFAULT_PARTITION__";

/// What a finished staging pass produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingSummary {
    pub rows_written: u64,
    pub files_written: usize,
}

impl StagingSummary {
    pub fn has_written_data(&self) -> bool {
        self.rows_written > 0
    }
}

/// Writes transformed batches under one table's staging directory.
///
/// Without partition columns every batch is appended to a single
/// `data.parquet`, written to a hidden temp file and renamed into place by
/// [`finish`](Self::finish). With partition columns each batch is split into
/// Hive-style `col=value/` directories and every group gets its own part
/// file; the partition columns themselves are not stored in the files.
///
/// The first non-empty batch fixes the schema; later batches are conformed
/// to it (missing columns become null, differing types are cast).
pub struct StagingLoader {
    dir: PathBuf,
    partition_cols: Vec<String>,
    run_id: String,
    schema: Option<SchemaRef>,
    writer: Option<ArrowWriter<File>>,
    temp_path: Option<PathBuf>,
    seq: u32,
    rows_written: u64,
    files_written: usize,
}

impl StagingLoader {
    /// Prepare `dir` for a new run.
    ///
    /// Anything left from an earlier attempt is removed first: the
    /// high-water mark only advances after a publish, so those rows are
    /// extracted again.
    pub fn open(dir: impl Into<PathBuf>, partition_cols: &[String]) -> SinkResult<Self> {
        let dir = dir.into();
        clear_dir(&dir)?;
        fs::create_dir_all(&dir).map_err(|e| {
            SinkError::staging_io(&dir, "failed to create staging directory", e)
        })?;

        let run_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        debug!(
            "Opened staging directory {} (run {}, partitions {:?})",
            dir.display(),
            run_id,
            partition_cols
        );

        Ok(Self {
            dir,
            partition_cols: partition_cols.to_vec(),
            run_id,
            schema: None,
            writer: None,
            temp_path: None,
            seq: 0,
            rows_written: 0,
            files_written: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn has_written_data(&self) -> bool {
        self.rows_written > 0
    }

    /// Write one transformed batch. Empty batches are ignored.
    pub fn write_batch(&mut self, batch: &RecordBatch) -> SinkResult<u64> {
        if batch.num_rows() == 0 {
            return Ok(0);
        }

        let batch = self.conform(batch)?;
        if self.partition_cols.is_empty() {
            self.write_single(&batch)?;
        } else {
            self.write_partitioned(&batch)?;
        }

        let rows = batch.num_rows() as u64;
        self.rows_written += rows;
        debug!(
            "Staged {} rows in {} (total: {})",
            rows,
            self.dir.display(),
            self.rows_written
        );
        Ok(rows)
    }

    /// Close the open writer and promote the single-file output.
    pub fn finish(mut self) -> SinkResult<StagingSummary> {
        if let Some(writer) = self.writer.take() {
            let temp_path = self.temp_path.take().unwrap_or_else(|| self.dir.join(DATA_FILE_NAME));
            writer.close().map_err(|e| {
                SinkError::staging_io(&temp_path, "failed to close parquet writer", e)
            })?;
            let final_path = self.dir.join(DATA_FILE_NAME);
            fs::rename(&temp_path, &final_path).map_err(|e| {
                SinkError::staging_io(&final_path, "failed to promote staging file", e)
            })?;
            self.files_written += 1;
        }

        info!(
            "Staging complete: {} ({} rows, {} files)",
            self.dir.display(),
            self.rows_written,
            self.files_written
        );
        Ok(StagingSummary {
            rows_written: self.rows_written,
            files_written: self.files_written,
        })
    }

    fn conform(&mut self, batch: &RecordBatch) -> SinkResult<RecordBatch> {
        let Some(schema) = self.schema.clone() else {
            self.schema = Some(batch.schema());
            return Ok(batch.clone());
        };
        if batch.schema() == schema {
            return Ok(batch.clone());
        }

        for field in batch.schema().fields() {
            if schema.field_with_name(field.name()).is_err() {
                warn!(
                    "Column '{}' not present in the first staged batch; dropping it",
                    field.name()
                );
            }
        }

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for field in schema.fields() {
            let column = match batch.column_by_name(field.name()) {
                Some(col) if col.data_type() == field.data_type() => col.clone(),
                Some(col) => cast(col, field.data_type()).map_err(|e| {
                    SinkError::staging_io(
                        &self.dir,
                        format!("cannot cast column '{}' to {}", field.name(), field.data_type()),
                        e,
                    )
                })?,
                None => new_null_array(field.data_type(), batch.num_rows()),
            };
            columns.push(column);
        }

        RecordBatch::try_new(schema, columns)
            .map_err(|e| SinkError::staging_io(&self.dir, "batch does not fit staged schema", e))
    }

    fn write_single(&mut self, batch: &RecordBatch) -> SinkResult<()> {
        if self.writer.is_none() {
            let temp_path = self.dir.join(format!(".{}.tmp", DATA_FILE_NAME));
            let file = File::create(&temp_path).map_err(|e| {
                SinkError::staging_io(&temp_path, "failed to create staging file", e)
            })?;
            let writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_properties()))
                .map_err(|e| {
                    SinkError::staging_io(&temp_path, "failed to create parquet writer", e)
                })?;
            self.writer = Some(writer);
            self.temp_path = Some(temp_path);
        }

        let temp_path = self.temp_path.clone().unwrap_or_else(|| self.dir.clone());
        match self.writer.as_mut() {
            Some(writer) => writer
                .write(batch)
                .map_err(|e| SinkError::staging_io(&temp_path, "failed to write batch", e)),
            None => Err(SinkError::StagingIo {
                path: temp_path,
                message: "parquet writer not initialized".to_string(),
                source: None,
            }),
        }
    }

    fn write_partitioned(&mut self, batch: &RecordBatch) -> SinkResult<()> {
        let schema = batch.schema();
        let mut keys: Vec<ArrayRef> = Vec::with_capacity(self.partition_cols.len());
        for col in &self.partition_cols {
            let array = batch.column_by_name(col).ok_or_else(|| SinkError::StagingIo {
                path: self.dir.clone(),
                message: format!("partition column '{}' missing from batch", col),
                source: None,
            })?;
            keys.push(array.clone());
        }

        let mut groups: BTreeMap<Vec<String>, Vec<u32>> = BTreeMap::new();
        for row in 0..batch.num_rows() {
            let mut key = Vec::with_capacity(keys.len());
            for array in &keys {
                key.push(partition_value(array, row).map_err(|e| {
                    SinkError::staging_io(&self.dir, "unreadable partition value", e)
                })?);
            }
            groups.entry(key).or_default().push(row as u32);
        }

        let data_columns: Vec<usize> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| !self.partition_cols.iter().any(|p| p == f.name()))
            .map(|(i, _)| i)
            .collect();
        let data = batch
            .project(&data_columns)
            .map_err(|e| SinkError::staging_io(&self.dir, "failed to project batch", e))?;

        for (values, rows) in groups {
            let mut part_dir = self.dir.clone();
            for (col, value) in self.partition_cols.iter().zip(&values) {
                part_dir.push(format!("{}={}", col, value));
            }
            fs::create_dir_all(&part_dir).map_err(|e| {
                SinkError::staging_io(&part_dir, "failed to create partition directory", e)
            })?;

            let indices = UInt32Array::from(rows);
            let group = take_record_batch(&data, &indices)
                .map_err(|e| SinkError::staging_io(&part_dir, "failed to split batch", e))?;

            self.seq += 1;
            let file_name = format!("part-{}-{:05}.parquet", self.run_id, self.seq);
            write_part_file(&part_dir, &file_name, &group)?;
            self.files_written += 1;
        }
        Ok(())
    }
}

impl Drop for StagingLoader {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            // Unfinished run: close the handle, leave the temp file for post-mortem.
            if let Err(e) = writer.close() {
                debug!("Discarding unfinished staging writer: {}", e);
            }
            warn!(
                "Staging in {} ended without finish(); output left unpublished",
                self.dir.display()
            );
        }
    }
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build()
}

fn partition_value(
    array: &ArrayRef,
    row: usize,
) -> Result<String, arrow::error::ArrowError> {
    if array.is_null(row) {
        Ok(HIVE_NULL_PARTITION.to_string())
    } else {
        array_value_to_string(array, row)
    }
}

fn write_part_file(dir: &Path, file_name: &str, batch: &RecordBatch) -> SinkResult<()> {
    let temp_path = dir.join(format!(".{}.tmp", file_name));
    let final_path = dir.join(file_name);

    let file = File::create(&temp_path)
        .map_err(|e| SinkError::staging_io(&temp_path, "failed to create part file", e))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_properties()))
        .map_err(|e| SinkError::staging_io(&temp_path, "failed to create parquet writer", e))?;
    writer
        .write(batch)
        .map_err(|e| SinkError::staging_io(&temp_path, "failed to write part file", e))?;
    writer
        .close()
        .map_err(|e| SinkError::staging_io(&temp_path, "failed to close part file", e))?;
    fs::rename(&temp_path, &final_path)
        .map_err(|e| SinkError::staging_io(&final_path, "failed to promote part file", e))?;
    Ok(())
}

fn clear_dir(dir: &Path) -> SinkResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    let entries = fs::read_dir(dir)
        .map_err(|e| SinkError::staging_io(dir, "failed to list staging directory", e))?;
    let mut removed = 0usize;
    for entry in entries {
        let entry =
            entry.map_err(|e| SinkError::staging_io(dir, "failed to list staging directory", e))?;
        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.map_err(|e| SinkError::staging_io(&path, "failed to clear stale staging entry", e))?;
        removed += 1;
    }
    if removed > 0 {
        info!(
            "Cleared {} stale entries from staging directory {}",
            removed,
            dir.display()
        );
    }
    Ok(())
}
