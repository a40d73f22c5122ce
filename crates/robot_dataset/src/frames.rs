//! In-memory frame table loaded from per-episode parquet files.

use crate::types::{DatasetError, DatasetResult};
use arrow_array::{
    Array, ArrayRef, BinaryArray, FixedSizeListArray, Float32Array, Float64Array, Int32Array,
    Int64Array, LargeBinaryArray, LargeListArray, ListArray, RecordBatch, StructArray,
    UInt64Array,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

pub const EPISODE_INDEX: &str = "episode_index";
pub const FRAME_INDEX: &str = "frame_index";
pub const INDEX: &str = "index";
pub const TIMESTAMP: &str = "timestamp";

/// Flattened `[frames, dim]` values of one numeric feature.
#[derive(Debug, Clone, Default)]
pub struct VectorColumn {
    pub dim: usize,
    pub data: Vec<f32>,
}

impl VectorColumn {
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

/// Which columns to pull out of each episode file.
#[derive(Debug, Clone, Default)]
pub struct ColumnSelection {
    /// Numeric features with their per-frame width.
    pub vectors: Vec<(String, usize)>,
    /// Image features stored as encoded bytes.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FrameTable {
    pub episode_index: Vec<usize>,
    pub frame_index: Vec<usize>,
    pub index: Vec<usize>,
    pub timestamp: Vec<f32>,
    pub vectors: BTreeMap<String, VectorColumn>,
    pub images: BTreeMap<String, Vec<Vec<u8>>>,
}

impl FrameTable {
    pub fn len(&self) -> usize {
        self.timestamp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_empty()
    }

    pub fn read_parquet(path: &Path, selection: &ColumnSelection) -> DatasetResult<Self> {
        let file = File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .and_then(|b| b.build())
            .map_err(|source| DatasetError::Parquet {
                path: path.to_path_buf(),
                source,
            })?;

        let mut table = FrameTable::default();
        for (key, dim) in &selection.vectors {
            table.vectors.insert(
                key.clone(),
                VectorColumn {
                    dim: *dim,
                    data: Vec::new(),
                },
            );
        }
        for key in &selection.images {
            table.images.insert(key.clone(), Vec::new());
        }

        for batch in reader {
            let batch = batch.map_err(|source| DatasetError::Arrow {
                path: path.to_path_buf(),
                source,
            })?;
            table.append_batch(path, &batch)?;
        }
        Ok(table)
    }

    fn append_batch(&mut self, path: &Path, batch: &RecordBatch) -> DatasetResult<()> {
        let rows = batch.num_rows();
        let offset = self.len();

        let timestamp = required(path, batch, TIMESTAMP)?;
        self.timestamp
            .extend(scalar_floats(timestamp).ok_or_else(|| type_err(path, TIMESTAMP, "float"))?);

        let episode = required(path, batch, EPISODE_INDEX)?;
        self.episode_index
            .extend(scalar_ints(episode).ok_or_else(|| type_err(path, EPISODE_INDEX, "integer"))?);

        match batch.column_by_name(FRAME_INDEX) {
            Some(col) => self
                .frame_index
                .extend(scalar_ints(col).ok_or_else(|| type_err(path, FRAME_INDEX, "integer"))?),
            None => self.frame_index.extend(offset..offset + rows),
        }
        match batch.column_by_name(INDEX) {
            Some(col) => self
                .index
                .extend(scalar_ints(col).ok_or_else(|| type_err(path, INDEX, "integer"))?),
            None => self.index.extend(offset..offset + rows),
        }

        for (key, column) in self.vectors.iter_mut() {
            let col = required(path, batch, key)?;
            let values = vector_rows(col, column.dim)
                .ok_or_else(|| type_err(path, key, "list of floats"))?
                .map_err(|msg| DatasetError::Validation {
                    path: path.to_path_buf(),
                    msg: format!("{key}: {msg}"),
                })?;
            column.data.extend(values);
        }

        for (key, column) in self.images.iter_mut() {
            let col = required(path, batch, key)?;
            let encoded =
                image_bytes(col).ok_or_else(|| type_err(path, key, "struct{bytes} or binary"))?;
            column.extend(encoded);
        }
        Ok(())
    }

    /// Concatenate another episode's frames onto this table.
    pub fn extend(&mut self, other: FrameTable) {
        self.episode_index.extend(other.episode_index);
        self.frame_index.extend(other.frame_index);
        self.index.extend(other.index);
        self.timestamp.extend(other.timestamp);
        for (key, col) in other.vectors {
            let entry = self.vectors.entry(key).or_insert_with(|| VectorColumn {
                dim: col.dim,
                data: Vec::new(),
            });
            entry.data.extend(col.data);
        }
        for (key, col) in other.images {
            self.images.entry(key).or_default().extend(col);
        }
    }

    /// Consecutive timestamps inside an episode must be `1 / fps` apart within `tolerance_s`.
    pub fn check_timestamps_sync(&self, fps: f32, tolerance_s: f32) -> DatasetResult<()> {
        let period = 1.0 / fps;
        let mut bad = Vec::new();
        for i in 1..self.len() {
            if self.episode_index[i] != self.episode_index[i - 1] {
                continue;
            }
            let diff = self.timestamp[i] - self.timestamp[i - 1];
            if (diff - period).abs() > tolerance_s {
                bad.push(format!(
                    "episode {} frame {}: dt={diff:.5}",
                    self.episode_index[i], self.frame_index[i]
                ));
            }
        }
        if bad.is_empty() {
            return Ok(());
        }
        let shown = bad.iter().take(8).cloned().collect::<Vec<_>>().join("; ");
        Err(DatasetError::Timestamps(format!(
            "{} frame gaps differ from 1/fps={period:.5} by more than {tolerance_s}s ({shown})",
            bad.len()
        )))
    }
}

fn required<'a>(path: &Path, batch: &'a RecordBatch, column: &str) -> DatasetResult<&'a ArrayRef> {
    batch
        .column_by_name(column)
        .ok_or_else(|| DatasetError::MissingColumn {
            path: path.to_path_buf(),
            column: column.to_string(),
        })
}

fn type_err(path: &Path, column: &str, expected: &'static str) -> DatasetError {
    DatasetError::ColumnType {
        path: path.to_path_buf(),
        column: column.to_string(),
        expected,
    }
}

fn scalar_floats(array: &dyn Array) -> Option<Vec<f32>> {
    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<Float32Array>() {
        Some(a.values().to_vec())
    } else if let Some(a) = any.downcast_ref::<Float64Array>() {
        Some(a.values().iter().map(|v| *v as f32).collect())
    } else if let Some(a) = any.downcast_ref::<Int64Array>() {
        Some(a.values().iter().map(|v| *v as f32).collect())
    } else if let Some(a) = any.downcast_ref::<Int32Array>() {
        Some(a.values().iter().map(|v| *v as f32).collect())
    } else {
        None
    }
}

fn scalar_ints(array: &dyn Array) -> Option<Vec<usize>> {
    let any = array.as_any();
    if let Some(a) = any.downcast_ref::<Int64Array>() {
        Some(a.values().iter().map(|v| (*v).max(0) as usize).collect())
    } else if let Some(a) = any.downcast_ref::<Int32Array>() {
        Some(a.values().iter().map(|v| (*v).max(0) as usize).collect())
    } else if let Some(a) = any.downcast_ref::<UInt64Array>() {
        Some(a.values().iter().map(|v| *v as usize).collect())
    } else {
        None
    }
}

/// Per-row list values (List / LargeList / FixedSizeList) or a plain scalar column.
/// Outer `None` means the column type is unsupported; inner `Err` a width mismatch.
fn vector_rows(array: &ArrayRef, dim: usize) -> Option<Result<Vec<f32>, String>> {
    let any = array.as_any();
    let rows: Vec<ArrayRef> = if let Some(l) = any.downcast_ref::<ListArray>() {
        (0..l.len()).map(|i| l.value(i)).collect()
    } else if let Some(l) = any.downcast_ref::<LargeListArray>() {
        (0..l.len()).map(|i| l.value(i)).collect()
    } else if let Some(l) = any.downcast_ref::<FixedSizeListArray>() {
        (0..l.len()).map(|i| l.value(i)).collect()
    } else {
        let values = scalar_floats(array.as_ref())?;
        if dim != 1 {
            return Some(Err(format!("scalar column but feature width is {dim}")));
        }
        return Some(Ok(values));
    };

    let mut out = Vec::with_capacity(rows.len() * dim);
    for (i, row) in rows.iter().enumerate() {
        let values = scalar_floats(row.as_ref())?;
        if values.len() != dim {
            return Some(Err(format!(
                "row {i} has {} values, expected {dim}",
                values.len()
            )));
        }
        out.extend(values);
    }
    Some(Ok(out))
}

fn image_bytes(array: &ArrayRef) -> Option<Vec<Vec<u8>>> {
    let any = array.as_any();
    if let Some(s) = any.downcast_ref::<StructArray>() {
        let bytes = s.column_by_name("bytes")?;
        return image_bytes(bytes);
    }
    if let Some(b) = any.downcast_ref::<BinaryArray>() {
        return Some((0..b.len()).map(|i| b.value(i).to_vec()).collect());
    }
    if let Some(b) = any.downcast_ref::<LargeBinaryArray>() {
        return Some((0..b.len()).map(|i| b.value(i).to_vec()).collect());
    }
    None
}
