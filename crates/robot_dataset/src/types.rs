//! Core error definitions and sample containers for robot_dataset.

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, DatasetError>;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("parquet error at {path}: {source}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },
    #[error("arrow error at {path}: {source}")]
    Arrow {
        path: PathBuf,
        #[source]
        source: arrow_schema::ArrowError,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("validation failed at {path}: {msg}")]
    Validation { path: PathBuf, msg: String },
    #[error("column {column} missing from {path}")]
    MissingColumn { path: PathBuf, column: String },
    #[error("column {column} in {path} has unsupported type (expected {expected})")]
    ColumnType {
        path: PathBuf,
        column: String,
        expected: &'static str,
    },
    #[error("timestamps out of sync: {0}")]
    Timestamps(String),
    #[error("invalid delta timestamps: {0}")]
    DeltaTimestamps(String),
    #[error("unknown feature {0}")]
    UnknownFeature(String),
    #[error("{0}")]
    Other(String),
}

/// Consecutive frames of a vector-valued feature, flattened row-major `[frames, dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStack {
    pub frames: usize,
    pub dim: usize,
    pub data: Vec<f32>,
}

/// Consecutive decoded camera frames, flattened `[frames, channels, height, width]` in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageStack {
    pub frames: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ImageStack {
    pub fn frame_len(&self) -> usize {
        self.channels * self.height * self.width
    }
}

/// One training item: every requested feature at its delta offsets around `index`.
#[derive(Debug, Clone)]
pub struct Sample {
    pub index: usize,
    pub episode_index: usize,
    pub vectors: BTreeMap<String, FrameStack>,
    pub images: BTreeMap<String, ImageStack>,
    /// `true` where the queried frame fell outside the episode and was clamped.
    pub is_pad: BTreeMap<String, Vec<bool>>,
}
