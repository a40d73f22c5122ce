use robot_dataset::DatasetError;
use std::path::PathBuf;
use thiserror::Error;

pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy config: {0}")]
    InvalidConfig(String),
    #[error("missing {stat} statistics for feature {key}")]
    MissingStats { key: String, stat: &'static str },
    #[error("batch is missing feature {0}")]
    MissingFeature(String),
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint error at {path}: {msg}")]
    Checkpoint { path: PathBuf, msg: String },
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}
