//! LeRobot-format dataset loading and Burn-compatible batching.
//!
//! This crate provides utilities for:
//! - Reading dataset metadata (features, normalization stats, fps, episodes)
//! - Mapping dataset features to typed policy features
//! - Validating delta timestamps and converting them to frame offsets
//! - Loading episode parquet files and assembling time-offset samples
//! - Episode-aware sampling and parallel batch iteration

pub mod batch;
pub mod dataset;
pub mod delta;
pub mod features;
pub mod frames;
pub mod metadata;
pub mod types;

pub use batch::{collate, episode_aware_indices, Batch, BatchLoader, LoaderConfig, SamplerConfig};
pub use dataset::LeRobotDataset;
pub use delta::{
    check_delta_timestamps, delta_indices, delta_timestamps_from_indices, DeltaIndices,
    DeltaTimestamps, DEFAULT_TOLERANCE_S,
};
pub use features::{
    camera_chw, dataset_to_policy_features, partition_features, FeatureType, NormalizationMode, PolicyFeature,
    PolicyFeatures, ACTION,
};
pub use metadata::{DatasetMetadata, DatasetStats, FeatureSpec, FeatureStats};
pub use types::*;
