//! Delta timestamps: per-feature time offsets (seconds) around the current frame.

use crate::types::{DatasetError, DatasetResult};
use std::collections::BTreeMap;

pub type DeltaTimestamps = BTreeMap<String, Vec<f32>>;
pub type DeltaIndices = BTreeMap<String, Vec<i64>>;

pub const DEFAULT_TOLERANCE_S: f32 = 1e-4;

pub fn delta_timestamps_from_indices(indices: &DeltaIndices, fps: f32) -> DeltaTimestamps {
    indices
        .iter()
        .map(|(k, idx)| (k.clone(), idx.iter().map(|i| *i as f32 / fps).collect()))
        .collect()
}

/// Every delta must land on a frame boundary (a multiple of `1 / fps`) within `tolerance_s`.
pub fn check_delta_timestamps(
    deltas: &DeltaTimestamps,
    fps: f32,
    tolerance_s: f32,
) -> DatasetResult<()> {
    let mut outside = Vec::new();
    for (key, values) in deltas {
        for &d in values {
            let frames = d * fps;
            let err_s = (frames - frames.round()).abs() / fps;
            if !d.is_finite() || err_s > tolerance_s {
                outside.push(format!("{key}: {d}"));
            }
        }
    }
    if outside.is_empty() {
        Ok(())
    } else {
        Err(DatasetError::DeltaTimestamps(format!(
            "values are not multiples of 1/fps ({fps}) within {tolerance_s}s: {}",
            outside.join(", ")
        )))
    }
}

pub fn delta_indices(deltas: &DeltaTimestamps, fps: f32) -> DeltaIndices {
    deltas
        .iter()
        .map(|(k, v)| (k.clone(), v.iter().map(|d| (d * fps).round() as i64).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pusht_action_offsets_round_trip_through_indices() {
        let mut idx = DeltaIndices::new();
        idx.insert("action".into(), (-1..15).collect());
        let deltas = delta_timestamps_from_indices(&idx, 10.0);
        let action = &deltas["action"];
        assert_eq!(action.len(), 16);
        assert!((action[0] + 0.1).abs() < 1e-6);
        assert!((action[15] - 1.4).abs() < 1e-6);
        check_delta_timestamps(&deltas, 10.0, DEFAULT_TOLERANCE_S).unwrap();
        assert_eq!(delta_indices(&deltas, 10.0), idx);
    }

    #[test]
    fn off_grid_delta_is_rejected() {
        let mut deltas = DeltaTimestamps::new();
        deltas.insert("observation.state".into(), vec![-0.1, 0.05]);
        let err = check_delta_timestamps(&deltas, 10.0, DEFAULT_TOLERANCE_S).unwrap_err();
        assert!(err.to_string().contains("0.05"));
    }
}
