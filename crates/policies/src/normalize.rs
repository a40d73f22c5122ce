//! Feature normalization from dataset statistics.
//!
//! Every mode reduces to an affine map `y = x * scale + shift`, precomputed per feature on the
//! host and broadcast over the batch and time dimensions.

use crate::error::{PolicyError, PolicyResult};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use robot_dataset::{DatasetStats, FeatureStats, FeatureType, NormalizationMode, PolicyFeatures};
use std::collections::BTreeMap;

const EPS: f32 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
struct Affine {
    scale: Vec<f32>,
    shift: Vec<f32>,
}

impl Affine {
    fn from_stats(key: &str, mode: NormalizationMode, stats: &FeatureStats) -> PolicyResult<Option<Self>> {
        let need = |values: &Vec<f32>, stat: &'static str| -> PolicyResult<()> {
            if values.is_empty() {
                Err(PolicyError::MissingStats {
                    key: key.to_string(),
                    stat,
                })
            } else {
                Ok(())
            }
        };
        match mode {
            NormalizationMode::Identity => Ok(None),
            NormalizationMode::MeanStd => {
                need(&stats.mean, "mean")?;
                need(&stats.std, "std")?;
                check_len(key, &stats.mean, &stats.std)?;
                let scale: Vec<f32> = stats.std.iter().map(|s| 1.0 / (s + EPS)).collect();
                let shift = stats.mean.iter().zip(&scale).map(|(m, s)| -m * s).collect();
                Ok(Some(Self { scale, shift }))
            }
            NormalizationMode::MinMax => {
                need(&stats.min, "min")?;
                need(&stats.max, "max")?;
                check_len(key, &stats.min, &stats.max)?;
                // Maps [min, max] onto [-1, 1].
                let scale: Vec<f32> = stats
                    .min
                    .iter()
                    .zip(&stats.max)
                    .map(|(lo, hi)| 2.0 / (hi - lo + EPS))
                    .collect();
                let shift = stats
                    .min
                    .iter()
                    .zip(&scale)
                    .map(|(lo, s)| -lo * s - 1.0)
                    .collect();
                Ok(Some(Self { scale, shift }))
            }
        }
    }

    fn len(&self) -> usize {
        self.scale.len()
    }
}

fn check_len(key: &str, a: &[f32], b: &[f32]) -> PolicyResult<()> {
    if a.len() != b.len() {
        return Err(PolicyError::Shape(format!(
            "{key}: statistics have mismatched lengths {} and {}",
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

/// Normalizes inputs and targets, and maps predicted actions back to dataset units.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    affine: BTreeMap<String, Affine>,
}

impl Normalizer {
    pub fn new(
        features: &PolicyFeatures,
        mapping: &BTreeMap<FeatureType, NormalizationMode>,
        stats: &DatasetStats,
    ) -> PolicyResult<Self> {
        let mut affine = BTreeMap::new();
        for (key, ft) in features {
            let mode = mapping
                .get(&ft.ty)
                .copied()
                .unwrap_or(NormalizationMode::Identity);
            if mode == NormalizationMode::Identity {
                continue;
            }
            let feature_stats = stats.get(key).ok_or_else(|| PolicyError::MissingStats {
                key: key.clone(),
                stat: "all",
            })?;
            if let Some(a) = Affine::from_stats(key, mode, feature_stats)? {
                let expected = if ft.ty == FeatureType::Visual {
                    ft.shape[0]
                } else {
                    ft.numel()
                };
                if a.len() != expected && a.len() != 1 {
                    return Err(PolicyError::Shape(format!(
                        "{key}: {} statistics for a feature of width {expected}",
                        a.len()
                    )));
                }
                affine.insert(key.clone(), a.broadcast_to(expected));
            }
        }
        Ok(Self { affine })
    }

    /// `[batch, frames, dim]` to normalized units.
    pub fn normalize_vectors<B: Backend>(&self, key: &str, x: Tensor<B, 3>) -> Tensor<B, 3> {
        match self.affine.get(key) {
            Some(a) => {
                let device = x.device();
                let d = a.len();
                let scale = Tensor::<B, 3>::from_data(TensorData::new(a.scale.clone(), [1, 1, d]), &device);
                let shift = Tensor::<B, 3>::from_data(TensorData::new(a.shift.clone(), [1, 1, d]), &device);
                x * scale + shift
            }
            None => x,
        }
    }

    pub fn unnormalize_vectors<B: Backend>(&self, key: &str, y: Tensor<B, 3>) -> Tensor<B, 3> {
        match self.affine.get(key) {
            Some(a) => {
                let device = y.device();
                let d = a.len();
                let scale = Tensor::<B, 3>::from_data(TensorData::new(a.scale.clone(), [1, 1, d]), &device);
                let shift = Tensor::<B, 3>::from_data(TensorData::new(a.shift.clone(), [1, 1, d]), &device);
                (y - shift) / scale
            }
            None => y,
        }
    }

    /// `[batch, frames, channels, height, width]`, statistics per channel.
    pub fn normalize_images<B: Backend>(&self, key: &str, x: Tensor<B, 5>) -> Tensor<B, 5> {
        match self.affine.get(key) {
            Some(a) => {
                let device = x.device();
                let c = a.len();
                let scale =
                    Tensor::<B, 5>::from_data(TensorData::new(a.scale.clone(), [1, 1, c, 1, 1]), &device);
                let shift =
                    Tensor::<B, 5>::from_data(TensorData::new(a.shift.clone(), [1, 1, c, 1, 1]), &device);
                x * scale + shift
            }
            None => x,
        }
    }
}

impl Affine {
    fn broadcast_to(self, n: usize) -> Self {
        if self.len() == n {
            return self;
        }
        Self {
            scale: vec![self.scale[0]; n],
            shift: vec![self.shift[0]; n],
        }
    }
}
