//! Diffusion policy configuration.

use crate::error::{PolicyError, PolicyResult};
use robot_dataset::{FeatureType, NormalizationMode, PolicyFeature, PolicyFeatures};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    #[serde(rename = "squaredcos_cap_v2")]
    SquaredCosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    /// Model predicts the injected noise.
    Epsilon,
    /// Model predicts the clean action trajectory.
    Sample,
}

/// Hyperparameters and feature layout of a diffusion policy.
///
/// Every field has a default, so a partial TOML/JSON document deserializes into a full config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    /// Observation frames fed to the policy (current frame plus history).
    pub n_obs_steps: usize,
    /// Length of the predicted action trajectory.
    pub horizon: usize,
    /// Actions executed from each predicted trajectory before replanning.
    pub n_action_steps: usize,

    pub input_features: PolicyFeatures,
    pub output_features: PolicyFeatures,
    pub normalization_mapping: BTreeMap<FeatureType, NormalizationMode>,

    /// `[height, width]` crop applied to camera frames before encoding.
    pub crop_shape: Option<[usize; 2]>,
    /// Random crop while training, center crop otherwise.
    pub crop_is_random: bool,
    pub image_embed_dim: usize,
    /// Widths of the denoiser's hidden layers.
    pub hidden_dims: Vec<usize>,
    pub diffusion_step_embed_dim: usize,

    pub num_train_timesteps: usize,
    pub beta_schedule: BetaSchedule,
    pub beta_start: f32,
    pub beta_end: f32,
    pub prediction_type: PredictionType,
    pub clip_sample: bool,
    pub clip_sample_range: f32,
    /// Denoising steps at inference; defaults to `num_train_timesteps`.
    pub num_inference_steps: Option<usize>,
    pub do_mask_loss_for_padding: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        let mut normalization_mapping = BTreeMap::new();
        normalization_mapping.insert(FeatureType::Visual, NormalizationMode::MeanStd);
        normalization_mapping.insert(FeatureType::State, NormalizationMode::MinMax);
        normalization_mapping.insert(FeatureType::Env, NormalizationMode::MinMax);
        normalization_mapping.insert(FeatureType::Action, NormalizationMode::MinMax);
        Self {
            n_obs_steps: 2,
            horizon: 16,
            n_action_steps: 8,
            input_features: PolicyFeatures::new(),
            output_features: PolicyFeatures::new(),
            normalization_mapping,
            crop_shape: Some([84, 84]),
            crop_is_random: true,
            image_embed_dim: 64,
            hidden_dims: vec![512, 512],
            diffusion_step_embed_dim: 128,
            num_train_timesteps: 100,
            beta_schedule: BetaSchedule::SquaredCosCapV2,
            beta_start: 1e-4,
            beta_end: 0.02,
            prediction_type: PredictionType::Epsilon,
            clip_sample: true,
            clip_sample_range: 1.0,
            num_inference_steps: None,
            do_mask_loss_for_padding: false,
        }
    }
}

impl DiffusionConfig {
    pub fn new(input_features: PolicyFeatures, output_features: PolicyFeatures) -> Self {
        Self {
            input_features,
            output_features,
            ..Default::default()
        }
    }

    pub fn with_features(mut self, input_features: PolicyFeatures, output_features: PolicyFeatures) -> Self {
        self.input_features = input_features;
        self.output_features = output_features;
        self
    }

    /// Frame offsets of the observation history, oldest first: `1 - n_obs_steps ..= 0`.
    pub fn observation_delta_indices(&self) -> Vec<i64> {
        let n = self.n_obs_steps as i64;
        (1 - n..=0).collect()
    }

    /// Frame offsets of the action trajectory, aligned with the first observation frame.
    pub fn action_delta_indices(&self) -> Vec<i64> {
        let start = 1 - self.n_obs_steps as i64;
        (start..start + self.horizon as i64).collect()
    }

    pub fn normalization_mode(&self, ty: FeatureType) -> NormalizationMode {
        self.normalization_mapping
            .get(&ty)
            .copied()
            .unwrap_or(NormalizationMode::Identity)
    }

    fn inputs_of(&self, ty: FeatureType) -> impl Iterator<Item = (&String, &PolicyFeature)> + '_ {
        self.input_features.iter().filter(move |(_, ft)| ft.ty == ty)
    }

    /// Camera features, in key order.
    pub fn image_features(&self) -> Vec<(String, PolicyFeature)> {
        self.inputs_of(FeatureType::Visual)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn state_features(&self) -> Vec<(String, PolicyFeature)> {
        self.inputs_of(FeatureType::State)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn env_state_feature(&self) -> Option<(String, PolicyFeature)> {
        self.inputs_of(FeatureType::Env)
            .next()
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    pub fn action_feature(&self) -> PolicyResult<(String, PolicyFeature)> {
        self.output_features
            .iter()
            .find(|(_, ft)| ft.ty == FeatureType::Action)
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or_else(|| PolicyError::InvalidConfig("no action output feature".to_string()))
    }

    pub fn action_dim(&self) -> PolicyResult<usize> {
        Ok(self.action_feature()?.1.numel())
    }

    pub fn inference_steps(&self) -> usize {
        self.num_inference_steps.unwrap_or(self.num_train_timesteps)
    }

    pub fn validate(&self) -> PolicyResult<()> {
        let invalid = |msg: String| Err(PolicyError::InvalidConfig(msg));
        if self.n_obs_steps == 0 || self.horizon == 0 || self.n_action_steps == 0 {
            return invalid("n_obs_steps, horizon and n_action_steps must be positive".into());
        }
        if self.n_action_steps + self.n_obs_steps > self.horizon + 1 {
            return invalid(format!(
                "n_action_steps ({}) must be <= horizon - n_obs_steps + 1 ({})",
                self.n_action_steps,
                (self.horizon + 1).saturating_sub(self.n_obs_steps)
            ));
        }
        let actions = self
            .output_features
            .values()
            .filter(|ft| ft.ty == FeatureType::Action)
            .count();
        if actions != 1 || self.output_features.len() != 1 {
            return invalid(format!(
                "expected exactly one action output feature, got {:?}",
                self.output_features.keys().collect::<Vec<_>>()
            ));
        }
        if self.input_features.is_empty() {
            return invalid("at least one state, environment or image input is required".into());
        }
        if self.inputs_of(FeatureType::Env).count() > 1 {
            return invalid("at most one environment state input is supported".into());
        }

        let images = self.image_features();
        if let Some((first_key, first)) = images.first() {
            for (key, ft) in &images {
                if ft.shape.len() != 3 {
                    return invalid(format!("{key}: image shape {:?} is not (c, h, w)", ft.shape));
                }
                if ft.shape != first.shape {
                    return invalid(format!(
                        "{key} has shape {:?} but {first_key} has {:?}; cameras must match",
                        ft.shape, first.shape
                    ));
                }
            }
            if let Some([ch, cw]) = self.crop_shape {
                if ch == 0 || cw == 0 || ch > first.shape[1] || cw > first.shape[2] {
                    return invalid(format!(
                        "crop_shape [{ch}, {cw}] does not fit image shape {:?}",
                        first.shape
                    ));
                }
            }
        }

        if self.diffusion_step_embed_dim < 4 || self.diffusion_step_embed_dim % 2 != 0 {
            return invalid("diffusion_step_embed_dim must be even and >= 4".into());
        }
        if self.num_train_timesteps == 0 {
            return invalid("num_train_timesteps must be positive".into());
        }
        let steps = self.inference_steps();
        if steps == 0 || steps > self.num_train_timesteps {
            return invalid(format!(
                "num_inference_steps ({steps}) must be in 1..={}",
                self.num_train_timesteps
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pusht_config() -> DiffusionConfig {
        let mut inputs = PolicyFeatures::new();
        inputs.insert(
            "observation.image".into(),
            PolicyFeature {
                ty: FeatureType::Visual,
                shape: vec![3, 96, 96],
            },
        );
        inputs.insert(
            "observation.state".into(),
            PolicyFeature {
                ty: FeatureType::State,
                shape: vec![2],
            },
        );
        let mut outputs = PolicyFeatures::new();
        outputs.insert(
            "action".into(),
            PolicyFeature {
                ty: FeatureType::Action,
                shape: vec![2],
            },
        );
        DiffusionConfig::new(inputs, outputs)
    }

    #[test]
    fn default_delta_indices_match_pusht_offsets() {
        let cfg = pusht_config();
        assert_eq!(cfg.observation_delta_indices(), vec![-1, 0]);
        let actions = cfg.action_delta_indices();
        assert_eq!(actions.len(), 16);
        assert_eq!(actions.first(), Some(&-1));
        assert_eq!(actions.last(), Some(&14));
        cfg.validate().unwrap();
    }

    #[test]
    fn too_many_action_steps_is_rejected() {
        let cfg = DiffusionConfig {
            n_action_steps: 16,
            ..pusht_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn crop_larger_than_image_is_rejected() {
        let cfg = DiffusionConfig {
            crop_shape: Some([128, 128]),
            ..pusht_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: DiffusionConfig =
            serde_json::from_str(r#"{"horizon": 8, "beta_schedule": "linear"}"#).unwrap();
        assert_eq!(cfg.horizon, 8);
        assert_eq!(cfg.n_obs_steps, 2);
        assert_eq!(cfg.beta_schedule, BetaSchedule::Linear);
        assert_eq!(
            cfg.normalization_mode(FeatureType::Visual),
            NormalizationMode::MeanStd
        );
    }

    #[test]
    fn serialized_config_carries_only_policy_settings() {
        // Sampling and optimizer settings belong to the training run, not the saved policy.
        let json = serde_json::to_value(pusht_config()).unwrap();
        let keys: Vec<&String> = json.as_object().unwrap().keys().collect();
        assert!(keys.iter().all(|k| !k.starts_with("optimizer_")), "{keys:?}");
        assert!(!keys.iter().any(|k| *k == "drop_n_last_frames"), "{keys:?}");
        assert!(keys.iter().any(|k| *k == "horizon"));
    }
}
