//! Mapping from dataset features to the typed features a policy consumes.

use crate::metadata::FeatureSpec;
use crate::types::{DatasetError, DatasetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const ACTION: &str = "action";
pub const OBS_ENV_STATE: &str = "observation.environment_state";
pub const OBS_PREFIX: &str = "observation";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeatureType {
    State,
    Visual,
    Env,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NormalizationMode {
    Identity,
    MeanStd,
    MinMax,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyFeature {
    #[serde(rename = "type")]
    pub ty: FeatureType,
    /// Per-frame shape; channel-first `(c, h, w)` for visual features.
    pub shape: Vec<usize>,
}

impl PolicyFeature {
    pub fn numel(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }
}

pub type PolicyFeatures = BTreeMap<String, PolicyFeature>;

pub fn dataset_to_policy_features(
    features: &BTreeMap<String, FeatureSpec>,
) -> DatasetResult<PolicyFeatures> {
    let mut out = PolicyFeatures::new();
    for (key, ft) in features {
        let (ty, shape) = if ft.is_camera() {
            (FeatureType::Visual, camera_chw(key, ft)?.to_vec())
        } else if key == OBS_ENV_STATE {
            (FeatureType::Env, ft.shape.clone())
        } else if key.starts_with(OBS_PREFIX) {
            (FeatureType::State, ft.shape.clone())
        } else if key == ACTION {
            (FeatureType::Action, ft.shape.clone())
        } else {
            continue;
        };
        out.insert(key.clone(), PolicyFeature { ty, shape });
    }
    Ok(out)
}

/// Channel-first `(c, h, w)` of a camera feature.
pub fn camera_chw(key: &str, ft: &FeatureSpec) -> DatasetResult<[usize; 3]> {
    match ft.shape.as_slice() {
        [h, w, c] if is_channel_last(ft) => Ok([*c, *h, *w]),
        [c, h, w] => Ok([*c, *h, *w]),
        other => Err(DatasetError::Other(format!(
            "camera feature {key} has shape {other:?}; expected rank 3"
        ))),
    }
}

/// Whether a camera is stored as (h, w, c). Unnamed axes are taken as channel-last, the
/// layout LeRobot writes; named axes are channel-last only when the third is "channel(s)".
fn is_channel_last(ft: &FeatureSpec) -> bool {
    match ft.names.as_ref().and_then(|n| n.as_array()) {
        Some(names) => matches!(
            names.get(2).and_then(|n| n.as_str()),
            Some("channel") | Some("channels")
        ),
        None => true,
    }
}

/// Split into `(inputs, outputs)`: outputs are the `Action` features, inputs everything else.
pub fn partition_features(features: &PolicyFeatures) -> (PolicyFeatures, PolicyFeatures) {
    let (outputs, inputs): (PolicyFeatures, PolicyFeatures) = features
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .partition(|(_, ft)| ft.ty == FeatureType::Action);
    (inputs, outputs)
}
