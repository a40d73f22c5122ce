//! Pretrained policy directories.
//!
//! ```text
//! <dir>/config.json   {"type": "diffusion", ...DiffusionConfig}
//! <dir>/stats.json    normalization statistics keyed by feature
//! <dir>/model.bin     Burn full-precision weights
//! ```

use crate::config::DiffusionConfig;
use crate::diffusion::DiffusionModel;
use crate::error::{PolicyError, PolicyResult};
use crate::policy::DiffusionPolicy;
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use robot_dataset::DatasetStats;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const CONFIG_FILE: &str = "config.json";
pub const STATS_FILE: &str = "stats.json";
pub const WEIGHTS_FILE: &str = "model.bin";
pub const POLICY_TYPE: &str = "diffusion";

#[derive(Debug, Serialize, Deserialize)]
struct StoredConfig {
    #[serde(rename = "type")]
    policy_type: String,
    #[serde(flatten)]
    config: DiffusionConfig,
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> PolicyResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|source| PolicyError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> PolicyResult<T> {
    let text = fs::read_to_string(path).map_err(|source| PolicyError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| PolicyError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Policy type recorded in a saved directory, without loading weights.
pub fn saved_policy_type(dir: &Path) -> PolicyResult<String> {
    let stored: StoredConfig = read_json(&dir.join(CONFIG_FILE))?;
    Ok(stored.policy_type)
}

impl<B: Backend> DiffusionPolicy<B> {
    /// Write config, statistics and weights into `dir`, creating it if needed.
    pub fn save_pretrained(&self, dir: &Path) -> PolicyResult<()> {
        fs::create_dir_all(dir).map_err(|source| PolicyError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let stored = StoredConfig {
            policy_type: POLICY_TYPE.to_string(),
            config: self.config().clone(),
        };
        write_json(&dir.join(CONFIG_FILE), &stored)?;
        write_json(&dir.join(STATS_FILE), self.stats())?;

        let weights = dir.join(WEIGHTS_FILE);
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.model()
            .clone()
            .save_file(&weights, &recorder)
            .map_err(|e| PolicyError::Checkpoint {
                path: weights.clone(),
                msg: e.to_string(),
            })?;
        tracing::info!(dir = %dir.display(), "saved pretrained policy");
        Ok(())
    }

    /// Rebuild a policy saved by `save_pretrained`.
    pub fn from_pretrained(dir: &Path, device: &B::Device) -> PolicyResult<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let stored: StoredConfig = read_json(&config_path)?;
        if stored.policy_type != POLICY_TYPE {
            return Err(PolicyError::Checkpoint {
                path: config_path,
                msg: format!(
                    "policy type {:?} cannot be loaded as {POLICY_TYPE:?}",
                    stored.policy_type
                ),
            });
        }
        let stats: DatasetStats = read_json(&dir.join(STATS_FILE))?;

        let weights = dir.join(WEIGHTS_FILE);
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        let model = DiffusionModel::<B>::new(&stored.config, device)?
            .load_file(&weights, &recorder, device)
            .map_err(|e| PolicyError::Checkpoint {
                path: weights.clone(),
                msg: e.to_string(),
            })?;
        Self::from_parts(stored.config, model, &stats, device)
    }
}
