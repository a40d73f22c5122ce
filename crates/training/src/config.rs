//! Training configuration: defaults < TOML file < environment < command line.

use crate::amp::GradScalerConfig;
use crate::device::BackendKind;
use anyhow::Context;
use burn::optim::AdamConfig;
use clap::Parser;
use policies::DiffusionConfig;
use robot_dataset::{LoaderConfig, SamplerConfig, DEFAULT_TOLERANCE_S};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "train.toml";

pub const ENV_REPO_ID: &str = "TRAIN_REPO_ID";
pub const ENV_DATASET_ROOT: &str = "TRAIN_DATASET_ROOT";
pub const ENV_OUTPUT_DIR: &str = "TRAIN_OUTPUT_DIR";
pub const ENV_STEPS: &str = "TRAIN_STEPS";

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "train",
    about = "Train a diffusion policy on a LeRobot-format dataset"
)]
pub struct TrainArgs {
    /// TOML file with training settings and an optional [policy] table.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Dataset repository id (resolved under the local LeRobot cache unless --root is set).
    #[arg(long)]
    pub repo_id: Option<String>,
    /// Dataset root directory containing meta/ and data/.
    #[arg(long)]
    pub root: Option<PathBuf>,
    /// Directory receiving the trained policy.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Optimizer steps to run.
    #[arg(long)]
    pub steps: Option<usize>,
    /// Log the loss every N steps.
    #[arg(long)]
    pub log_freq: Option<usize>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Loader worker threads (0 loads on the training thread).
    #[arg(long)]
    pub num_workers: Option<usize>,
    /// Learning rate.
    #[arg(long)]
    pub lr: Option<f64>,
    /// Seed for shuffling, crops, diffusion timesteps and backend noise.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Iterate the dataset in order.
    #[arg(long)]
    pub no_shuffle: bool,
    /// Keep the final partial batch of each epoch.
    #[arg(long)]
    pub keep_last: bool,
    /// Plain full-precision loop without loss scaling.
    #[arg(long)]
    pub no_mixed_precision: bool,
    /// Backend to use (ndarray or wgpu if enabled).
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub repo_id: String,
    pub root: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub training_steps: usize,
    pub log_freq: usize,
    pub batch_size: usize,
    pub num_workers: usize,
    pub lr: f64,
    pub shuffle: bool,
    pub drop_last: bool,
    /// Frames at the end of each episode never used as a sample start.
    pub drop_n_last_frames: usize,
    pub mixed_precision: bool,
    pub grad_scaler: GradScalerConfig,
    pub seed: Option<u64>,
    /// Episodes to train on; all when unset.
    pub episodes: Option<Vec<usize>>,
    pub tolerance_s: f32,
    pub backend: BackendKind,
    /// Policy hyperparameters; input/output features come from the dataset.
    pub policy: DiffusionConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            repo_id: "lerobot/pusht".to_string(),
            root: None,
            output_dir: PathBuf::from("outputs/train/my_example_pusht_diffusion"),
            training_steps: 5000,
            log_freq: 1,
            batch_size: 1,
            num_workers: 4,
            lr: 1e-4,
            shuffle: true,
            drop_last: true,
            drop_n_last_frames: 0,
            mixed_precision: true,
            grad_scaler: GradScalerConfig::default(),
            seed: None,
            episodes: None,
            tolerance_s: DEFAULT_TOLERANCE_S,
            backend: BackendKind::compiled(),
            policy: DiffusionConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid training config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Resolve the effective configuration for a run.
    pub fn resolve(args: &TrainArgs) -> anyhow::Result<Self> {
        let mut cfg = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.apply_args(args);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup(ENV_REPO_ID) {
            self.repo_id = v;
        }
        if let Some(v) = lookup(ENV_DATASET_ROOT) {
            self.root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(ENV_OUTPUT_DIR) {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_STEPS) {
            self.training_steps = v
                .trim()
                .parse()
                .with_context(|| format!("{ENV_STEPS}={v:?} is not a step count"))?;
        }
        Ok(())
    }

    pub fn apply_args(&mut self, args: &TrainArgs) {
        if let Some(v) = &args.repo_id {
            self.repo_id = v.clone();
        }
        if let Some(v) = &args.root {
            self.root = Some(v.clone());
        }
        if let Some(v) = &args.output_dir {
            self.output_dir = v.clone();
        }
        if let Some(v) = args.steps {
            self.training_steps = v;
        }
        if let Some(v) = args.log_freq {
            self.log_freq = v;
        }
        if let Some(v) = args.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = args.num_workers {
            self.num_workers = v;
        }
        if let Some(v) = args.lr {
            self.lr = v;
        }
        if args.seed.is_some() {
            self.seed = args.seed;
        }
        if let Some(v) = args.backend {
            self.backend = v;
        }
        self.shuffle &= !args.no_shuffle;
        self.drop_last &= !args.keep_last;
        self.mixed_precision &= !args.no_mixed_precision;
    }

    /// Plain Adam with PyTorch's defaults (betas 0.9/0.999, eps 1e-8, no weight decay);
    /// the learning rate is passed per step from `lr`.
    pub fn adam_config(&self) -> AdamConfig {
        AdamConfig::new()
            .with_beta_1(0.9)
            .with_beta_2(0.999)
            .with_epsilon(1e-8)
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            num_workers: self.num_workers,
            drop_last: self.drop_last,
            sampler: SamplerConfig {
                shuffle: self.shuffle,
                seed: self.seed,
                drop_n_first_frames: 0,
                drop_n_last_frames: self.drop_n_last_frames,
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.training_steps == 0 {
            anyhow::bail!("training_steps must be at least 1");
        }
        if self.log_freq == 0 {
            anyhow::bail!("log_freq must be at least 1");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        if self.lr <= 0.0 || !self.lr.is_finite() {
            anyhow::bail!("lr must be a positive number, got {}", self.lr);
        }
        if self.mixed_precision && self.grad_scaler.init_scale <= 0.0 {
            anyhow::bail!("grad_scaler.init_scale must be positive");
        }
        Ok(())
    }
}
