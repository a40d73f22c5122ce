//! Diffusion policy on Burn.
//!
//! - `config`: hyperparameters and feature layout, with the delta indices a dataset needs
//! - `normalize`: dataset-statistics normalization of inputs and targets
//! - `scheduler`: DDPM noise schedule, forward noising and reverse steps
//! - `diffusion`: the conditional denoiser module
//! - `policy`: training loss and closed-loop action selection
//! - `checkpoint`: save/load of pretrained policy directories

pub mod checkpoint;
pub mod config;
pub mod diffusion;
pub mod error;
pub mod normalize;
pub mod policy;
pub mod scheduler;

pub use checkpoint::{saved_policy_type, CONFIG_FILE, STATS_FILE, WEIGHTS_FILE};
pub use config::{BetaSchedule, DiffusionConfig, PredictionType};
pub use diffusion::DiffusionModel;
pub use error::{PolicyError, PolicyResult};
pub use normalize::Normalizer;
pub use policy::{DiffusionPolicy, Observation, PolicyOutput};
pub use scheduler::DdpmScheduler;
