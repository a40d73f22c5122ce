#![recursion_limit = "256"]
//! Offline diffusion-policy training on LeRobot-format datasets.

pub mod amp;
pub mod config;
pub mod device;
pub mod runtime_env;
pub mod train;

pub use amp::{GradScaler, GradScalerConfig};
pub use config::{TrainArgs, TrainConfig};
pub use device::{
    log_memory_report, memory_report, validate_backend_choice, BackendKind, MemoryReport,
    TrainAutodiff, TrainBackend,
};
pub use runtime_env::RuntimeEnv;
pub use train::{
    build_delta_indices, build_delta_timestamps, run_train, train_policy, train_with_config,
    LoopOptions, TrainReport,
};
