use crate::amp::{GradScaler, GradScalerConfig};
use crate::config::{TrainArgs, TrainConfig};
use crate::device::{log_memory_report, validate_backend_choice, TrainAutodiff};
use crate::runtime_env::RuntimeEnv;
use anyhow::Context;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use policies::{DiffusionConfig, DiffusionModel, DiffusionPolicy};
use robot_dataset::{
    dataset_to_policy_features, delta_timestamps_from_indices, partition_features, BatchLoader,
    DatasetMetadata, DeltaIndices, DeltaTimestamps, FeatureType, LeRobotDataset,
};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainReport {
    /// Loop iterations run, including ones whose optimizer step was skipped.
    pub steps: usize,
    /// Iterations skipped because the scaled gradients overflowed.
    pub skipped_steps: usize,
    pub last_loss: Option<f32>,
    pub losses: Vec<f32>,
}

/// Loop settings taken from `TrainConfig`.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub training_steps: usize,
    pub log_freq: usize,
    pub lr: f64,
    pub mixed_precision: bool,
    pub grad_scaler: GradScalerConfig,
}

impl From<&TrainConfig> for LoopOptions {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            training_steps: cfg.training_steps,
            log_freq: cfg.log_freq,
            lr: cfg.lr,
            mixed_precision: cfg.mixed_precision,
            grad_scaler: cfg.grad_scaler.clone(),
        }
    }
}

/// CLI entry point: runtime env, device report, then a full training run on `TrainBackend`.
pub fn run_train(args: TrainArgs) -> anyhow::Result<TrainReport> {
    let cfg = TrainConfig::resolve(&args)?;
    validate_backend_choice(cfg.backend)?;

    let runtime = RuntimeEnv::from_env();
    runtime.apply();
    log_memory_report();

    let device = <TrainAutodiff as burn::tensor::backend::Backend>::Device::default();
    train_with_config::<TrainAutodiff>(&cfg, &device)
}

/// Observation inputs use the observation offsets, the action output the action offsets.
pub fn build_delta_indices(config: &DiffusionConfig) -> DeltaIndices {
    let mut indices = DeltaIndices::new();
    for key in config.input_features.keys() {
        indices.insert(key.clone(), config.observation_delta_indices());
    }
    for (key, ft) in config.output_features.iter() {
        if ft.ty == FeatureType::Action {
            indices.insert(key.clone(), config.action_delta_indices());
        }
    }
    indices
}

pub fn build_delta_timestamps(config: &DiffusionConfig, fps: f32) -> DeltaTimestamps {
    delta_timestamps_from_indices(&build_delta_indices(config), fps)
}

pub fn train_with_config<B: AutodiffBackend>(
    cfg: &TrainConfig,
    device: &B::Device,
) -> anyhow::Result<TrainReport> {
    fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("failed to create {}", cfg.output_dir.display()))?;

    let meta = DatasetMetadata::load(&cfg.repo_id, cfg.root.as_deref())
        .with_context(|| format!("failed to load metadata for {}", cfg.repo_id))?;
    let features = dataset_to_policy_features(meta.features())?;
    let (mut input_features, output_features) = partition_features(&features);
    for key in meta.video_keys() {
        if input_features.remove(&key).is_some() {
            warn!(feature = %key, "video-backed camera cannot be decoded; dropped from policy inputs");
        }
    }

    let config = cfg
        .policy
        .clone()
        .with_features(input_features, output_features);
    config.validate()?;

    let mut policy = DiffusionPolicy::<B>::new(config.clone(), meta.stats(), device)?;
    policy.train();
    if let Some(seed) = cfg.seed {
        policy.seed(seed);
        B::seed(seed);
    }
    info!(
        params = policy.num_params(),
        inputs = ?config.input_features.keys().collect::<Vec<_>>(),
        "policy ready"
    );

    let fps = meta.fps();
    let delta_timestamps = build_delta_timestamps(&config, fps);
    info!("horizon: {}", config.horizon);
    info!("observation delta indices: {:?}", config.observation_delta_indices());
    info!("action delta indices: {:?}", config.action_delta_indices());

    let dataset = LeRobotDataset::open_with_tolerance(
        meta,
        Some(delta_timestamps),
        cfg.episodes.as_deref(),
        cfg.tolerance_s,
    )?;
    info!(
        frames = dataset.len(),
        episodes = dataset.num_episodes(),
        fps,
        "dataset loaded"
    );

    let mut optim = cfg.adam_config().init();
    let mut loader = BatchLoader::new(Arc::new(dataset), cfg.loader_config())?;

    let (policy, report) = train_policy(policy, &mut optim, &mut loader, &cfg.into(), device)?;

    policy.save_pretrained(&cfg.output_dir)?;
    info!(
        dir = %cfg.output_dir.display(),
        steps = report.steps,
        skipped = report.skipped_steps,
        "training finished"
    );
    Ok(report)
}

/// Run exactly `opts.training_steps` iterations, starting a new epoch whenever the loader
/// runs dry.
pub fn train_policy<B, O>(
    mut policy: DiffusionPolicy<B>,
    optim: &mut O,
    loader: &mut BatchLoader,
    opts: &LoopOptions,
    device: &B::Device,
) -> anyhow::Result<(DiffusionPolicy<B>, TrainReport)>
where
    B: AutodiffBackend,
    O: Optimizer<DiffusionModel<B>, B>,
{
    if loader.batches_per_epoch() == 0 {
        anyhow::bail!(
            "data loader yields no batches ({} samples, batch size {}, drop_last {})",
            loader.num_samples(),
            loader.config().batch_size,
            loader.config().drop_last
        );
    }
    let mut scaler = if opts.mixed_precision {
        GradScaler::new(opts.grad_scaler.clone())
    } else {
        GradScaler::disabled()
    };
    let mut report = TrainReport::default();

    let mut step = 0;
    while step < opts.training_steps {
        let Some(batch) = loader.next_batch::<B>(device)? else {
            loader.start_epoch();
            continue;
        };

        let output = policy.forward(&batch)?;
        let loss: f32 = output.loss.clone().into_scalar().elem();

        let grads = scaler.scale(output.loss).backward();
        let grads = GradientsParams::from_grads(grads, policy.model());
        let (grads, found_inf) = scaler.unscale_and_check(policy.model(), grads);
        if found_inf {
            report.skipped_steps += 1;
            warn!(step, scale = scaler.current_scale(), "non-finite gradients, optimizer step skipped");
        } else {
            policy = policy.apply_gradients(optim, opts.lr, grads);
        }
        scaler.update(found_inf);

        if step % opts.log_freq == 0 {
            info!("step: {step} loss: {loss:.3}");
        }
        report.losses.push(loss);
        report.last_loss = Some(loss);
        step += 1;
    }
    report.steps = step;
    Ok((policy, report))
}
