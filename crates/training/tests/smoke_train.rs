//! End-to-end training runs on a small synthetic LeRobot dataset (numeric features plus a
//! video-backed camera that cannot be decoded and is dropped).

use arrow_array::types::Float32Type;
use arrow_array::{ArrayRef, Float32Array, Int64Array, ListArray, RecordBatch};
use burn::backend::Autodiff;
use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use parquet::arrow::ArrowWriter;
use policies::{saved_policy_type, DiffusionConfig, DiffusionPolicy};
use robot_dataset::{
    dataset_to_policy_features, partition_features, BatchLoader, DatasetMetadata, LeRobotDataset,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use training::{
    build_delta_timestamps, run_train, train_policy, train_with_config, GradScalerConfig,
    LoopOptions, TrainArgs, TrainConfig,
};

type B = NdArray<f32>;

const FPS: f32 = 10.0;

fn write_dataset(root: &Path, episodes: &[usize]) -> anyhow::Result<()> {
    let info = serde_json::json!({
        "codebase_version": "v2.0",
        "total_episodes": episodes.len(),
        "total_frames": episodes.iter().sum::<usize>(),
        "chunks_size": 1000,
        "fps": FPS,
        "data_path": "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet",
        "video_path": "videos/chunk-{episode_chunk:03d}/{video_key}/episode_{episode_index:06d}.mp4",
        "features": {
            "observation.image": {"dtype": "video", "shape": [8, 8, 3], "names": ["height", "width", "channel"]},
            "observation.state": {"dtype": "float32", "shape": [2]},
            "action": {"dtype": "float32", "shape": [2]},
            "episode_index": {"dtype": "int64", "shape": [1]},
            "frame_index": {"dtype": "int64", "shape": [1]},
            "index": {"dtype": "int64", "shape": [1]},
            "timestamp": {"dtype": "float32", "shape": [1]}
        }
    });
    fs::create_dir_all(root.join("meta"))?;
    fs::write(root.join("meta/info.json"), serde_json::to_vec_pretty(&info)?)?;
    let stats = serde_json::json!({
        "observation.state": {"mean": [5.0, 5.0], "std": [3.0, 3.0], "min": [0.0, 0.0], "max": [12.0, 12.0]},
        "action": {"mean": [5.0, 5.0], "std": [3.0, 3.0], "min": [0.0, 0.0], "max": [12.0, 12.0]}
    });
    fs::write(root.join("meta/stats.json"), serde_json::to_vec(&stats)?)?;
    let lines: Vec<String> = episodes
        .iter()
        .enumerate()
        .map(|(i, len)| format!(r#"{{"episode_index": {i}, "length": {len}}}"#))
        .collect();
    fs::write(root.join("meta/episodes.jsonl"), lines.join("\n"))?;

    let dir = root.join("data/chunk-000");
    fs::create_dir_all(&dir)?;
    let mut first = 0usize;
    for (ep, len) in episodes.iter().copied().enumerate() {
        let rows: Vec<usize> = (0..len).collect();
        let pairs = |offset: f32| {
            ListArray::from_iter_primitive::<Float32Type, _, _>(rows.iter().map(|k| {
                let v = *k as f32 + offset;
                Some(vec![Some(v), Some(12.0 - v)])
            }))
        };
        let batch = RecordBatch::try_from_iter(vec![
            ("observation.state", Arc::new(pairs(0.0)) as ArrayRef),
            ("action", Arc::new(pairs(1.0)) as ArrayRef),
            ("episode_index", Arc::new(Int64Array::from(vec![ep as i64; len])) as ArrayRef),
            ("frame_index", Arc::new(Int64Array::from_iter_values(rows.iter().map(|k| *k as i64))) as ArrayRef),
            ("index", Arc::new(Int64Array::from_iter_values(rows.iter().map(|k| (first + k) as i64))) as ArrayRef),
            ("timestamp", Arc::new(Float32Array::from_iter_values(rows.iter().map(|k| *k as f32 / FPS))) as ArrayRef),
        ])?;
        let file = fs::File::create(dir.join(format!("episode_{ep:06}.parquet")))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
        writer.write(&batch)?;
        writer.close()?;
        first += len;
    }
    Ok(())
}

/// Replace `meta/stats.json` with v2.1 per-episode stats (frame values `k` and `12 - k` for
/// state, `k + 1` and `11 - k` for action).
fn use_episode_stats(root: &Path, episodes: &[usize]) -> anyhow::Result<()> {
    fs::remove_file(root.join("meta/stats.json"))?;
    let entry = |lo: f32, hi: f32, len: usize| {
        let mean = (lo + hi) / 2.0;
        let var = ((len * len - 1) as f32) / 12.0;
        serde_json::json!({
            "min": [lo, 12.0 - hi],
            "max": [hi, 12.0 - lo],
            "mean": [mean, 12.0 - mean],
            "std": [var.sqrt(), var.sqrt()],
            "count": [len]
        })
    };
    let lines: Vec<String> = episodes
        .iter()
        .enumerate()
        .map(|(ep, len)| {
            let last = (*len - 1) as f32;
            serde_json::json!({
                "episode_index": ep,
                "stats": {
                    "observation.state": entry(0.0, last, *len),
                    "action": entry(1.0, last + 1.0, *len),
                }
            })
            .to_string()
        })
        .collect();
    fs::write(root.join("meta/episodes_stats.jsonl"), lines.join("\n"))?;
    Ok(())
}

fn small_policy() -> DiffusionConfig {
    DiffusionConfig {
        horizon: 4,
        n_action_steps: 2,
        hidden_dims: vec![16],
        diffusion_step_embed_dim: 8,
        num_train_timesteps: 10,
        ..Default::default()
    }
}

#[test]
fn mixed_precision_run_saves_a_loadable_policy() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("dataset");
    write_dataset(&root, &[8, 6])?;
    let out = tmp.path().join("outputs/train/toy");

    let cfg = TrainConfig {
        repo_id: "synthetic/toy".into(),
        root: Some(root),
        output_dir: out.clone(),
        training_steps: 5,
        batch_size: 2,
        num_workers: 0,
        seed: Some(3),
        policy: small_policy(),
        ..Default::default()
    };
    let device = Default::default();
    let report = train_with_config::<Autodiff<B>>(&cfg, &device)?;

    assert_eq!(report.steps, 5);
    assert_eq!(report.losses.len(), 5);
    assert!(report.losses.iter().all(|l| l.is_finite()));
    assert_eq!(report.last_loss, report.losses.last().copied());
    assert_eq!(report.skipped_steps, 0);

    assert_eq!(saved_policy_type(&out)?, "diffusion");
    let policy = DiffusionPolicy::<B>::from_pretrained(&out, &device)?;
    // The undecodable video camera is not a policy input.
    assert_eq!(
        policy.config().input_features.keys().collect::<Vec<_>>(),
        vec!["observation.state"]
    );
    assert_eq!(policy.config().horizon, 4);
    Ok(())
}

#[test]
fn plain_loop_wraps_epochs_until_step_budget() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("dataset");
    write_dataset(&root, &[5, 5])?;

    // 10 frames, batch 4, drop_last: 2 batches per epoch, so 7 steps span 4 epochs.
    let cfg = TrainConfig {
        root: Some(root),
        output_dir: tmp.path().join("out"),
        training_steps: 7,
        log_freq: 3,
        batch_size: 4,
        num_workers: 2,
        mixed_precision: false,
        seed: Some(11),
        policy: small_policy(),
        ..Default::default()
    };
    let report = train_with_config::<Autodiff<B>>(&cfg, &Default::default())?;
    assert_eq!(report.steps, 7);
    assert_eq!(report.losses.len(), 7);
    Ok(())
}

#[test]
fn oversized_batch_with_drop_last_is_an_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("dataset");
    write_dataset(&root, &[3])?;
    let cfg = TrainConfig {
        root: Some(root),
        output_dir: tmp.path().join("out"),
        training_steps: 2,
        batch_size: 8,
        num_workers: 0,
        policy: small_policy(),
        ..Default::default()
    };
    let err = train_with_config::<Autodiff<B>>(&cfg, &Default::default()).unwrap_err();
    assert!(err.to_string().contains("no batches"), "{err:#}");
    Ok(())
}

#[test]
fn cli_entry_point_runs_with_default_policy() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("dataset");
    write_dataset(&root, &[6])?;
    let out = tmp.path().join("out");

    let args = TrainArgs {
        repo_id: Some("synthetic/toy".into()),
        root: Some(root),
        output_dir: Some(out.clone()),
        steps: Some(2),
        batch_size: Some(2),
        num_workers: Some(1),
        seed: Some(5),
        ..Default::default()
    };
    let report = run_train(args)?;
    assert_eq!(report.steps, 2);
    assert!(out.join("model.bin").is_file());
    assert!(std::env::var("PYTORCH_CUDA_ALLOC_CONF").is_ok());
    Ok(())
}

#[test]
fn trains_on_dataset_with_per_episode_stats_only() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("dataset");
    write_dataset(&root, &[6, 4])?;
    use_episode_stats(&root, &[6, 4])?;
    let out = tmp.path().join("out");

    let cfg = TrainConfig {
        root: Some(root),
        output_dir: out.clone(),
        training_steps: 2,
        batch_size: 2,
        num_workers: 0,
        seed: Some(4),
        policy: small_policy(),
        ..Default::default()
    };
    let device = Default::default();
    let report = train_with_config::<Autodiff<B>>(&cfg, &device)?;
    assert_eq!(report.steps, 2);

    let policy = DiffusionPolicy::<B>::from_pretrained(&out, &device)?;
    let state = &policy.stats()["observation.state"];
    assert_eq!((state.min[0], state.max[0]), (0.0, 5.0));
    assert!(state.mean[0] > 2.0 && state.mean[0] < 2.5, "{state:?}");
    Ok(())
}

#[test]
fn overflowing_scale_skips_every_update_but_ends_on_budget() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("dataset");
    write_dataset(&root, &[6, 6])?;

    let cfg = TrainConfig {
        root: Some(root.clone()),
        training_steps: 5,
        batch_size: 2,
        num_workers: 0,
        seed: Some(2),
        grad_scaler: GradScalerConfig {
            init_scale: f32::INFINITY,
            ..Default::default()
        },
        policy: small_policy(),
        ..Default::default()
    };
    let device = Default::default();

    let meta = DatasetMetadata::load(&cfg.repo_id, Some(&root))?;
    let features = dataset_to_policy_features(meta.features())?;
    let (mut inputs, outputs) = partition_features(&features);
    inputs.remove("observation.image");
    let config = cfg.policy.clone().with_features(inputs, outputs);
    let deltas = build_delta_timestamps(&config, meta.fps());
    let mut policy = DiffusionPolicy::<Autodiff<B>>::new(config, meta.stats(), &device)?;
    policy.train();
    policy.seed(2);
    let dataset = LeRobotDataset::open(meta, Some(deltas), None)?;
    let mut loader = BatchLoader::new(Arc::new(dataset), cfg.loader_config())?;
    let mut optim = cfg.adam_config().init();

    let cond = Tensor::<B, 2>::ones([1, 4], &device);
    let noisy = Tensor::<B, 3>::ones([1, 4, 2], &device);
    let before = policy
        .valid()
        .model()
        .forward(noisy.clone(), &[3], cond.clone())
        .into_data()
        .to_vec::<f32>()
        .unwrap();

    let opts = LoopOptions::from(&cfg);
    let (policy, report) = train_policy(policy, &mut optim, &mut loader, &opts, &device)?;
    assert_eq!(report.steps, 5);
    assert_eq!(report.skipped_steps, 5);
    assert_eq!(report.losses.len(), 5);

    let after = policy
        .valid()
        .model()
        .forward(noisy, &[3], cond)
        .into_data()
        .to_vec::<f32>()
        .unwrap();
    assert_eq!(before, after, "skipped steps must leave the weights untouched");
    Ok(())
}
