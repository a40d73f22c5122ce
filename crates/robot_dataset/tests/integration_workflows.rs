//! Integration tests for robot_dataset workflows:
//! 1. Metadata → policy features → delta timestamps
//! 2. Parquet episodes → padded time-offset samples
//! 3. Dataset → episode-aware batch iteration

use arrow_array::types::Float32Type;
use arrow_array::{ArrayRef, BinaryArray, Float32Array, Int64Array, ListArray, RecordBatch, StringArray, StructArray};
use arrow_schema::{DataType, Field};
use burn_ndarray::NdArray;
use parquet::arrow::ArrowWriter;
use robot_dataset::{
    dataset_to_policy_features, partition_features, BatchLoader, DatasetMetadata, DeltaTimestamps,
    FeatureType, LeRobotDataset, LoaderConfig, SamplerConfig,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

type B = NdArray<f32>;

const FPS: f32 = 10.0;

fn write_info(root: &Path, episodes: &[usize]) -> anyhow::Result<()> {
    let total: usize = episodes.iter().sum();
    let info = serde_json::json!({
        "codebase_version": "v2.0",
        "robot_type": "synthetic",
        "total_episodes": episodes.len(),
        "total_frames": total,
        "total_tasks": 1,
        "chunks_size": 1000,
        "fps": FPS,
        "data_path": "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet",
        "features": {
            "observation.image": {"dtype": "image", "shape": [4, 4, 3], "names": ["height", "width", "channel"]},
            "observation.state": {"dtype": "float32", "shape": [2], "names": ["x", "y"]},
            "action": {"dtype": "float32", "shape": [2], "names": ["x", "y"]},
            "episode_index": {"dtype": "int64", "shape": [1]},
            "frame_index": {"dtype": "int64", "shape": [1]},
            "index": {"dtype": "int64", "shape": [1]},
            "timestamp": {"dtype": "float32", "shape": [1]}
        }
    });
    fs::create_dir_all(root.join("meta"))?;
    fs::write(root.join("meta/info.json"), serde_json::to_vec_pretty(&info)?)?;

    let stats = serde_json::json!({
        "observation.state": {"mean": [0.0, 0.0], "std": [1.0, 1.0], "min": [0.0, 0.0], "max": [100.0, 100.0]},
        "action": {"mean": [0.0, 0.0], "std": [1.0, 1.0], "min": [0.0, 0.0], "max": [100.0, 100.0]},
        "observation.image": {
            "mean": [[[0.5]], [[0.5]], [[0.5]]],
            "std": [[[0.2]], [[0.2]], [[0.2]]],
            "min": [[[0.0]], [[0.0]], [[0.0]]],
            "max": [[[1.0]], [[1.0]], [[1.0]]]
        }
    });
    fs::write(root.join("meta/stats.json"), serde_json::to_vec(&stats)?)?;

    let lines: Vec<String> = episodes
        .iter()
        .enumerate()
        .map(|(i, len)| format!(r#"{{"episode_index": {i}, "length": {len}, "tasks": ["push"]}}"#))
        .collect();
    fs::write(root.join("meta/episodes.jsonl"), lines.join("\n"))?;
    Ok(())
}

fn png_bytes(shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_fn(4, 4, |_, _| image::Rgb([shade, 0, 255]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("encode png");
    out
}

/// Frame `k` of episode `ep` at global index `g` carries state = action = [g, k].
fn write_episode(root: &Path, ep: usize, len: usize, first_index: usize) -> anyhow::Result<()> {
    let rows: Vec<usize> = (0..len).collect();
    let vec_rows = |f: &dyn Fn(usize) -> [f32; 2]| {
        ListArray::from_iter_primitive::<Float32Type, _, _>(
            rows.iter().map(|k| Some(f(*k).into_iter().map(Some).collect::<Vec<_>>())),
        )
    };
    let state = vec_rows(&|k| [(first_index + k) as f32, k as f32]);
    let action = vec_rows(&|k| [(first_index + k) as f32, k as f32]);
    let images = StructArray::from(vec![
        (
            Arc::new(Field::new("bytes", DataType::Binary, true)),
            Arc::new(BinaryArray::from_iter_values(rows.iter().map(|k| png_bytes((*k * 40) as u8))))
                as ArrayRef,
        ),
        (
            Arc::new(Field::new("path", DataType::Utf8, true)),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|k| format!("frame_{k:06}.png"))))
                as ArrayRef,
        ),
    ]);

    let batch = RecordBatch::try_from_iter(vec![
        ("observation.image", Arc::new(images) as ArrayRef),
        ("observation.state", Arc::new(state) as ArrayRef),
        ("action", Arc::new(action) as ArrayRef),
        ("episode_index", Arc::new(Int64Array::from(vec![ep as i64; len])) as ArrayRef),
        ("frame_index", Arc::new(Int64Array::from_iter_values(rows.iter().map(|k| *k as i64))) as ArrayRef),
        ("index", Arc::new(Int64Array::from_iter_values(rows.iter().map(|k| (first_index + k) as i64))) as ArrayRef),
        ("timestamp", Arc::new(Float32Array::from_iter_values(rows.iter().map(|k| *k as f32 / FPS))) as ArrayRef),
    ])?;

    let dir = root.join("data/chunk-000");
    fs::create_dir_all(&dir)?;
    let file = fs::File::create(dir.join(format!("episode_{ep:06}.parquet")))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

fn synthetic_dataset(root: &Path, episodes: &[usize]) -> anyhow::Result<DatasetMetadata> {
    write_info(root, episodes)?;
    let mut first = 0;
    for (ep, len) in episodes.iter().enumerate() {
        write_episode(root, ep, *len, first)?;
        first += len;
    }
    Ok(DatasetMetadata::load("synthetic/pusht", Some(root))?)
}

fn deltas() -> DeltaTimestamps {
    let mut d = DeltaTimestamps::new();
    d.insert("observation.state".into(), vec![-0.1, 0.0]);
    d.insert("observation.image".into(), vec![-0.1, 0.0]);
    d.insert("action".into(), vec![-0.1, 0.0, 0.1, 0.2]);
    d
}

#[test]
fn workflow_metadata_to_policy_features() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let meta = synthetic_dataset(tmp.path(), &[5, 4])?;
    assert_eq!(meta.fps(), FPS);
    assert_eq!(meta.episode_indices(), vec![0, 1]);
    assert_eq!(meta.stats()["observation.image"].shape, vec![3, 1, 1]);

    let features = dataset_to_policy_features(meta.features())?;
    let (inputs, outputs) = partition_features(&features);
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs["observation.image"].ty, FeatureType::Visual);
    assert_eq!(inputs["observation.image"].shape, vec![3, 4, 4]);
    assert_eq!(outputs["action"].shape, vec![2]);
    Ok(())
}

#[test]
fn workflow_samples_pad_at_episode_boundaries() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let meta = synthetic_dataset(tmp.path(), &[5, 4])?;
    let dataset = LeRobotDataset::open(meta, Some(deltas()), None)?;
    assert_eq!(dataset.len(), 9);
    assert_eq!(dataset.num_episodes(), 2);

    // First frame of episode 1 (global index 5): the -0.1s query is clamped and padded.
    let sample = dataset.get(5)?;
    assert_eq!(sample.episode_index, 1);
    let state = &sample.vectors["observation.state"];
    assert_eq!((state.frames, state.dim), (2, 2));
    assert_eq!(state.data, vec![5.0, 0.0, 5.0, 0.0]);
    assert_eq!(sample.is_pad["observation.state"], vec![true, false]);

    // Last frame of episode 0: future action queries clamp to frame 4.
    let sample = dataset.get(4)?;
    let action = &sample.vectors["action"];
    assert_eq!(action.data, vec![3.0, 3.0, 4.0, 4.0, 4.0, 4.0, 4.0, 4.0]);
    assert_eq!(sample.is_pad["action"], vec![false, false, true, true]);

    let image = &sample.images["observation.image"];
    assert_eq!((image.frames, image.channels, image.height, image.width), (2, 3, 4, 4));
    assert!((image.data[16 * 2] - 1.0).abs() < 1e-6, "blue channel of frame 3 is 255");
    Ok(())
}

#[test]
fn workflow_rejects_off_grid_deltas_and_unknown_keys() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let meta = synthetic_dataset(tmp.path(), &[3])?;

    let mut off_grid = DeltaTimestamps::new();
    off_grid.insert("action".into(), vec![0.0, 0.05]);
    assert!(LeRobotDataset::open(meta.clone(), Some(off_grid), None).is_err());

    let mut unknown = DeltaTimestamps::new();
    unknown.insert("observation.depth".into(), vec![0.0]);
    assert!(LeRobotDataset::open(meta, Some(unknown), None).is_err());
    Ok(())
}

#[test]
fn workflow_loader_drops_last_and_reshuffles() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let meta = synthetic_dataset(tmp.path(), &[5, 4])?;
    let dataset = Arc::new(LeRobotDataset::open(meta, Some(deltas()), None)?);
    let device = Default::default();

    let cfg = LoaderConfig {
        batch_size: 2,
        num_workers: 2,
        drop_last: true,
        sampler: SamplerConfig {
            shuffle: true,
            seed: Some(7),
            drop_n_first_frames: 0,
            drop_n_last_frames: 1,
        },
    };
    let mut loader = BatchLoader::new(dataset, cfg)?;
    // 4 + 3 eligible frames → 3 full batches, the trailing single frame is dropped.
    assert_eq!(loader.num_samples(), 7);
    assert_eq!(loader.batches_per_epoch(), 3);

    let mut seen = Vec::new();
    while let Some(batch) = loader.next_batch::<B>(&device)? {
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.vectors["action"].dims(), [2, 4, 2]);
        assert_eq!(batch.images["observation.image"].dims(), [2, 2, 3, 4, 4]);
        assert_eq!(batch.is_pad["action"].dims(), [2, 4]);
        seen.extend(batch.index);
    }
    assert_eq!(seen.len(), 6);
    assert!(!seen.contains(&4) && !seen.contains(&8), "last frame of each episode is dropped");

    loader.start_epoch();
    assert_eq!(loader.epoch(), 1);
    assert!(loader.next_batch::<B>(&device)?.is_some());
    Ok(())
}

fn population_stats(values: &[f32]) -> serde_json::Value {
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    serde_json::json!({"mean": [mean], "std": [var.sqrt()], "min": [min], "max": [max], "count": [values.len()]})
}

#[test]
fn workflow_v21_episode_stats_are_combined() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    synthetic_dataset(tmp.path(), &[5, 4])?;
    fs::remove_file(tmp.path().join("meta/stats.json"))?;

    // Global frame index per episode, as stored in state/action dimension 0.
    let episodes: [Vec<f32>; 2] = [(0..5).map(|g| g as f32).collect(), (5..9).map(|g| g as f32).collect()];
    let image = serde_json::json!({
        "mean": [[[0.5]], [[0.5]], [[0.5]]],
        "std": [[[0.2]], [[0.2]], [[0.2]]],
        "min": [[[0.0]], [[0.0]], [[0.0]]],
        "max": [[[1.0]], [[1.0]], [[1.0]]],
        "count": [5]
    });
    let lines: Vec<String> = episodes
        .iter()
        .enumerate()
        .map(|(ep, values)| {
            serde_json::json!({
                "episode_index": ep,
                "stats": {
                    "action": population_stats(values),
                    "observation.state": population_stats(values),
                    "observation.image": image,
                }
            })
            .to_string()
        })
        .collect();
    fs::write(tmp.path().join("meta/episodes_stats.jsonl"), lines.join("\n"))?;

    let meta = DatasetMetadata::load("synthetic/pusht", Some(tmp.path()))?;
    let action = &meta.stats()["action"];
    let all: Vec<f32> = (0..9).map(|g| g as f32).collect();
    let mean = all.iter().sum::<f32>() / 9.0;
    let std = (all.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 9.0).sqrt();
    assert!((action.mean[0] - mean).abs() < 1e-4, "{action:?}");
    assert!((action.std[0] - std).abs() < 1e-4, "{action:?}");
    assert_eq!((action.min[0], action.max[0]), (0.0, 8.0));
    assert_eq!(meta.stats()["observation.image"].shape, vec![3, 1, 1]);
    assert!((meta.stats()["observation.image"].std[1] - 0.2).abs() < 1e-6);
    Ok(())
}
