//! Dataset metadata: `meta/info.json`, normalization stats, and `meta/episodes.jsonl`.
//!
//! Stats come from `meta/stats.json` (v2.0) or, when that is absent, from the per-episode
//! entries in `meta/episodes_stats.jsonl` (v2.1) combined into one set.

use crate::types::{DatasetError, DatasetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const INFO_PATH: &str = "meta/info.json";
pub const STATS_PATH: &str = "meta/stats.json";
pub const EPISODES_PATH: &str = "meta/episodes.jsonl";
pub const EPISODES_STATS_PATH: &str = "meta/episodes_stats.jsonl";

const DEFAULT_CHUNKS_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub dtype: String,
    pub shape: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub names: Option<serde_json::Value>,
}

impl FeatureSpec {
    pub fn is_camera(&self) -> bool {
        self.dtype == "image" || self.dtype == "video"
    }

    pub fn is_video(&self) -> bool {
        self.dtype == "video"
    }

    /// Number of scalar values per frame.
    pub fn numel(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }
}

fn default_chunks_size() -> usize {
    DEFAULT_CHUNKS_SIZE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    #[serde(default)]
    pub codebase_version: String,
    #[serde(default)]
    pub robot_type: Option<String>,
    pub total_episodes: usize,
    pub total_frames: usize,
    #[serde(default)]
    pub total_tasks: usize,
    #[serde(default = "default_chunks_size")]
    pub chunks_size: usize,
    pub fps: f32,
    pub data_path: String,
    #[serde(default)]
    pub video_path: Option<String>,
    pub features: BTreeMap<String, FeatureSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeInfo {
    pub episode_index: usize,
    pub length: usize,
    #[serde(default)]
    pub tasks: Vec<String>,
}

/// Per-feature normalization statistics, flattened; `shape` keeps the stored layout
/// (e.g. `[3, 1, 1]` for per-channel image stats).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub shape: Vec<usize>,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
    pub min: Vec<f32>,
    pub max: Vec<f32>,
}

pub type DatasetStats = BTreeMap<String, FeatureStats>;

type RawStats = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// One feature's stats for one episode, with the number of frames they cover.
#[derive(Debug, Clone)]
struct CountedStats {
    stats: FeatureStats,
    count: Option<f64>,
}

#[derive(Deserialize)]
struct EpisodeStatsLine {
    stats: RawStats,
}

#[derive(Debug, Clone)]
pub struct DatasetMetadata {
    pub repo_id: String,
    pub root: PathBuf,
    pub info: DatasetInfo,
    pub stats: DatasetStats,
    pub episodes: Vec<EpisodeInfo>,
}

impl DatasetMetadata {
    /// Load metadata for `repo_id`, from `root` if given, otherwise from the local LeRobot cache.
    pub fn load(repo_id: &str, root: Option<&Path>) -> DatasetResult<Self> {
        let root = match root {
            Some(r) => r.to_path_buf(),
            None => default_dataset_root(repo_id),
        };
        let info_path = root.join(INFO_PATH);
        let info: DatasetInfo = read_json(&info_path)?;
        if info.fps <= 0.0 || !info.fps.is_finite() {
            return Err(DatasetError::Other(format!(
                "{} declares invalid fps {}",
                info_path.display(),
                info.fps
            )));
        }

        let stats_path = root.join(STATS_PATH);
        let episodes_stats_path = root.join(EPISODES_STATS_PATH);
        let stats = if stats_path.exists() {
            let raw: RawStats = read_json(&stats_path)?;
            parse_stats(raw).map_err(|msg| DatasetError::Validation {
                path: stats_path.clone(),
                msg,
            })?
        } else if episodes_stats_path.exists() {
            let per_episode = read_episode_stats(&episodes_stats_path)?;
            let stats = aggregate_stats(&per_episode).map_err(|msg| DatasetError::Validation {
                path: episodes_stats_path.clone(),
                msg,
            })?;
            tracing::debug!(
                episodes = per_episode.len(),
                features = stats.len(),
                "combined per-episode stats"
            );
            stats
        } else {
            tracing::warn!(path = %stats_path.display(), "no stats file; normalization will fail for non-identity features");
            DatasetStats::new()
        };

        let episodes_path = root.join(EPISODES_PATH);
        let episodes = if episodes_path.exists() {
            read_episodes(&episodes_path)?
        } else {
            Vec::new()
        };

        tracing::debug!(
            repo_id,
            root = %root.display(),
            episodes = info.total_episodes,
            frames = info.total_frames,
            fps = info.fps,
            "loaded dataset metadata"
        );
        Ok(Self {
            repo_id: repo_id.to_string(),
            root,
            info,
            stats,
            episodes,
        })
    }

    pub fn fps(&self) -> f32 {
        self.info.fps
    }

    pub fn features(&self) -> &BTreeMap<String, FeatureSpec> {
        &self.info.features
    }

    pub fn stats(&self) -> &DatasetStats {
        &self.stats
    }

    pub fn total_episodes(&self) -> usize {
        self.info.total_episodes
    }

    pub fn video_keys(&self) -> Vec<String> {
        self.info
            .features
            .iter()
            .filter(|(_, ft)| ft.is_video())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn episode_chunk(&self, episode_index: usize) -> usize {
        episode_index / self.info.chunks_size.max(1)
    }

    /// Absolute path of the parquet file holding `episode_index`.
    pub fn episode_data_path(&self, episode_index: usize) -> DatasetResult<PathBuf> {
        let chunk = self.episode_chunk(episode_index);
        let rel = render_path_template(
            &self.info.data_path,
            &[("episode_chunk", chunk), ("episode_index", episode_index)],
        )?;
        Ok(self.root.join(rel))
    }

    /// Episode indices present in the dataset, from episodes.jsonl when available.
    pub fn episode_indices(&self) -> Vec<usize> {
        if self.episodes.is_empty() {
            (0..self.info.total_episodes).collect()
        } else {
            self.episodes.iter().map(|e| e.episode_index).collect()
        }
    }
}

/// Cache root: `$HF_LEROBOT_HOME`, else `$HF_HOME/lerobot`, else `~/.cache/huggingface/lerobot`.
pub fn default_dataset_root(repo_id: &str) -> PathBuf {
    let base = if let Ok(home) = std::env::var("HF_LEROBOT_HOME") {
        PathBuf::from(home)
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        PathBuf::from(hf_home).join("lerobot")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".cache/huggingface/lerobot")
    };
    base.join(repo_id)
}

/// Render `{name}` / `{name:0Nd}` placeholders.
pub fn render_path_template(template: &str, values: &[(&str, usize)]) -> DatasetResult<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            DatasetError::Other(format!("unterminated placeholder in template {template:?}"))
        })?;
        let placeholder = &after[..close];
        let (name, spec) = match placeholder.split_once(':') {
            Some((n, s)) => (n, Some(s)),
            None => (placeholder, None),
        };
        let value = values
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| {
                DatasetError::Other(format!("unknown placeholder {name:?} in template {template:?}"))
            })?;
        match spec {
            Some(spec) => {
                let width = spec
                    .trim_end_matches('d')
                    .trim_start_matches('0')
                    .parse::<usize>()
                    .unwrap_or(0);
                out.push_str(&format!("{value:0width$}"));
            }
            None => out.push_str(&value.to_string()),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> DatasetResult<T> {
    let bytes = fs::read(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| DatasetError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn read_episodes(path: &Path) -> DatasetResult<Vec<EpisodeInfo>> {
    let raw = fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut episodes = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let ep: EpisodeInfo = serde_json::from_str(line).map_err(|source| DatasetError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        episodes.push(ep);
    }
    episodes.sort_by_key(|e| e.episode_index);
    Ok(episodes)
}

fn read_episode_stats(path: &Path) -> DatasetResult<Vec<BTreeMap<String, CountedStats>>> {
    let raw = fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut episodes = Vec::new();
    for (lineno, line) in raw.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let entry: EpisodeStatsLine =
            serde_json::from_str(line).map_err(|source| DatasetError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        let stats = parse_counted_stats(entry.stats).map_err(|msg| DatasetError::Validation {
            path: path.to_path_buf(),
            msg: format!("line {}: {msg}", lineno + 1),
        })?;
        episodes.push(stats);
    }
    Ok(episodes)
}

fn parse_stats(raw: RawStats) -> Result<DatasetStats, String> {
    Ok(parse_counted_stats(raw)?
        .into_iter()
        .map(|(key, counted)| (key, counted.stats))
        .collect())
}

fn parse_counted_stats(raw: RawStats) -> Result<BTreeMap<String, CountedStats>, String> {
    let mut stats = BTreeMap::new();
    for (key, fields) in raw {
        let mut entry = FeatureStats::default();
        let mut count = None;
        for (name, value) in fields {
            let mut flat = Vec::new();
            let mut shape = Vec::new();
            flatten_numbers(&value, 0, &mut flat, &mut shape)
                .map_err(|e| format!("{key}.{name}: {e}"))?;
            match name.as_str() {
                "mean" => entry.mean = flat,
                "std" => entry.std = flat,
                "min" => entry.min = flat,
                "max" => entry.max = flat,
                "count" => {
                    count = flat.first().map(|c| f64::from(*c));
                    continue;
                }
                // quantiles are not used for normalization.
                _ => continue,
            }
            entry.shape = shape;
        }
        stats.insert(key, CountedStats { stats: entry, count });
    }
    Ok(stats)
}

/// Combine per-episode stats: element-wise min/max, count-weighted mean, pooled variance.
fn aggregate_stats(episodes: &[BTreeMap<String, CountedStats>]) -> Result<DatasetStats, String> {
    let mut grouped: BTreeMap<&str, Vec<(&FeatureStats, f64)>> = BTreeMap::new();
    for (i, episode) in episodes.iter().enumerate() {
        for (key, counted) in episode {
            let count = counted
                .count
                .ok_or_else(|| format!("entry {i}: {key} has no count"))?;
            grouped
                .entry(key.as_str())
                .or_default()
                .push((&counted.stats, count));
        }
    }
    let mut stats = DatasetStats::new();
    for (key, entries) in grouped {
        stats.insert(key.to_string(), aggregate_feature(key, &entries)?);
    }
    Ok(stats)
}

fn aggregate_feature(key: &str, entries: &[(&FeatureStats, f64)]) -> Result<FeatureStats, String> {
    let Some((first, _)) = entries.first() else {
        return Err(format!("{key}: no per-episode stats"));
    };
    let dim = first.mean.len();
    let consistent = entries.iter().all(|(s, _)| {
        s.mean.len() == dim && s.std.len() == dim && s.min.len() == dim && s.max.len() == dim
    });
    if !consistent {
        return Err(format!("{key}: per-episode stats differ in size"));
    }
    let total: f64 = entries.iter().map(|(_, c)| c).sum();
    if total <= 0.0 {
        return Err(format!("{key}: total frame count is zero"));
    }

    let mut mean = vec![0.0f64; dim];
    for (s, c) in entries {
        for (acc, m) in mean.iter_mut().zip(&s.mean) {
            *acc += f64::from(*m) * c;
        }
    }
    mean.iter_mut().for_each(|m| *m /= total);

    let mut variance = vec![0.0f64; dim];
    for (s, c) in entries {
        for (i, acc) in variance.iter_mut().enumerate() {
            let shift = f64::from(s.mean[i]) - mean[i];
            *acc += (f64::from(s.std[i]).powi(2) + shift * shift) * c;
        }
    }

    let mut min = first.min.clone();
    let mut max = first.max.clone();
    for (s, _) in &entries[1..] {
        min.iter_mut().zip(&s.min).for_each(|(a, b)| *a = a.min(*b));
        max.iter_mut().zip(&s.max).for_each(|(a, b)| *a = a.max(*b));
    }

    Ok(FeatureStats {
        shape: first.shape.clone(),
        mean: mean.iter().map(|m| *m as f32).collect(),
        std: variance.iter().map(|v| (v / total).sqrt() as f32).collect(),
        min,
        max,
    })
}

fn flatten_numbers(
    value: &serde_json::Value,
    depth: usize,
    out: &mut Vec<f32>,
    shape: &mut Vec<usize>,
) -> Result<(), String> {
    match value {
        serde_json::Value::Number(n) => {
            let v = n.as_f64().ok_or_else(|| format!("non-finite number {n}"))?;
            out.push(v as f32);
            Ok(())
        }
        serde_json::Value::Array(items) => {
            if shape.len() == depth {
                shape.push(items.len());
            } else if shape[depth] != items.len() {
                return Err("ragged nested array".to_string());
            }
            for item in items {
                flatten_numbers(item, depth + 1, out, shape)?;
            }
            Ok(())
        }
        other => Err(format!("expected number or array, found {other}")),
    }
}
