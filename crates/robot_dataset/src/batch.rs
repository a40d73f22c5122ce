//! Episode-aware sampling and Burn batch iteration.

use crate::dataset::LeRobotDataset;
use crate::types::{DatasetError, DatasetResult, Sample};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct SamplerConfig {
    pub shuffle: bool,
    pub seed: Option<u64>,
    /// Frames skipped at the start of every episode.
    pub drop_n_first_frames: usize,
    /// Frames skipped at the end of every episode.
    pub drop_n_last_frames: usize,
}

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Worker threads used to assemble samples; 0 loads on the calling thread.
    pub num_workers: usize,
    pub drop_last: bool,
    pub sampler: SamplerConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_workers: 0,
            drop_last: false,
            sampler: SamplerConfig::default(),
        }
    }
}

/// Dataset rows eligible for sampling, in episode order.
pub fn episode_aware_indices(dataset: &LeRobotDataset, cfg: &SamplerConfig) -> Vec<usize> {
    let mut indices = Vec::with_capacity(dataset.len());
    for (_ep, range) in dataset.episode_ranges() {
        let start = range.start + cfg.drop_n_first_frames;
        let end = range.end.saturating_sub(cfg.drop_n_last_frames);
        if start < end {
            indices.extend(start..end);
        }
    }
    indices
}

pub struct Batch<B: Backend> {
    /// `[batch, frames, dim]` per numeric feature.
    pub vectors: BTreeMap<String, Tensor<B, 3>>,
    /// `[batch, frames, channels, height, width]` per camera.
    pub images: BTreeMap<String, Tensor<B, 5>>,
    /// `[batch, frames]`, 1.0 where the frame was padded.
    pub is_pad: BTreeMap<String, Tensor<B, 2>>,
    pub index: Vec<usize>,
}

impl<B: Backend> Batch<B> {
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Stack samples into tensors. All samples must share per-key frame counts and shapes.
pub fn collate<B: Backend>(samples: &[Sample], device: &B::Device) -> DatasetResult<Batch<B>> {
    let first = samples
        .first()
        .ok_or_else(|| DatasetError::Other("cannot collate empty batch".to_string()))?;
    let batch = samples.len();

    let mut vectors = BTreeMap::new();
    for (key, proto) in &first.vectors {
        let mut buf = Vec::with_capacity(batch * proto.data.len());
        for s in samples {
            let stack = s
                .vectors
                .get(key)
                .ok_or_else(|| DatasetError::UnknownFeature(key.clone()))?;
            if stack.frames != proto.frames || stack.dim != proto.dim {
                return Err(DatasetError::Other(format!(
                    "{key}: sample {} has [{}, {}], expected [{}, {}]",
                    s.index, stack.frames, stack.dim, proto.frames, proto.dim
                )));
            }
            buf.extend_from_slice(&stack.data);
        }
        let t = Tensor::<B, 3>::from_data(
            TensorData::new(buf, [batch, proto.frames, proto.dim]),
            device,
        );
        vectors.insert(key.clone(), t);
    }

    let mut images = BTreeMap::new();
    for (key, proto) in &first.images {
        let mut buf = Vec::with_capacity(batch * proto.data.len());
        for s in samples {
            let stack = s
                .images
                .get(key)
                .ok_or_else(|| DatasetError::UnknownFeature(key.clone()))?;
            if stack.frames != proto.frames || stack.frame_len() != proto.frame_len() {
                return Err(DatasetError::Other(format!(
                    "{key}: image stack shape differs within batch (sample {})",
                    s.index
                )));
            }
            buf.extend_from_slice(&stack.data);
        }
        let t = Tensor::<B, 5>::from_data(
            TensorData::new(
                buf,
                [batch, proto.frames, proto.channels, proto.height, proto.width],
            ),
            device,
        );
        images.insert(key.clone(), t);
    }

    let mut is_pad = BTreeMap::new();
    for (key, proto) in &first.is_pad {
        let mut buf = Vec::with_capacity(batch * proto.len());
        for s in samples {
            let pads = s
                .is_pad
                .get(key)
                .filter(|p| p.len() == proto.len())
                .ok_or_else(|| {
                    DatasetError::Other(format!("{key}: padding mask differs within batch"))
                })?;
            buf.extend(pads.iter().map(|p| if *p { 1.0f32 } else { 0.0 }));
        }
        let t = Tensor::<B, 2>::from_data(TensorData::new(buf, [batch, proto.len()]), device);
        is_pad.insert(key.clone(), t);
    }

    Ok(Batch {
        vectors,
        images,
        is_pad,
        index: samples.iter().map(|s| s.index).collect(),
    })
}

pub struct BatchLoader {
    dataset: Arc<LeRobotDataset>,
    cfg: LoaderConfig,
    base_indices: Vec<usize>,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
    rng: StdRng,
    pool: Option<rayon::ThreadPool>,
}

impl BatchLoader {
    pub fn new(dataset: Arc<LeRobotDataset>, cfg: LoaderConfig) -> DatasetResult<Self> {
        if cfg.batch_size == 0 {
            return Err(DatasetError::Other("batch_size must be at least 1".to_string()));
        }
        let rng = match cfg.sampler.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let pool = if cfg.num_workers > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(cfg.num_workers)
                .thread_name(|i| format!("dataloader-{i}"))
                .build()
                .map_err(|e| DatasetError::Other(format!("failed to start loader pool: {e}")))?;
            Some(pool)
        } else {
            None
        };
        let base_indices = episode_aware_indices(&dataset, &cfg.sampler);
        if base_indices.is_empty() {
            return Err(DatasetError::Other(
                "no frames left to sample after dropping episode edges".to_string(),
            ));
        }
        let mut loader = Self {
            dataset,
            cfg,
            order: Vec::new(),
            base_indices,
            cursor: 0,
            epoch: 0,
            rng,
            pool,
        };
        loader.reset_order();
        Ok(loader)
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.cfg
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Samples drawn per epoch (frames after episode-edge trimming).
    pub fn num_samples(&self) -> usize {
        self.base_indices.len()
    }

    pub fn batches_per_epoch(&self) -> usize {
        let n = self.base_indices.len();
        if self.cfg.drop_last {
            n / self.cfg.batch_size
        } else {
            n.div_ceil(self.cfg.batch_size)
        }
    }

    /// Rewind to the start of a new epoch, reshuffling when configured.
    pub fn start_epoch(&mut self) {
        self.epoch += 1;
        self.reset_order();
    }

    fn reset_order(&mut self) {
        self.order.clone_from(&self.base_indices);
        if self.cfg.sampler.shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }

    /// Next batch of the current epoch, or `None` once it is exhausted.
    pub fn next_batch<B: Backend>(&mut self, device: &B::Device) -> DatasetResult<Option<Batch<B>>> {
        let remaining = self.order.len().saturating_sub(self.cursor);
        if remaining == 0 {
            return Ok(None);
        }
        if self.cfg.drop_last && remaining < self.cfg.batch_size {
            self.cursor = self.order.len();
            return Ok(None);
        }
        let end = (self.cursor + self.cfg.batch_size).min(self.order.len());
        let slice = &self.order[self.cursor..end];
        self.cursor = end;

        let t_load = Instant::now();
        let dataset = &self.dataset;
        let samples: Vec<Sample> = match &self.pool {
            Some(pool) => pool.install(|| {
                slice
                    .par_iter()
                    .map(|i| dataset.get(*i))
                    .collect::<DatasetResult<Vec<_>>>()
            })?,
            None => slice
                .iter()
                .map(|i| dataset.get(*i))
                .collect::<DatasetResult<Vec<_>>>()?,
        };
        let batch = collate::<B>(&samples, device)?;
        tracing::trace!(
            epoch = self.epoch,
            size = samples.len(),
            load_ms = t_load.elapsed().as_millis() as u64,
            "batch ready"
        );
        Ok(Some(batch))
    }
}
