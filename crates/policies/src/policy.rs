use crate::config::{DiffusionConfig, PredictionType};
use crate::diffusion::DiffusionModel;
use crate::error::{PolicyError, PolicyResult};
use crate::normalize::Normalizer;
use crate::scheduler::DdpmScheduler;
use burn::module::{AutodiffModule, Module};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Distribution, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use robot_dataset::{Batch, DatasetStats};
use std::collections::{BTreeMap, VecDeque};

pub struct PolicyOutput<B: Backend> {
    /// Scalar training loss, shape `[1]`.
    pub loss: Tensor<B, 1>,
}

/// A single timestep of observations for closed-loop control.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub vectors: BTreeMap<String, Vec<f32>>,
    /// Channel-first frames in `[0, 1]`.
    pub images: BTreeMap<String, Vec<f32>>,
}

/// Diffusion policy: normalization, noise scheduling and the denoiser around one config.
pub struct DiffusionPolicy<B: Backend> {
    config: DiffusionConfig,
    model: DiffusionModel<B>,
    normalizer: Normalizer,
    scheduler: DdpmScheduler,
    stats: DatasetStats,
    training: bool,
    rng: StdRng,
    obs_queue: VecDeque<Observation>,
    action_queue: VecDeque<Vec<f32>>,
    device: B::Device,
}

impl<B: Backend> DiffusionPolicy<B> {
    pub fn new(config: DiffusionConfig, stats: &DatasetStats, device: &B::Device) -> PolicyResult<Self> {
        let model = DiffusionModel::new(&config, device)?;
        Self::from_parts(config, model, stats, device)
    }

    pub(crate) fn from_parts(
        config: DiffusionConfig,
        model: DiffusionModel<B>,
        stats: &DatasetStats,
        device: &B::Device,
    ) -> PolicyResult<Self> {
        let mut features = config.input_features.clone();
        features.extend(config.output_features.clone());
        let normalizer = Normalizer::new(&features, &config.normalization_mapping, stats)?;
        let scheduler = DdpmScheduler::new(&config);
        // Only keep stats the policy actually uses; they are written next to the weights.
        let stats = stats
            .iter()
            .filter(|(k, _)| features.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            config,
            model,
            normalizer,
            scheduler,
            stats,
            training: false,
            rng: StdRng::from_rng(&mut rand::rng()),
            obs_queue: VecDeque::new(),
            action_queue: VecDeque::new(),
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn model(&self) -> &DiffusionModel<B> {
        &self.model
    }

    pub fn stats(&self) -> &DatasetStats {
        &self.stats
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn num_params(&self) -> usize {
        self.model.num_params()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Training mode enables random cropping.
    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Seed crop offsets and diffusion timesteps. Gaussian noise comes from the backend RNG.
    pub fn seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Clear observation and action queues; call on environment reset.
    pub fn reset(&mut self) {
        self.obs_queue.clear();
        self.action_queue.clear();
    }

    fn crop_offsets(&mut self, h: usize, w: usize) -> Option<(usize, usize, usize, usize)> {
        let [ch, cw] = self.config.crop_shape?;
        let (y0, x0) = if self.training && self.config.crop_is_random {
            (self.rng.random_range(0..=h - ch), self.rng.random_range(0..=w - cw))
        } else {
            ((h - ch) / 2, (w - cw) / 2)
        };
        Some((y0, x0, ch, cw))
    }

    /// Conditioning vector `[b, cond_dim]` from normalized observation frames.
    fn global_conditioning(
        &mut self,
        vectors: &BTreeMap<String, Tensor<B, 3>>,
        images: &BTreeMap<String, Tensor<B, 5>>,
    ) -> PolicyResult<Tensor<B, 2>> {
        let n_obs = self.config.n_obs_steps;
        let mut parts = Vec::new();

        let mut vector_keys: Vec<String> = self
            .config
            .state_features()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        vector_keys.extend(self.config.env_state_feature().map(|(k, _)| k));
        for key in vector_keys {
            let x = vectors
                .get(&key)
                .ok_or_else(|| PolicyError::MissingFeature(key.clone()))?;
            let [b, t, d] = x.dims();
            if t < n_obs {
                return Err(PolicyError::Shape(format!(
                    "{key} has {t} frames, policy needs {n_obs}"
                )));
            }
            let x = self
                .normalizer
                .normalize_vectors(&key, x.clone().slice([0..b, 0..n_obs, 0..d]));
            parts.push(x.reshape([b, n_obs * d]));
        }

        for (camera, (key, _)) in self.config.image_features().into_iter().enumerate() {
            let x = images
                .get(&key)
                .ok_or_else(|| PolicyError::MissingFeature(key.clone()))?;
            let [b, t, c, h, w] = x.dims();
            if t < n_obs {
                return Err(PolicyError::Shape(format!(
                    "{key} has {t} frames, policy needs {n_obs}"
                )));
            }
            let x = x.clone().slice([0..b, 0..n_obs, 0..c, 0..h, 0..w]);
            let x = match self.crop_offsets(h, w) {
                Some((y0, x0, ch, cw)) => x.slice([0..b, 0..n_obs, 0..c, y0..y0 + ch, x0..x0 + cw]),
                None => x,
            };
            let x = self.normalizer.normalize_images(&key, x);
            parts.push(self.model.encode_camera(camera, x));
        }
        Ok(Tensor::cat(parts, 1))
    }

    /// Denoising loss on one batch.
    pub fn forward(&mut self, batch: &Batch<B>) -> PolicyResult<PolicyOutput<B>> {
        let (action_key, _) = self.config.action_feature()?;
        let actions = batch
            .vectors
            .get(&action_key)
            .ok_or_else(|| PolicyError::MissingFeature(action_key.clone()))?;
        let [b, h, a] = actions.dims();
        if h != self.config.horizon || a != self.model.action_dim() {
            return Err(PolicyError::Shape(format!(
                "{action_key} batch is [{b}, {h}, {a}], policy expects [_, {}, {}]",
                self.config.horizon,
                self.model.action_dim()
            )));
        }

        let cond = self.global_conditioning(&batch.vectors, &batch.images)?;
        let target_actions = self.normalizer.normalize_vectors(&action_key, actions.clone());

        let noise = Tensor::<B, 3>::random([b, h, a], Distribution::Normal(0.0, 1.0), &actions.device());
        let total = self.scheduler.num_train_timesteps();
        let timesteps: Vec<usize> = (0..b).map(|_| self.rng.random_range(0..total)).collect();
        let noisy = self
            .scheduler
            .add_noise(target_actions.clone(), noise.clone(), &timesteps);
        let pred = self.model.forward(noisy, &timesteps, cond);

        let target = match self.config.prediction_type {
            PredictionType::Epsilon => noise,
            PredictionType::Sample => target_actions,
        };
        let mut loss = (pred - target).powf_scalar(2.0);

        if self.config.do_mask_loss_for_padding {
            let pad_key = action_key.as_str();
            let pad = batch.is_pad.get(pad_key).ok_or_else(|| {
                PolicyError::MissingFeature(format!("{pad_key}_is_pad"))
            })?;
            let in_episode = pad.clone().mul_scalar(-1.0).add_scalar(1.0);
            loss = loss * in_episode.unsqueeze_dim::<3>(2);
        }
        Ok(PolicyOutput { loss: loss.mean() })
    }

    /// Run the full reverse diffusion for a conditioning batch; returns normalized actions.
    fn generate_actions(&self, cond: Tensor<B, 2>) -> Tensor<B, 3> {
        let b = cond.dims()[0];
        let shape = [b, self.config.horizon, self.model.action_dim()];
        let mut sample = Tensor::<B, 3>::random(shape, Distribution::Normal(0.0, 1.0), &self.device);
        let timesteps = self.scheduler.timesteps().to_vec();
        for t in timesteps {
            let out = self.model.forward(sample.clone(), &vec![t; b], cond.clone());
            let noise = Tensor::<B, 3>::random(shape, Distribution::Normal(0.0, 1.0), &self.device);
            sample = self.scheduler.step(out, t, sample, noise);
        }
        sample
    }

    /// Closed-loop control: returns the next action, replanning when the queue runs dry.
    pub fn select_action(&mut self, observation: Observation) -> PolicyResult<Vec<f32>> {
        let n_obs = self.config.n_obs_steps;
        if self.obs_queue.is_empty() {
            for _ in 1..n_obs {
                self.obs_queue.push_back(observation.clone());
            }
        }
        self.obs_queue.push_back(observation);
        while self.obs_queue.len() > n_obs {
            self.obs_queue.pop_front();
        }

        if self.action_queue.is_empty() {
            let (vectors, images) = self.stack_observations()?;
            let cond = self.global_conditioning(&vectors, &images)?;
            let (action_key, _) = self.config.action_feature()?;
            let actions = self.generate_actions(cond);
            let actions = self.normalizer.unnormalize_vectors(&action_key, actions);

            let a = self.model.action_dim();
            let start = n_obs - 1;
            let end = start + self.config.n_action_steps;
            let values = actions
                .slice([0..1, start..end, 0..a])
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| PolicyError::Shape(format!("cannot read actions: {e:?}")))?;
            self.action_queue
                .extend(values.chunks_exact(a).map(|c| c.to_vec()));
        }
        self.action_queue
            .pop_front()
            .ok_or_else(|| PolicyError::Shape("no actions generated".to_string()))
    }

    #[allow(clippy::type_complexity)]
    fn stack_observations(
        &self,
    ) -> PolicyResult<(BTreeMap<String, Tensor<B, 3>>, BTreeMap<String, Tensor<B, 5>>)> {
        let n = self.obs_queue.len();
        let mut vectors = BTreeMap::new();
        let mut keys: Vec<(String, usize)> = self
            .config
            .state_features()
            .into_iter()
            .map(|(k, ft)| (k, ft.numel()))
            .collect();
        keys.extend(self.config.env_state_feature().map(|(k, ft)| (k, ft.numel())));
        for (key, d) in keys {
            let mut buf = Vec::with_capacity(n * d);
            for obs in &self.obs_queue {
                let v = obs
                    .vectors
                    .get(&key)
                    .filter(|v| v.len() == d)
                    .ok_or_else(|| PolicyError::MissingFeature(key.clone()))?;
                buf.extend_from_slice(v);
            }
            let t = Tensor::<B, 3>::from_data(TensorData::new(buf, [1, n, d]), &self.device);
            vectors.insert(key, t);
        }

        let mut images = BTreeMap::new();
        for (key, ft) in self.config.image_features() {
            let (c, h, w) = (ft.shape[0], ft.shape[1], ft.shape[2]);
            let mut buf = Vec::with_capacity(n * c * h * w);
            for obs in &self.obs_queue {
                let v = obs
                    .images
                    .get(&key)
                    .filter(|v| v.len() == c * h * w)
                    .ok_or_else(|| PolicyError::MissingFeature(key.clone()))?;
                buf.extend_from_slice(v);
            }
            let t = Tensor::<B, 5>::from_data(TensorData::new(buf, [1, n, c, h, w]), &self.device);
            images.insert(key, t);
        }
        Ok((vectors, images))
    }
}

impl<B: AutodiffBackend> DiffusionPolicy<B> {
    /// Apply one optimizer update to the denoiser weights.
    pub fn apply_gradients<O>(self, optim: &mut O, lr: f64, grads: GradientsParams) -> Self
    where
        O: Optimizer<DiffusionModel<B>, B>,
    {
        let model = optim.step(lr, self.model, grads);
        Self { model, ..self }
    }

    /// Inference copy without autodiff tracking.
    pub fn valid(&self) -> DiffusionPolicy<B::InnerBackend> {
        DiffusionPolicy {
            config: self.config.clone(),
            model: self.model.valid(),
            normalizer: self.normalizer.clone(),
            scheduler: self.scheduler.clone(),
            stats: self.stats.clone(),
            training: false,
            rng: self.rng.clone(),
            obs_queue: VecDeque::new(),
            action_queue: VecDeque::new(),
            device: self.device.clone(),
        }
    }
}
