//! Compact conditional denoiser for action trajectories.
//!
//! - `ImageEncoder`: small strided conv stack pooled to one embedding per frame.
//! - `DiffusionModel`: MLP over the flattened noisy trajectory, the observation-history
//!   conditioning vector, and a sinusoidal diffusion-step embedding.

use crate::config::DiffusionConfig;
use crate::error::PolicyResult;
use burn::module::Module;
use burn::nn;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

const ENCODER_CHANNELS: [usize; 2] = [32, 64];

#[derive(Debug, Module)]
pub struct ImageEncoder<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    proj: nn::Linear<B>,
}

impl<B: Backend> ImageEncoder<B> {
    pub fn new(in_channels: usize, embed_dim: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, ENCODER_CHANNELS[0]], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let conv2 = Conv2dConfig::new([ENCODER_CHANNELS[0], ENCODER_CHANNELS[1]], [3, 3])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let pool = AdaptiveAvgPool2dConfig::new([1, 1]).init();
        let proj = nn::LinearConfig::new(ENCODER_CHANNELS[1], embed_dim).init(device);
        Self {
            conv1,
            conv2,
            pool,
            proj,
        }
    }

    /// `[n, c, h, w]` -> `[n, embed_dim]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.conv1.forward(images));
        let x = relu(self.conv2.forward(x));
        let x = self.pool.forward(x);
        let n = x.dims()[0];
        let x = x.reshape([n, ENCODER_CHANNELS[1]]);
        relu(self.proj.forward(x))
    }
}

#[derive(Debug, Module)]
pub struct DiffusionModel<B: Backend> {
    image_encoders: Vec<ImageEncoder<B>>,
    time_mlp: nn::Linear<B>,
    layers: Vec<nn::Linear<B>>,
    out: nn::Linear<B>,
    horizon: usize,
    action_dim: usize,
    cond_dim: usize,
    step_embed_dim: usize,
}

impl<B: Backend> DiffusionModel<B> {
    pub fn new(cfg: &DiffusionConfig, device: &B::Device) -> PolicyResult<Self> {
        cfg.validate()?;
        let action_dim = cfg.action_dim()?;
        let cond_dim = global_cond_dim(cfg);

        let image_encoders = cfg
            .image_features()
            .iter()
            .map(|(_, ft)| ImageEncoder::new(ft.shape[0], cfg.image_embed_dim, device))
            .collect();
        let time_mlp =
            nn::LinearConfig::new(cfg.diffusion_step_embed_dim, cfg.diffusion_step_embed_dim).init(device);

        let traj_dim = cfg.horizon * action_dim;
        let mut width = traj_dim + cond_dim + cfg.diffusion_step_embed_dim;
        let mut layers = Vec::with_capacity(cfg.hidden_dims.len());
        for hidden in &cfg.hidden_dims {
            layers.push(nn::LinearConfig::new(width, *hidden).init(device));
            width = *hidden;
        }
        let out = nn::LinearConfig::new(width, traj_dim).init(device);

        Ok(Self {
            image_encoders,
            time_mlp,
            layers,
            out,
            horizon: cfg.horizon,
            action_dim,
            cond_dim,
            step_embed_dim: cfg.diffusion_step_embed_dim,
        })
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub fn cond_dim(&self) -> usize {
        self.cond_dim
    }

    pub fn num_cameras(&self) -> usize {
        self.image_encoders.len()
    }

    /// Encode one camera's `[b, t, c, h, w]` frames to `[b, t * embed]`.
    pub fn encode_camera(&self, camera: usize, images: Tensor<B, 5>) -> Tensor<B, 2> {
        let [b, t, c, h, w] = images.dims();
        let flat = images.reshape([b * t, c, h, w]);
        let emb = self.image_encoders[camera].forward(flat);
        let e = emb.dims()[1];
        emb.reshape([b, t * e])
    }

    /// Predict noise (or the clean trajectory) for `noisy` `[b, horizon, action_dim]`.
    pub fn forward(
        &self,
        noisy: Tensor<B, 3>,
        timesteps: &[usize],
        global_cond: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        let device = noisy.device();
        let b = noisy.dims()[0];
        let temb = Tensor::<B, 2>::from_data(
            TensorData::new(
                sinusoidal_embedding(timesteps, self.step_embed_dim),
                [b, self.step_embed_dim],
            ),
            &device,
        );
        let temb = relu(self.time_mlp.forward(temb));

        let traj = noisy.reshape([b, self.horizon * self.action_dim]);
        let mut x = Tensor::cat(vec![traj, global_cond, temb], 1);
        for layer in &self.layers {
            x = relu(layer.forward(x));
        }
        self.out
            .forward(x)
            .reshape([b, self.horizon, self.action_dim])
    }
}

/// Width of the conditioning vector: every observation input over `n_obs_steps` frames.
pub fn global_cond_dim(cfg: &DiffusionConfig) -> usize {
    let state: usize = cfg.state_features().iter().map(|(_, ft)| ft.numel()).sum();
    let env = cfg.env_state_feature().map(|(_, ft)| ft.numel()).unwrap_or(0);
    let images = cfg.image_features().len() * cfg.image_embed_dim;
    cfg.n_obs_steps * (state + env + images)
}

/// `[sin(t * f_0..f_{k-1}), cos(t * f_0..f_{k-1})]` with geometric frequencies, `k = dim / 2`.
pub fn sinusoidal_embedding(timesteps: &[usize], dim: usize) -> Vec<f32> {
    let half = dim / 2;
    let scale = (10_000f32).ln() / (half.max(2) - 1) as f32;
    let freqs: Vec<f32> = (0..half).map(|i| (-(i as f32) * scale).exp()).collect();
    let mut out = Vec::with_capacity(timesteps.len() * dim);
    for t in timesteps {
        let t = *t as f32;
        out.extend(freqs.iter().map(|f| (t * f).sin()));
        out.extend(freqs.iter().map(|f| (t * f).cos()));
    }
    out
}
