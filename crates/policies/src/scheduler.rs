//! DDPM noise scheduler: forward noising for training and ancestral sampling for inference.

use crate::config::{BetaSchedule, DiffusionConfig, PredictionType};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

const MAX_BETA: f64 = 0.999;

#[derive(Debug, Clone)]
pub struct DdpmScheduler {
    betas: Vec<f32>,
    alphas_cumprod: Vec<f32>,
    prediction_type: PredictionType,
    clip_sample: Option<f32>,
    /// Descending timesteps visited by `step`; set by `set_timesteps`.
    timesteps: Vec<usize>,
}

impl DdpmScheduler {
    pub fn new(cfg: &DiffusionConfig) -> Self {
        let n = cfg.num_train_timesteps.max(1);
        let betas = match cfg.beta_schedule {
            BetaSchedule::Linear => linear_betas(cfg.beta_start, cfg.beta_end, n),
            BetaSchedule::SquaredCosCapV2 => cosine_betas(n),
        };
        let alphas_cumprod = betas
            .iter()
            .scan(1.0f32, |acc, b| {
                *acc *= 1.0 - b;
                Some(*acc)
            })
            .collect();
        let mut scheduler = Self {
            betas,
            alphas_cumprod,
            prediction_type: cfg.prediction_type,
            clip_sample: cfg.clip_sample.then_some(cfg.clip_sample_range),
            timesteps: Vec::new(),
        };
        scheduler.set_timesteps(cfg.inference_steps());
        scheduler
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn alphas_cumprod(&self) -> &[f32] {
        &self.alphas_cumprod
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// Evenly spaced descending timesteps for `n` denoising steps.
    pub fn set_timesteps(&mut self, n: usize) {
        let total = self.num_train_timesteps();
        let n = n.clamp(1, total);
        let ratio = total / n;
        self.timesteps = (0..n).rev().map(|i| i * ratio).collect();
    }

    fn step_ratio(&self) -> usize {
        (self.num_train_timesteps() / self.timesteps.len().max(1)).max(1)
    }

    /// `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise`, one timestep per batch row.
    pub fn add_noise<B: Backend>(
        &self,
        original: Tensor<B, 3>,
        noise: Tensor<B, 3>,
        timesteps: &[usize],
    ) -> Tensor<B, 3> {
        let device = original.device();
        let batch = timesteps.len();
        let (signal, sigma): (Vec<f32>, Vec<f32>) = timesteps
            .iter()
            .map(|t| {
                let a = self.alphas_cumprod[(*t).min(self.alphas_cumprod.len() - 1)];
                (a.sqrt(), (1.0 - a).sqrt())
            })
            .unzip();
        let signal = Tensor::<B, 3>::from_data(TensorData::new(signal, [batch, 1, 1]), &device);
        let sigma = Tensor::<B, 3>::from_data(TensorData::new(sigma, [batch, 1, 1]), &device);
        original * signal + noise * sigma
    }

    /// One reverse step from `t` to the previous scheduled timestep.
    /// `noise` is only used when `t > 0`.
    pub fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 3>,
        t: usize,
        sample: Tensor<B, 3>,
        noise: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let prev_t = t as i64 - self.step_ratio() as i64;
        let alpha_prod_t = self.alphas_cumprod[t];
        let alpha_prod_prev = if prev_t >= 0 {
            self.alphas_cumprod[prev_t as usize]
        } else {
            1.0
        };
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let pred_original = match self.prediction_type {
            PredictionType::Epsilon => (sample.clone() - model_output.mul_scalar(beta_prod_t.sqrt()))
                .div_scalar(alpha_prod_t.sqrt()),
            PredictionType::Sample => model_output,
        };
        let pred_original = match self.clip_sample {
            Some(range) => pred_original.clamp(-range, range),
            None => pred_original,
        };

        let coef_original = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let coef_current = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let mean = pred_original.mul_scalar(coef_original) + sample.mul_scalar(coef_current);

        if t == 0 {
            return mean;
        }
        let variance = (beta_prod_prev / beta_prod_t * current_beta).max(1e-20);
        mean + noise.mul_scalar(variance.sqrt())
    }
}

fn linear_betas(start: f32, end: f32, n: usize) -> Vec<f32> {
    if n == 1 {
        return vec![start];
    }
    (0..n)
        .map(|i| start + (end - start) * i as f32 / (n - 1) as f32)
        .collect()
}

/// Cosine schedule ("squaredcos_cap_v2"), betas capped at 0.999.
fn cosine_betas(n: usize) -> Vec<f32> {
    let alpha_bar = |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
    (0..n)
        .map(|i| {
            let t1 = i as f64 / n as f64;
            let t2 = (i + 1) as f64 / n as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(MAX_BETA) as f32
        })
        .collect()
}
