//! Dynamic loss scaling for mixed-precision training.
//!
//! The loss is multiplied by a running scale before `backward`, gradients are divided by it
//! again, and any non-finite gradient skips the optimizer step and shrinks the scale. After
//! `growth_interval` clean steps in a row the scale grows.

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradScalerConfig {
    pub init_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
}

impl Default for GradScalerConfig {
    fn default() -> Self {
        Self {
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GradScaler {
    cfg: GradScalerConfig,
    enabled: bool,
    scale: f32,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn new(cfg: GradScalerConfig) -> Self {
        Self {
            scale: cfg.init_scale,
            cfg,
            enabled: true,
            growth_tracker: 0,
        }
    }

    /// Passthrough scaler for the plain full-precision loop.
    pub fn disabled() -> Self {
        Self {
            cfg: GradScalerConfig::default(),
            enabled: false,
            scale: 1.0,
            growth_tracker: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_scale(&self) -> f32 {
        self.scale
    }

    pub fn scale<B: Backend, const D: usize>(&self, loss: Tensor<B, D>) -> Tensor<B, D> {
        if self.enabled {
            loss.mul_scalar(self.scale)
        } else {
            loss
        }
    }

    /// Divide every gradient of `model` by the current scale. Returns the unscaled gradients
    /// and whether any of them was non-finite.
    pub fn unscale_and_check<B, M>(&self, model: &M, mut grads: GradientsParams) -> (GradientsParams, bool)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        if !self.enabled {
            return (grads, false);
        }
        let mut visitor = Unscale::<B> {
            grads: &mut grads,
            inv_scale: 1.0 / self.scale,
            found_inf: false,
            backend: PhantomData,
        };
        model.visit(&mut visitor);
        let found_inf = visitor.found_inf;
        (grads, found_inf)
    }

    /// Adjust the scale after a step; `found_inf` is the result of `unscale_and_check`.
    pub fn update(&mut self, found_inf: bool) {
        if !self.enabled {
            return;
        }
        if found_inf {
            self.scale *= self.cfg.backoff_factor;
            self.growth_tracker = 0;
            tracing::debug!(scale = self.scale, "non-finite gradients, scale backed off");
            return;
        }
        self.growth_tracker += 1;
        if self.growth_tracker >= self.cfg.growth_interval {
            let grown = self.scale * self.cfg.growth_factor;
            if grown.is_finite() {
                self.scale = grown;
            }
            self.growth_tracker = 0;
            tracing::debug!(scale = self.scale, "loss scale grown");
        }
    }
}

struct Unscale<'a, B: AutodiffBackend> {
    grads: &'a mut GradientsParams,
    inv_scale: f32,
    found_inf: bool,
    backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscale<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inv_scale);
        if !self.found_inf {
            let total: f32 = grad.clone().abs().sum().into_scalar().elem();
            self.found_inf = !total.is_finite();
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}
