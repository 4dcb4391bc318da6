//! Training collaborators: Adam, gradient clipping, EMA shadow, early stopping.
//!
//! All of these operate on the flat parameter vector produced by
//! [`crate::model::ConditionalTabularModel::flatten`], so none of them know anything
//! about network structure.

use crate::{Error, Result};
use ndarray::{Array1, ArrayView1};

/// Scale `grad` in place so its L2 norm does not exceed `max_norm`.
///
/// Returns the pre-clip norm. The categorical loss can spike from multinomial
/// resampling variance; clipping at 1.0 before the optimizer step keeps it stable.
pub fn clip_grad_norm(grad: &mut Array1<f32>, max_norm: f32) -> f32 {
    let norm_sq: f64 = grad.iter().map(|&g| (g as f64) * (g as f64)).sum();
    let norm = norm_sq.sqrt() as f32;
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        grad.mapv_inplace(|g| g * scale);
    }
    norm
}

/// Adam over a flat parameter vector.
#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    step: u64,
    m: Array1<f32>,
    v: Array1<f32>,
}

impl Adam {
    /// Standard betas `(0.9, 0.999)` and `eps = 1e-8`.
    pub fn new(num_params: usize, lr: f32) -> Result<Self> {
        if num_params == 0 {
            return Err(Error::Domain("num_params must be >= 1"));
        }
        if !(lr > 0.0) || !lr.is_finite() {
            return Err(Error::Domain("lr must be positive and finite"));
        }
        Ok(Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            step: 0,
            m: Array1::zeros(num_params),
            v: Array1::zeros(num_params),
        })
    }

    /// One bias-corrected update of `params` from `grad`.
    pub fn step(&mut self, params: &mut Array1<f32>, grad: &ArrayView1<f32>) -> Result<()> {
        if params.len() != self.m.len() || grad.len() != self.m.len() {
            return Err(Error::Shape("params and grad must match optimizer size"));
        }
        self.step += 1;
        let t = self.step.min(i32::MAX as u64) as i32;
        let bc1 = 1.0 - self.beta1.powi(t);
        let bc2 = 1.0 - self.beta2.powi(t);
        for i in 0..params.len() {
            let g = grad[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            params[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
        Ok(())
    }
}

/// Exponential moving average of the parameter vector:
/// `shadow = decay·shadow + (1 - decay)·params`, updated once per optimizer step.
///
/// The shadow is a smoother set of weights than the raw training parameters and is
/// the preferred source for generation.
#[derive(Debug, Clone)]
pub struct Ema {
    pub decay: f32,
    shadow: Array1<f32>,
}

impl Ema {
    pub fn new(decay: f32, params: &ArrayView1<f32>) -> Result<Self> {
        if !(decay >= 0.0 && decay < 1.0) {
            return Err(Error::Domain("decay must lie in [0, 1)"));
        }
        Ok(Self {
            decay,
            shadow: params.to_owned(),
        })
    }

    pub fn update(&mut self, params: &ArrayView1<f32>) -> Result<()> {
        if params.len() != self.shadow.len() {
            return Err(Error::Shape("params must match the registered size"));
        }
        let d = self.decay;
        for (s, &p) in self.shadow.iter_mut().zip(params.iter()) {
            *s = d * *s + (1.0 - d) * p;
        }
        Ok(())
    }

    pub fn shadow(&self) -> &Array1<f32> {
        &self.shadow
    }
}

/// Signals stop after `patience` consecutive evaluations whose improvement over the
/// best seen validation loss does not exceed `min_delta`.
#[derive(Debug, Clone)]
pub struct EarlyStopper {
    pub patience: usize,
    pub min_delta: f32,
    best: f32,
    counter: usize,
}

impl EarlyStopper {
    pub fn new(patience: usize, min_delta: f32) -> Self {
        Self {
            patience,
            min_delta,
            best: f32::INFINITY,
            counter: 0,
        }
    }

    /// Feed one validation loss; returns `true` when training should stop.
    pub fn should_stop(&mut self, validation_loss: f32) -> bool {
        if self.best - validation_loss > self.min_delta {
            self.best = validation_loss;
            self.counter = 0;
        } else {
            self.counter += 1;
        }
        self.counter >= self.patience
    }
}
