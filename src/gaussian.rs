//! Continuous (Gaussian) forward process and variational-bound utilities.
//!
//! The closed-form noising shortcut `x_t = sqrt(ᾱ_t)·x_0 + sqrt(1-ᾱ_t)·ε` lets any
//! timestep be reached directly from `x_0`; the posterior/KL/likelihood helpers follow
//! the standard DDPM derivation and exist so the variational bound is computable and
//! testable without a training loop.

use crate::schedule::NoiseSchedule;
use crate::timestep::extract;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Zip};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Draw an `(n, c)` matrix of standard-normal samples.
pub fn randn(rng: &mut impl Rng, n: usize, c: usize) -> Array2<f32> {
    Array2::from_shape_simple_fn((n, c), || StandardNormal.sample(rng))
}

/// Forward-noise `x_0` to per-row timesteps `t`, drawing the injected noise from `rng`.
pub fn q_sample(
    x0: &ArrayView2<f32>,
    t: &[usize],
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<Array2<f32>> {
    let noise = randn(rng, x0.nrows(), x0.ncols());
    q_sample_with_noise(x0, t, schedule, &noise.view())
}

/// Forward-noise `x_0` with caller-supplied noise: `sqrt(ᾱ_t)·x_0 + sqrt(1-ᾱ_t)·noise`.
pub fn q_sample_with_noise(
    x0: &ArrayView2<f32>,
    t: &[usize],
    schedule: &NoiseSchedule,
    noise: &ArrayView2<f32>,
) -> Result<Array2<f32>> {
    if t.len() != x0.nrows() {
        return Err(Error::Shape("t must have one timestep per row of x0"));
    }
    if noise.shape() != x0.shape() {
        return Err(Error::Shape("noise must have the shape of x0"));
    }
    let a = extract(&schedule.alphas_bar_sqrt.view(), t)?;
    let am1 = extract(&schedule.one_minus_alphas_bar_sqrt.view(), t)?;
    Ok(&a * x0 + &am1 * noise)
}

/// Mean and log-variance of the forward-process posterior `q(x_{t-1} | x_t, x_0)`.
///
/// Returns `(mean, log_var)` with `mean` shaped like `x_0` and `log_var` an
/// `(n, 1)` column (the posterior variance does not depend on the data).
pub fn q_posterior_mean_variance(
    x0: &ArrayView2<f32>,
    x_t: &ArrayView2<f32>,
    t: &[usize],
    schedule: &NoiseSchedule,
) -> Result<(Array2<f32>, Array2<f32>)> {
    if x0.shape() != x_t.shape() {
        return Err(Error::Shape("x0 and x_t must have the same shape"));
    }
    if t.len() != x0.nrows() {
        return Err(Error::Shape("t must have one timestep per row of x0"));
    }
    let coef_1 = extract(&schedule.posterior_mean_coef_1.view(), t)?;
    let coef_2 = extract(&schedule.posterior_mean_coef_2.view(), t)?;
    let mean = &coef_1 * x0 + &coef_2 * x_t;
    let log_var = extract(&schedule.posterior_log_variance_clipped.view(), t)?;
    Ok((mean, log_var))
}

/// Closed-form KL between two diagonal Gaussians in log-variance parameterization.
///
/// All four inputs must share one shape; the result is elementwise nats.
pub fn normal_kl(
    mean1: &ArrayView2<f32>,
    logvar1: &ArrayView2<f32>,
    mean2: &ArrayView2<f32>,
    logvar2: &ArrayView2<f32>,
) -> Result<Array2<f32>> {
    if mean1.shape() != logvar1.shape()
        || mean1.shape() != mean2.shape()
        || mean1.shape() != logvar2.shape()
    {
        return Err(Error::Shape("normal_kl inputs must share one shape"));
    }
    let mut kl = Array2::<f32>::zeros(mean1.raw_dim());
    Zip::from(&mut kl)
        .and(mean1)
        .and(logvar1)
        .and(mean2)
        .and(logvar2)
        .for_each(|out, &m1, &lv1, &m2, &lv2| {
            let dm = m1 - m2;
            *out = 0.5 * (-1.0 + lv2 - lv1 + (lv1 - lv2).exp() + dm * dm * (-lv2).exp());
        });
    Ok(kl)
}

/// Tanh approximation of the standard-normal CDF:
/// `0.5·(1 + tanh(sqrt(2/π)·(x + 0.044715·x³)))`.
#[inline]
pub fn approx_standard_normal_cdf(x: f32) -> f32 {
    let c = (2.0 / core::f32::consts::PI).sqrt();
    0.5 * (1.0 + (c * (x + 0.044715 * x * x * x)).tanh())
}

/// Log-likelihood of `x` under a Gaussian discretized to 256 bins over `[-1, 1]`.
///
/// CDF values are clamped at 1e-12 before logs so a bin of vanishing mass never
/// produces `log(0)`. `x`, `means`, and `log_scales` must share one shape.
pub fn discretized_gaussian_log_likelihood(
    x: &ArrayView2<f32>,
    means: &ArrayView2<f32>,
    log_scales: &ArrayView2<f32>,
) -> Result<Array2<f32>> {
    if x.shape() != means.shape() || x.shape() != log_scales.shape() {
        return Err(Error::Shape(
            "discretized likelihood inputs must share one shape",
        ));
    }
    const BIN_HALF_WIDTH: f32 = 1.0 / 255.0;
    const CDF_FLOOR: f32 = 1e-12;
    let mut out = Array2::<f32>::zeros(x.raw_dim());
    Zip::from(&mut out)
        .and(x)
        .and(means)
        .and(log_scales)
        .for_each(|lp, &xv, &mean, &log_scale| {
            let centered = xv - mean;
            let inv_stdv = (-log_scale).exp();
            let cdf_plus = approx_standard_normal_cdf(inv_stdv * (centered + BIN_HALF_WIDTH));
            let cdf_min = approx_standard_normal_cdf(inv_stdv * (centered - BIN_HALF_WIDTH));
            let log_cdf_plus = cdf_plus.max(CDF_FLOOR).ln();
            let log_one_minus_cdf_min = (1.0 - cdf_min).max(CDF_FLOOR).ln();
            let cdf_delta = cdf_plus - cdf_min;
            *lp = if xv < -0.999 {
                log_cdf_plus
            } else if xv > 0.999 {
                log_one_minus_cdf_min
            } else {
                cdf_delta.max(CDF_FLOOR).ln()
            };
        });
    Ok(out)
}

/// Per-row variational bound in bits: KL against the forward posterior at `t > 0`,
/// decoder NLL at `t == 0`.
///
/// `model_mean` and `model_log_var` are the network's Gaussian parameters for
/// `p(x_{t-1} | x_t)`, shaped like `x_0`.
pub fn variational_bound(
    x0: &ArrayView2<f32>,
    x_t: &ArrayView2<f32>,
    t: &[usize],
    model_mean: &ArrayView2<f32>,
    model_log_var: &ArrayView2<f32>,
    schedule: &NoiseSchedule,
) -> Result<Array1<f32>> {
    if model_mean.shape() != x0.shape() || model_log_var.shape() != x0.shape() {
        return Err(Error::Shape("model outputs must have the shape of x0"));
    }
    let n = x0.nrows();
    let c = x0.ncols();
    let (true_mean, true_log_var_col) = q_posterior_mean_variance(x0, x_t, t, schedule)?;

    // Broadcast the (n, 1) posterior log-variance across feature columns.
    let mut true_log_var = Array2::<f32>::zeros((n, c));
    for i in 0..n {
        true_log_var.row_mut(i).fill(true_log_var_col[[i, 0]]);
    }

    let kl = normal_kl(
        &true_mean.view(),
        &true_log_var.view(),
        model_mean,
        model_log_var,
    )?;
    let half_log_var = model_log_var.mapv(|v| 0.5 * v);
    let decoder_ll = discretized_gaussian_log_likelihood(x0, model_mean, &half_log_var.view())?;

    let ln2 = core::f32::consts::LN_2;
    let mut bound = Array1::<f32>::zeros(n);
    for i in 0..n {
        let row_kl: f32 = kl.row(i).mean().unwrap_or(0.0) / ln2;
        let row_nll: f32 = -decoder_ll.row(i).mean().unwrap_or(0.0) / ln2;
        bound[i] = if t[i] == 0 { row_nll } else { row_kl };
    }
    Ok(bound)
}
