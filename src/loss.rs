//! Per-modality noise-estimation losses.
//!
//! Both estimators draw antithetic per-row timesteps, forward-noise their own
//! modality, and score the network's prediction with mean squared error. The
//! conditioning input for the *other* modality is freshly resampled random noise,
//! not the batch's true paired value: each modality's denoiser is trained
//! quasi-independently. This mirrors sampling time, where the discrete
//! conditioning is also random, and is deliberate rather than a data leak.

use crate::categorical::q_x_cat;
use crate::gaussian::{q_sample_with_noise, randn};
use crate::layout::FeatureLayout;
use crate::model::{ConditionalDenoiser, ConditionalTabularModel};
use crate::schedule::NoiseSchedule;
use crate::timestep::{extract, sample_timesteps_antithetic};
use crate::{Error, Result};
use ndarray::{s, Array1, Array2, ArrayView2};
use rand::Rng;

/// Draw `n` one-hot rows uniformly over `k` classes.
pub fn random_one_hot(rng: &mut impl Rng, n: usize, k: usize) -> Array2<f32> {
    let mut out = Array2::<f32>::zeros((n, k));
    for i in 0..n {
        let c = rng.random_range(0..k);
        out[[i, c]] = 1.0;
    }
    out
}

/// Reverse-process target distribution for the categorical loss.
///
/// Product of two interpolations toward uniform, one driven by `alpha_t` against
/// the noised batch and one by `ᾱ_{t-1}` against `x_0`, renormalized per feature.
/// `t - 1` is clamped to 0 at `t = 0`. Rows of the result sum to 1 within every
/// feature range.
pub fn categorical_theta(
    x0_discrete: &ArrayView2<f32>,
    batch_x_t: &ArrayView2<f32>,
    t: &[usize],
    schedule: &NoiseSchedule,
    layout: &FeatureLayout,
) -> Result<Array2<f32>> {
    if x0_discrete.shape() != batch_x_t.shape() {
        return Err(Error::Shape("x0 and batch_x_t must have the same shape"));
    }
    if x0_discrete.ncols() != layout.total_width() {
        return Err(Error::Shape("discrete width must match the layout"));
    }
    let n = x0_discrete.nrows();
    let k = layout.total_width() as f32;

    let t_prev: Vec<usize> = t.iter().map(|&ti| ti.saturating_sub(1)).collect();
    let alpha = extract(&schedule.alphas.view(), t)?;
    let alpha_prod_prev = extract(&schedule.alphas_prod.view(), &t_prev)?;

    let mut theta = Array2::<f32>::zeros(x0_discrete.raw_dim());
    for i in 0..n {
        let a = alpha[[i, 0]];
        let ap = alpha_prod_prev[[i, 0]];
        for c in 0..x0_discrete.ncols() {
            let noised_term = a * batch_x_t[[i, c]] + (1.0 - a) / k;
            let signal_term = ap * x0_discrete[[i, c]] + (1.0 - ap) / k;
            theta[[i, c]] = noised_term * signal_term;
        }
    }

    // L1-normalize every feature slice so each is a distribution again.
    for range in layout.ranges() {
        for i in 0..n {
            let mut sum = 0.0f32;
            for c in range.start..range.end {
                sum += theta[[i, c]];
            }
            if sum <= 0.0 {
                return Err(Error::Domain("theta feature slice has no mass"));
            }
            for c in range.start..range.end {
                theta[[i, c]] /= sum;
            }
        }
    }
    Ok(theta)
}

fn mse(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> f32 {
    let mut s = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = (*x - *y) as f64;
        s += d * d;
    }
    (s / a.len() as f64) as f32
}

/// Noise the discrete block feature by feature and concatenate.
fn noise_discrete_block(
    x0_discrete: &ArrayView2<f32>,
    t: &[usize],
    schedule: &NoiseSchedule,
    layout: &FeatureLayout,
    rng: &mut impl Rng,
) -> Result<Array2<f32>> {
    let mut batch_x_t = Array2::<f32>::zeros(x0_discrete.raw_dim());
    for range in layout.ranges() {
        let feature = x0_discrete.slice(s![.., range.start..range.end]);
        let noised = q_x_cat(&feature, t, schedule, rng)?;
        batch_x_t
            .slice_mut(s![.., range.start..range.end])
            .assign(&noised);
    }
    Ok(batch_x_t)
}

/// MSE between injected Gaussian noise and the network's noise prediction at a
/// random (antithetic) timestep per row. Discrete conditioning is a fresh random
/// one-hot over the full block width.
pub fn continuous_noise_estimation_loss(
    model: &impl ConditionalDenoiser,
    x0_continuous: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<f32> {
    let (loss, ..) = continuous_loss_parts(model, x0_continuous, layout, schedule, rng)?;
    Ok(loss)
}

/// MSE between the categorical posterior target `theta` and the network's
/// per-feature distribution. Continuous conditioning is fresh Gaussian noise.
pub fn categorical_noise_estimation_loss(
    model: &impl ConditionalDenoiser,
    x0_continuous: &ArrayView2<f32>,
    x0_discrete: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<f32> {
    let (loss, ..) =
        categorical_loss_parts(model, x0_continuous, x0_discrete, layout, schedule, rng)?;
    Ok(loss)
}

fn continuous_loss_parts(
    model: &impl ConditionalDenoiser,
    x0_continuous: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<(f32, Array2<f32>, Array2<f32>)> {
    let n = x0_continuous.nrows();
    let t = sample_timesteps_antithetic(rng, n, schedule.num_steps)?;
    let noise = randn(rng, n, x0_continuous.ncols());
    let conditioning = random_one_hot(rng, n, layout.total_width());
    let x_t = q_sample_with_noise(x0_continuous, &t, schedule, &noise.view())?;
    let (output, _) = model.forward(&x_t.view(), &conditioning.view(), &t, layout)?;
    let loss = mse(&noise.view(), &output.view());
    Ok((loss, noise, output))
}

fn categorical_loss_parts(
    model: &impl ConditionalDenoiser,
    x0_continuous: &ArrayView2<f32>,
    x0_discrete: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<(f32, Array2<f32>, Array2<f32>)> {
    if x0_continuous.nrows() != x0_discrete.nrows() {
        return Err(Error::Shape("continuous and discrete rows must align"));
    }
    let n = x0_discrete.nrows();
    let t = sample_timesteps_antithetic(rng, n, schedule.num_steps)?;

    let batch_x_t = noise_discrete_block(x0_discrete, &t, schedule, layout, rng)?;
    let theta = categorical_theta(x0_discrete, &batch_x_t.view(), &t, schedule, layout)?;

    let conditioning = random_one_hot(rng, n, layout.total_width());
    let g = randn(rng, n, x0_continuous.ncols());
    let (_, output) = model.forward(&g.view(), &conditioning.view(), &t, layout)?;
    let loss = mse(&theta.view(), &output.view());
    Ok((loss, theta, output))
}

/// Like [`continuous_noise_estimation_loss`], but also backpropagates and returns
/// the flat parameter gradient.
pub fn continuous_loss_with_grad(
    model: &ConditionalTabularModel,
    x0_continuous: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<(f32, Array1<f32>)> {
    let n = x0_continuous.nrows();
    let t = sample_timesteps_antithetic(rng, n, schedule.num_steps)?;
    let noise = randn(rng, n, x0_continuous.ncols());
    let conditioning = random_one_hot(rng, n, layout.total_width());
    let x_t = q_sample_with_noise(x0_continuous, &t, schedule, &noise.view())?;

    let trace = model.forward_trace(&x_t.view(), &conditioning.view(), &t, layout)?;
    let loss = mse(&noise.view(), &trace.out_c.view());

    let scale = 2.0 / trace.out_c.len() as f32;
    let d_out_c = (&trace.out_c - &noise).mapv(|v| v * scale);
    let d_probs = Array2::<f32>::zeros(trace.probs.raw_dim());
    let grads = model.backward(&trace, &d_out_c.view(), &d_probs.view(), layout)?;
    Ok((loss, grads.flatten()))
}

/// Like [`categorical_noise_estimation_loss`], but also backpropagates and returns
/// the flat parameter gradient.
pub fn categorical_loss_with_grad(
    model: &ConditionalTabularModel,
    x0_continuous: &ArrayView2<f32>,
    x0_discrete: &ArrayView2<f32>,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<(f32, Array1<f32>)> {
    if x0_continuous.nrows() != x0_discrete.nrows() {
        return Err(Error::Shape("continuous and discrete rows must align"));
    }
    let n = x0_discrete.nrows();
    let t = sample_timesteps_antithetic(rng, n, schedule.num_steps)?;

    let batch_x_t = noise_discrete_block(x0_discrete, &t, schedule, layout, rng)?;
    let theta = categorical_theta(x0_discrete, &batch_x_t.view(), &t, schedule, layout)?;

    let conditioning = random_one_hot(rng, n, layout.total_width());
    let g = randn(rng, n, x0_continuous.ncols());

    let trace = model.forward_trace(&g.view(), &conditioning.view(), &t, layout)?;
    let loss = mse(&theta.view(), &trace.probs.view());

    let scale = 2.0 / trace.probs.len() as f32;
    let d_probs = (&trace.probs - &theta).mapv(|v| v * scale);
    let d_out_c = Array2::<f32>::zeros(trace.out_c.raw_dim());
    let grads = model.backward(&trace, &d_out_c.view(), &d_probs.view(), layout)?;
    Ok((loss, grads.flatten()))
}
