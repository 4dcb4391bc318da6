//! Reverse (denoising) sampling loops.
//!
//! [`NoisePredictor`] is the only capability the sampler needs from a network:
//! predicted noise for a batch at per-row timesteps. [`FixedConditioning`] adapts a
//! [`ConditionalDenoiser`] into that shape by pinning the discrete conditioning
//! block, which is how tabular generation runs: draw a random one-hot conditioning
//! once, then denoise pure Gaussian noise against it step by step.

use crate::categorical::resample_rows;
use crate::gaussian::randn;
use crate::layout::FeatureLayout;
use crate::loss::random_one_hot;
use crate::model::ConditionalDenoiser;
use crate::schedule::NoiseSchedule;
use crate::timestep::extract;
use crate::{Error, Result};
use ndarray::{s, Array2, ArrayView2};
use rand::Rng;

/// Anything that can predict the injected noise for a noised batch.
pub trait NoisePredictor {
    fn predict_noise(&self, x: &ArrayView2<f32>, t: &[usize]) -> Result<Array2<f32>>;
}

/// A [`ConditionalDenoiser`] with its discrete conditioning pinned to one block.
pub struct FixedConditioning<'a, M: ConditionalDenoiser> {
    model: &'a M,
    conditioning: ArrayView2<'a, f32>,
    layout: &'a FeatureLayout,
}

impl<'a, M: ConditionalDenoiser> FixedConditioning<'a, M> {
    pub fn new(
        model: &'a M,
        conditioning: ArrayView2<'a, f32>,
        layout: &'a FeatureLayout,
    ) -> Result<Self> {
        if conditioning.ncols() != layout.total_width() {
            return Err(Error::Shape("conditioning width must match the layout"));
        }
        Ok(Self {
            model,
            conditioning,
            layout,
        })
    }
}

impl<M: ConditionalDenoiser> NoisePredictor for FixedConditioning<'_, M> {
    fn predict_noise(&self, x: &ArrayView2<f32>, t: &[usize]) -> Result<Array2<f32>> {
        if x.nrows() != self.conditioning.nrows() {
            return Err(Error::Shape("x and conditioning rows must align"));
        }
        let (out_c, _) = self.model.forward(x, &self.conditioning, t, self.layout)?;
        Ok(out_c)
    }
}

/// One reverse step: sample `x_{step-1}` from `x_step`.
///
/// Posterior mean is `(x - eps_factor·ε_θ) / sqrt(α_step)` with
/// `eps_factor = (1 - α_step) / sqrt(1 - ᾱ_step)`; the added noise uses the fixed
/// variance `β_step`.
pub fn p_sample(
    predictor: &impl NoisePredictor,
    x: &ArrayView2<f32>,
    step: usize,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<Array2<f32>> {
    let n = x.nrows();
    if n == 0 || x.ncols() == 0 {
        return Err(Error::Domain("x must be non-empty"));
    }
    let t = vec![step; n];
    let alpha = extract(&schedule.alphas.view(), &t)?;
    let one_minus_bar_sqrt = extract(&schedule.one_minus_alphas_bar_sqrt.view(), &t)?;
    let eps_factor = alpha.mapv(|a| 1.0 - a) / &one_minus_bar_sqrt;

    let eps_theta = predictor.predict_noise(x, &t)?;
    if eps_theta.shape() != x.shape() {
        return Err(Error::Shape("predicted noise must have the shape of x"));
    }

    let alpha_sqrt = alpha.mapv(f32::sqrt);
    let mean = (x - &(&eps_factor * &eps_theta)) / &alpha_sqrt;

    let sigma = extract(&schedule.betas.view(), &t)?.mapv(f32::sqrt);
    let z = randn(rng, n, x.ncols());
    Ok(mean + &sigma * &z)
}

/// Full reverse trajectory from pure noise: `num_steps + 1` states, noisiest first.
pub fn p_sample_loop(
    predictor: &impl NoisePredictor,
    n: usize,
    c: usize,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<Vec<Array2<f32>>> {
    if n == 0 || c == 0 {
        return Err(Error::Domain("sample shape must be non-empty"));
    }
    let mut cur = randn(rng, n, c);
    let mut trajectory = Vec::with_capacity(schedule.num_steps + 1);
    trajectory.push(cur.clone());
    for step in (0..schedule.num_steps).rev() {
        cur = p_sample(predictor, &cur.view(), step, schedule, rng)?;
        trajectory.push(cur.clone());
    }
    Ok(trajectory)
}

/// One reverse step for the continuous block under pinned discrete conditioning.
pub fn p_tabular_sample(
    model: &impl ConditionalDenoiser,
    x: &ArrayView2<f32>,
    conditioning: &ArrayView2<f32>,
    step: usize,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<Array2<f32>> {
    let predictor = FixedConditioning::new(model, conditioning.view(), layout)?;
    p_sample(&predictor, x, step, schedule, rng)
}

/// Denoise pure Gaussian noise all the way down and return only the final state.
pub fn p_tabular_sample_loop(
    model: &impl ConditionalDenoiser,
    conditioning: &ArrayView2<f32>,
    n: usize,
    c: usize,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<Array2<f32>> {
    let predictor = FixedConditioning::new(model, conditioning.view(), layout)?;
    let trajectory = p_sample_loop(&predictor, n, c, schedule, rng)?;
    trajectory
        .into_iter()
        .last()
        .ok_or(Error::Domain("empty trajectory"))
}

/// One generated batch of tabular rows.
pub struct TabularSample {
    /// Denoised continuous block, present only when requested.
    pub continuous: Option<Array2<f32>>,
    /// Hard class index per row and discrete feature.
    pub discrete_classes: Array2<usize>,
    /// The network's per-feature class distributions the classes were drawn from.
    pub discrete_probs: Array2<f32>,
}

/// Generate `sample_size` rows from a trained model.
///
/// Discrete features come from a single `t = 0` query on Gaussian noise, resampled
/// into hard classes feature by feature. The continuous block runs the full reverse
/// loop and is skipped when `generate_continuous` is false, since the discrete
/// query alone is much cheaper.
pub fn tabular_model_output(
    model: &impl ConditionalDenoiser,
    sample_size: usize,
    num_continuous: usize,
    layout: &FeatureLayout,
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
    generate_continuous: bool,
) -> Result<TabularSample> {
    if sample_size == 0 || num_continuous == 0 {
        return Err(Error::Domain("sample shape must be non-empty"));
    }
    let conditioning = random_one_hot(rng, sample_size, layout.total_width());

    let continuous = if generate_continuous {
        Some(p_tabular_sample_loop(
            model,
            &conditioning.view(),
            sample_size,
            num_continuous,
            layout,
            schedule,
            rng,
        )?)
    } else {
        None
    };

    let t = vec![0usize; sample_size];
    let g = randn(rng, sample_size, num_continuous);
    let (_, probs) = model.forward(&g.view(), &conditioning.view(), &t, layout)?;

    let mut classes = Array2::<usize>::zeros((sample_size, layout.num_features()));
    for (f, range) in layout.ranges().iter().enumerate() {
        let slice = probs.slice(s![.., range.start..range.end]);
        let drawn = resample_rows(&slice, rng)?;
        for (i, &c) in drawn.iter().enumerate() {
            classes[[i, f]] = c;
        }
    }

    Ok(TabularSample {
        continuous,
        discrete_classes: classes,
        discrete_probs: probs,
    })
}
