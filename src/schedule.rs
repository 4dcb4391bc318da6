//! Beta/alpha noise schedules shared by the continuous and categorical processes.
//!
//! A [`NoiseSchedule`] is an immutable pure function of `(kind, num_steps, start, end)`.
//! It carries every per-timestep scalar the rest of the crate gathers with
//! [`crate::timestep::extract`]: the betas themselves, the alpha cumulative products
//! and their square roots for Gaussian noising, the DDPM posterior coefficients, and
//! the log-space quantities used by the categorical transition math.

use crate::{Error, Result};
use ndarray::Array1;

/// Shape of the beta curve over timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Betas linearly interpolated from `start` to `end` (inclusive endpoints).
    Linear,
    /// Interpolate in sqrt-space, then square.
    Quadratic,
    /// Sigmoid curve over `[-6, 6]`, rescaled to `[start, end]`.
    Sigmoid,
}

/// Numerically-stable `log(1 - exp(a))` for `a <= 0`, floored at 1e-40.
///
/// Used to derive `log(1 - alpha_t)` and `log(1 - ᾱ_t)` from their log-space
/// counterparts without underflow.
#[inline]
pub fn log_1m_exp(a: f32) -> f32 {
    (1.0 - a.exp() + 1e-40).ln()
}

/// Per-timestep diffusion constants, built once and never mutated.
///
/// All vectors have length `num_steps`; index `t` is the forward-process step.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    pub num_steps: usize,
    /// Noise-injection magnitude `beta_t`.
    pub betas: Array1<f32>,
    /// `alpha_t = 1 - beta_t`.
    pub alphas: Array1<f32>,
    /// `ᾱ_t = Π alpha_{<=t}` (strictly decreasing in `(0, 1)`).
    pub alphas_prod: Array1<f32>,
    /// `ᾱ_{t-1}` with `ᾱ_{-1} := 1`.
    pub alphas_prod_prev: Array1<f32>,
    /// `sqrt(ᾱ_t)`, the signal coefficient of the closed-form noising shortcut.
    pub alphas_bar_sqrt: Array1<f32>,
    /// `sqrt(1 - ᾱ_t)`, the noise coefficient.
    pub one_minus_alphas_bar_sqrt: Array1<f32>,
    /// Coefficient of `x_0` in the forward-process posterior mean.
    pub posterior_mean_coef_1: Array1<f32>,
    /// Coefficient of `x_t` in the forward-process posterior mean.
    pub posterior_mean_coef_2: Array1<f32>,
    /// Log posterior variance, with the degenerate `t = 0` entry clipped.
    pub posterior_log_variance_clipped: Array1<f32>,
    /// `log(alpha_t)`.
    pub log_alphas: Array1<f32>,
    /// `log(1 - alpha_t)` via [`log_1m_exp`].
    pub log_one_minus_alphas: Array1<f32>,
    /// `log(ᾱ_t)` as a running cumulative sum of `log(alpha_t)`.
    pub log_cumprod_alpha: Array1<f32>,
    /// `log(1 - ᾱ_t)` via [`log_1m_exp`].
    pub log_one_minus_cumprod_alpha: Array1<f32>,
}

/// Build the raw beta curve for a schedule kind.
///
/// Endpoints are inclusive: the linear schedule returns exactly `start` at `t = 0`
/// and exactly `end` at `t = num_steps - 1`.
pub fn make_beta_schedule(
    kind: ScheduleKind,
    num_steps: usize,
    start: f32,
    end: f32,
) -> Result<Array1<f32>> {
    validate_inputs(num_steps, start, end)?;
    let betas = match kind {
        ScheduleKind::Linear => Array1::linspace(start, end, num_steps),
        ScheduleKind::Quadratic => {
            Array1::linspace(start.sqrt(), end.sqrt(), num_steps).mapv(|b| b * b)
        }
        ScheduleKind::Sigmoid => Array1::linspace(-6.0f32, 6.0, num_steps)
            .mapv(|x| sigmoid(x) * (end - start) + start),
    };
    Ok(betas)
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn validate_inputs(num_steps: usize, start: f32, end: f32) -> Result<()> {
    if num_steps == 0 {
        return Err(Error::Domain("num_steps must be >= 1"));
    }
    if !(start > 0.0 && start < 1.0) || !start.is_finite() {
        return Err(Error::Domain("start must lie in (0, 1)"));
    }
    if !(end > 0.0 && end < 1.0) || !end.is_finite() {
        return Err(Error::Domain("end must lie in (0, 1)"));
    }
    if start >= end {
        return Err(Error::Domain("start must be < end"));
    }
    Ok(())
}

impl NoiseSchedule {
    /// Build a schedule and all derived per-timestep constants.
    ///
    /// Degenerate inputs (`num_steps == 0`, `start`/`end` outside `(0, 1)`,
    /// `start >= end`) are configuration errors surfaced here, not recovered.
    pub fn new(kind: ScheduleKind, num_steps: usize, start: f32, end: f32) -> Result<Self> {
        let betas = make_beta_schedule(kind, num_steps, start, end)?;
        let alphas = betas.mapv(|b| 1.0 - b);

        let mut alphas_prod = Array1::<f32>::zeros(num_steps);
        let mut running = 1.0f32;
        for (t, &a) in alphas.iter().enumerate() {
            running *= a;
            alphas_prod[t] = running;
        }

        let mut alphas_prod_prev = Array1::<f32>::zeros(num_steps);
        alphas_prod_prev[0] = 1.0;
        for t in 1..num_steps {
            alphas_prod_prev[t] = alphas_prod[t - 1];
        }

        let alphas_bar_sqrt = alphas_prod.mapv(f32::sqrt);
        let one_minus_alphas_bar_sqrt = alphas_prod.mapv(|p| (1.0 - p).sqrt());

        // Standard DDPM posterior q(x_{t-1} | x_t, x_0).
        let mut posterior_mean_coef_1 = Array1::<f32>::zeros(num_steps);
        let mut posterior_mean_coef_2 = Array1::<f32>::zeros(num_steps);
        let mut posterior_variance = Array1::<f32>::zeros(num_steps);
        for t in 0..num_steps {
            let one_minus_prod = 1.0 - alphas_prod[t];
            posterior_mean_coef_1[t] = betas[t] * alphas_prod_prev[t].sqrt() / one_minus_prod;
            posterior_mean_coef_2[t] =
                (1.0 - alphas_prod_prev[t]) * alphas[t].sqrt() / one_minus_prod;
            posterior_variance[t] = betas[t] * (1.0 - alphas_prod_prev[t]) / one_minus_prod;
        }
        // The t = 0 variance is exactly zero; clip it before taking logs.
        let floor = if num_steps > 1 {
            posterior_variance[1]
        } else {
            betas[0]
        };
        posterior_variance[0] = floor;
        let posterior_log_variance_clipped = posterior_variance.mapv(f32::ln);

        let log_alphas = alphas.mapv(f32::ln);
        let log_one_minus_alphas = log_alphas.mapv(log_1m_exp);
        let mut log_cumprod_alpha = Array1::<f32>::zeros(num_steps);
        let mut acc = 0.0f32;
        for (t, &la) in log_alphas.iter().enumerate() {
            acc += la;
            log_cumprod_alpha[t] = acc;
        }
        let log_one_minus_cumprod_alpha = log_cumprod_alpha.mapv(log_1m_exp);

        Ok(Self {
            num_steps,
            betas,
            alphas,
            alphas_prod,
            alphas_prod_prev,
            alphas_bar_sqrt,
            one_minus_alphas_bar_sqrt,
            posterior_mean_coef_1,
            posterior_mean_coef_2,
            posterior_log_variance_clipped,
            log_alphas,
            log_one_minus_alphas,
            log_cumprod_alpha,
            log_one_minus_cumprod_alpha,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn linear_schedule_has_inclusive_endpoints() {
        let betas = make_beta_schedule(ScheduleKind::Linear, 1000, 1e-5, 0.5e-2).unwrap();
        assert_eq!(betas.len(), 1000);
        assert!((betas[0] - 1e-5).abs() < 1e-10, "beta_0 = {}", betas[0]);
        assert!(
            (betas[999] - 0.5e-2).abs() < 1e-8,
            "beta_999 = {}",
            betas[999]
        );
        // Linear betas are non-decreasing.
        for t in 1..1000 {
            assert!(betas[t] >= betas[t - 1]);
        }
    }

    #[test]
    fn alpha_bar_endpoints_match_closed_form() {
        let s = NoiseSchedule::new(ScheduleKind::Linear, 100, 1e-5, 5e-3).unwrap();
        assert!((s.alphas_prod[0] - (1.0 - 1e-5)).abs() < 1e-7);
        let prod: f32 = s.alphas.iter().product();
        assert!((s.alphas_prod[99] - prod).abs() < 1e-6);
    }

    #[test]
    fn quadratic_and_sigmoid_stay_inside_range() {
        for kind in [ScheduleKind::Quadratic, ScheduleKind::Sigmoid] {
            let betas = make_beta_schedule(kind, 64, 1e-4, 2e-2).unwrap();
            for &b in betas.iter() {
                assert!(b >= 1e-4 - 1e-7 && b <= 2e-2 + 1e-7, "beta {b} out of range");
            }
        }
    }

    #[test]
    fn degenerate_inputs_are_rejected() {
        assert!(NoiseSchedule::new(ScheduleKind::Linear, 0, 1e-5, 1e-2).is_err());
        assert!(NoiseSchedule::new(ScheduleKind::Linear, 10, 0.0, 1e-2).is_err());
        assert!(NoiseSchedule::new(ScheduleKind::Linear, 10, 1e-5, 1.0).is_err());
        assert!(NoiseSchedule::new(ScheduleKind::Linear, 10, 1e-2, 1e-5).is_err());
        assert!(NoiseSchedule::new(ScheduleKind::Linear, 10, f32::NAN, 1e-2).is_err());
    }

    #[test]
    fn log_space_quantities_are_finite_and_consistent() {
        let s = NoiseSchedule::new(ScheduleKind::Linear, 200, 1e-5, 1e-2).unwrap();
        for t in 0..200 {
            assert!(s.log_alphas[t].is_finite());
            assert!(s.log_one_minus_alphas[t].is_finite());
            assert!(s.log_cumprod_alpha[t].is_finite());
            assert!(s.log_one_minus_cumprod_alpha[t].is_finite());
            // exp(log ᾱ_t) recovers ᾱ_t.
            assert!((s.log_cumprod_alpha[t].exp() - s.alphas_prod[t]).abs() < 1e-4);
        }
    }

    proptest! {
        #[test]
        fn prop_alpha_bar_strictly_decreasing_in_unit_interval(
            num_steps in 2usize..512,
            start_exp in -6.0f32..-3.0,
            spread in 1.2f32..10.0,
        ) {
            let start = 10f32.powf(start_exp);
            let end = (start * spread).min(0.9);
            prop_assume!(end > start && end < 1.0);

            let s = NoiseSchedule::new(ScheduleKind::Linear, num_steps, start, end).unwrap();
            prop_assert!((s.alphas_prod[0] - (1.0 - start)).abs() < 1e-5);
            for t in 0..num_steps {
                prop_assert!(s.alphas_prod[t] > 0.0 && s.alphas_prod[t] < 1.0);
                if t > 0 {
                    prop_assert!(
                        s.alphas_prod[t] < s.alphas_prod[t - 1],
                        "alpha-bar must strictly decrease at t={}",
                        t
                    );
                }
            }
        }
    }
}
