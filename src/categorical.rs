//! Discrete (categorical/multinomial) forward process over one-hot features.
//!
//! Each discrete feature is noised independently with its own cardinality `k`:
//! the batch's empirical class distribution is mixed toward uniform by `ᾱ_t`, then
//! every row is resampled from its mixed distribution back into a hard one-hot.
//! At `t = 0` the mix is near-identity; as `ᾱ_t → 0` it approaches uniform over the
//! `k` classes, the intended terminal distribution.

use crate::schedule::NoiseSchedule;
use crate::timestep::extract;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

/// Empirical class probabilities of a one-hot batch: column sums, normalized.
pub fn class_probs(x0: &ArrayView2<f32>) -> Result<Array1<f32>> {
    if x0.nrows() == 0 || x0.ncols() == 0 {
        return Err(Error::Domain("x0 must be non-empty"));
    }
    if x0.iter().any(|&v| v < 0.0 || !v.is_finite()) {
        return Err(Error::Domain("x0 must be finite and nonnegative"));
    }
    let sums = x0.sum_axis(Axis(0));
    let total = sums.sum();
    if total <= 0.0 {
        return Err(Error::Domain("x0 must have positive total mass"));
    }
    Ok(sums / total)
}

/// Sample one class index from a normalized probability vector.
pub fn sample_categorical(probs: &ArrayView1<f32>, rng: &mut impl Rng) -> usize {
    debug_assert!(!probs.is_empty());
    debug_assert!(probs.iter().all(|&p| p >= 0.0 && p.is_finite()));
    // Float roundoff can leave the cumulative sum slightly below 1.0, so fall back
    // to the last index instead of biasing toward 0.
    let u: f32 = rng.random();
    let mut acc = 0.0f32;
    for idx in 0..probs.len() {
        acc += probs[idx];
        if u <= acc {
            return idx;
        }
    }
    probs.len() - 1
}

/// Resample every row of a probability matrix into a class index.
pub fn resample_rows(distribution: &ArrayView2<f32>, rng: &mut impl Rng) -> Result<Vec<usize>> {
    if distribution.nrows() == 0 || distribution.ncols() == 0 {
        return Err(Error::Domain("distribution must be non-empty"));
    }
    let mut out = Vec::with_capacity(distribution.nrows());
    for row in distribution.rows() {
        out.push(sample_categorical(&row, rng));
    }
    Ok(out)
}

/// Per-row noised class distribution for one feature:
/// `ᾱ_t · probs + (1 - ᾱ_t) / k`, with `probs` the batch marginal.
///
/// Rows sum to 1 by construction whenever `probs` sums to 1, which is what makes
/// the subsequent resampling well defined.
pub fn q_x_cat_probs(
    x0: &ArrayView2<f32>,
    t: &[usize],
    schedule: &NoiseSchedule,
) -> Result<Array2<f32>> {
    if t.len() != x0.nrows() {
        return Err(Error::Shape("t must have one timestep per row of x0"));
    }
    let k = x0.ncols();
    let probs = class_probs(x0)?;
    let cumprod_alpha = extract(&schedule.alphas_prod.view(), t)?;

    let mut x_t_probs = Array2::<f32>::zeros((x0.nrows(), k));
    for i in 0..x0.nrows() {
        let a = cumprod_alpha[[i, 0]];
        let uniform = (1.0 - a) / k as f32;
        for c in 0..k {
            x_t_probs[[i, c]] = a * probs[c] + uniform;
        }
    }
    Ok(x_t_probs)
}

/// Forward-noise a one-hot feature block to per-row timesteps `t`.
///
/// Mixes the batch marginal toward uniform with `ᾱ_t` and resamples each row into
/// a hard one-hot over the feature's `k = x0.ncols()` classes.
pub fn q_x_cat(
    x0: &ArrayView2<f32>,
    t: &[usize],
    schedule: &NoiseSchedule,
    rng: &mut impl Rng,
) -> Result<Array2<f32>> {
    let x_t_probs = q_x_cat_probs(x0, t, schedule)?;
    let classes = resample_rows(&x_t_probs.view(), rng)?;
    let k = x0.ncols();
    let mut one_hot = Array2::<f32>::zeros((x0.nrows(), k));
    for (i, &c) in classes.iter().enumerate() {
        one_hot[[i, c]] = 1.0;
    }
    Ok(one_hot)
}

/// `log(exp(a) + exp(b))` without overflow.
#[inline]
pub fn log_add_exp(a: f32, b: f32) -> f32 {
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{NoiseSchedule, ScheduleKind};
    use ndarray::array;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn schedule() -> NoiseSchedule {
        NoiseSchedule::new(ScheduleKind::Linear, 100, 1e-5, 5e-3).unwrap()
    }

    #[test]
    fn class_probs_normalizes_column_sums() {
        let x0 = array![[1.0f32, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]];
        let p = class_probs(&x0.view()).unwrap();
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!((p[1] - 0.25).abs() < 1e-6);
        assert!((p[2] - 0.25).abs() < 1e-6);
    }

    #[test]
    fn zero_noise_is_the_identity_on_a_point_mass_batch() {
        // Force alpha-bar to exactly 1 at t = 0; with every row in the same class the
        // marginal is a point mass, so resampling must return x0 unchanged.
        let mut s = schedule();
        s.alphas_prod[0] = 1.0;
        let x0 = array![[0.0f32, 1.0, 0.0], [0.0, 1.0, 0.0], [0.0, 1.0, 0.0]];
        let t = vec![0usize; 3];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let x_t = q_x_cat(&x0.view(), &t, &s, &mut rng).unwrap();
        assert_eq!(x_t, x0);
    }

    #[test]
    fn terminal_noise_approaches_uniform_regardless_of_x0() {
        // Force alpha-bar to exactly 0 at the last step: the mixed distribution is
        // uniform over k classes no matter how skewed the batch is.
        let mut s = schedule();
        let last = s.num_steps - 1;
        s.alphas_prod[last] = 0.0;

        let n = 3000usize;
        let k = 3usize;
        let mut x0 = Array2::<f32>::zeros((n, k));
        x0.column_mut(0).fill(1.0); // every row in class 0

        let t = vec![last; n];
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let x_t = q_x_cat(&x0.view(), &t, &s, &mut rng).unwrap();

        let freq = x_t.sum_axis(ndarray::Axis(0)) / n as f32;
        for c in 0..k {
            assert!(
                (freq[c] - 1.0 / k as f32).abs() < 0.05,
                "class {c} frequency {} far from uniform",
                freq[c]
            );
        }
    }

    #[test]
    fn log_add_exp_matches_direct_evaluation() {
        let pairs = [(0.0f32, 0.0f32), (-3.0, 1.5), (-40.0, -41.0), (10.0, -10.0)];
        for (a, b) in pairs {
            let direct = (a.exp() + b.exp()).ln();
            assert!((log_add_exp(a, b) - direct).abs() < 1e-5);
        }
    }

    proptest! {
        #[test]
        fn prop_noised_distribution_rows_sum_to_one(
            seed in any::<u64>(),
            n in 1usize..32,
            k in 2usize..6,
        ) {
            let s = schedule();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            // Arbitrary one-hot batch.
            let mut x0 = Array2::<f32>::zeros((n, k));
            for i in 0..n {
                let c = rng.random_range(0..k);
                x0[[i, c]] = 1.0;
            }
            let t: Vec<usize> = (0..n).map(|_| rng.random_range(0..s.num_steps)).collect();

            let probs = q_x_cat_probs(&x0.view(), &t, &s).unwrap();
            for i in 0..n {
                let sum: f32 = probs.row(i).sum();
                prop_assert!((sum - 1.0).abs() < 1e-5, "row {} sums to {}", i, sum);
                for c in 0..k {
                    prop_assert!(probs[[i, c]] >= 0.0);
                }
            }

            // The resampled block is one-hot row by row.
            let x_t = q_x_cat(&x0.view(), &t, &s, &mut rng).unwrap();
            for i in 0..n {
                let sum: f32 = x_t.row(i).sum();
                prop_assert_eq!(sum, 1.0);
            }
        }
    }
}
