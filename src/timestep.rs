//! Per-row timestep assignment and the shared extract-and-broadcast primitive.
//!
//! Every loss and sampling routine needs the same two things: a vector of per-row
//! timestep indices, and the schedule scalar at each row's index broadcast across
//! that row's feature columns. Both live here so the gather/reshape logic exists
//! exactly once.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView1};
use rand::Rng;

/// Draw one timestep per batch row with the antithetic mirroring scheme.
///
/// Samples `batch_size / 2 + 1` indices uniformly from `[0, num_steps)`, mirrors each to
/// `num_steps - 1 - t`, concatenates, and truncates to `batch_size`. Pairing each
/// timestep with its mirror reduces the variance of the per-batch loss estimate.
pub fn sample_timesteps_antithetic(
    rng: &mut impl Rng,
    batch_size: usize,
    num_steps: usize,
) -> Result<Vec<usize>> {
    if batch_size == 0 {
        return Err(Error::Domain("batch_size must be >= 1"));
    }
    if num_steps == 0 {
        return Err(Error::Domain("num_steps must be >= 1"));
    }
    let half = batch_size / 2 + 1;
    let mut t = Vec::with_capacity(half * 2);
    for _ in 0..half {
        t.push(rng.random_range(0..num_steps));
    }
    for i in 0..half {
        t.push(num_steps - 1 - t[i]);
    }
    t.truncate(batch_size);
    Ok(t)
}

/// Gather `values[t[i]]` for every row `i` and reshape to an `(n, 1)` column.
///
/// The column co-broadcasts against any `(n, c)` feature matrix, so one call
/// turns a per-timestep schedule scalar into a per-row coefficient:
///
/// ```
/// use ndarray::{array, ArrayView1};
/// use tabdiff::timestep::extract;
///
/// let values = array![0.1f32, 0.2, 0.3];
/// let col = extract(&values.view(), &[2, 0]).unwrap();
/// let x = array![[1.0f32, 1.0], [1.0, 1.0]];
/// let scaled = &col * &x;
/// assert_eq!(scaled, array![[0.3f32, 0.3], [0.1, 0.1]]);
/// ```
pub fn extract(values: &ArrayView1<f32>, t: &[usize]) -> Result<Array2<f32>> {
    if t.is_empty() {
        return Err(Error::Domain("t must be non-empty"));
    }
    let mut out = Array2::<f32>::zeros((t.len(), 1));
    for (i, &ti) in t.iter().enumerate() {
        if ti >= values.len() {
            return Err(Error::Domain("timestep index out of schedule range"));
        }
        out[[i, 0]] = values[ti];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn extract_rejects_out_of_range_index() {
        let values = Array1::<f32>::zeros(4);
        assert!(extract(&values.view(), &[4]).is_err());
        assert!(extract(&values.view(), &[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_extract_reproduces_gathered_scalars(
            num_steps in 1usize..64,
            n in 1usize..32,
            seed in any::<u64>(),
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let values = Array1::from_iter((0..num_steps).map(|i| i as f32 * 0.5 + 0.25));
            let t: Vec<usize> = (0..n).map(|_| rng.random_range(0..num_steps)).collect();

            let col = extract(&values.view(), &t).unwrap();
            prop_assert_eq!(col.shape(), &[n, 1]);
            for i in 0..n {
                prop_assert_eq!(col[[i, 0]], values[t[i]]);
            }

            // Broadcasting against a feature matrix repeats the row scalar.
            let x = ndarray::Array2::<f32>::ones((n, 3));
            let scaled = &col * &x;
            for i in 0..n {
                for k in 0..3 {
                    prop_assert_eq!(scaled[[i, k]], values[t[i]]);
                }
            }
        }
    }

    proptest! {
        #[test]
        fn prop_antithetic_timesteps_in_range_and_mirrored(
            batch_size in 1usize..64,
            num_steps in 1usize..128,
            seed in any::<u64>(),
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let t = sample_timesteps_antithetic(&mut rng, batch_size, num_steps).unwrap();
            prop_assert_eq!(t.len(), batch_size);
            for &ti in &t {
                prop_assert!(ti < num_steps);
            }
            // The tail mirrors the head: index half + i holds num_steps - 1 - t[i].
            let half = batch_size / 2 + 1;
            for i in 0..batch_size.saturating_sub(half) {
                prop_assert_eq!(t[half + i], num_steps - 1 - t[i]);
            }
        }
    }
}
