//! Numeric evaluation of generated data against real data.
//!
//! Fixed-range histograms over continuous columns, KL and Jensen-Shannon
//! divergence between normalized histograms, per-feature class frequencies for
//! the discrete block, and first/second moment gaps. Everything returns plain
//! numbers; presentation is the caller's concern.

use crate::layout::FeatureLayout;
use crate::{Error, Result};
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Count `values` into `bins` equal-width buckets over `[min, max]`.
///
/// Values outside the range are ignored; `max` itself lands in the last bucket.
pub fn histogram(values: &ArrayView1<f32>, min: f32, max: f32, bins: usize) -> Result<Array1<f32>> {
    if bins == 0 {
        return Err(Error::Domain("bins must be >= 1"));
    }
    if !(min < max) || !min.is_finite() || !max.is_finite() {
        return Err(Error::Domain("histogram range must be finite with min < max"));
    }
    let width = (max - min) / bins as f32;
    let mut counts = Array1::<f32>::zeros(bins);
    for &v in values.iter() {
        if v < min || v > max || !v.is_finite() {
            continue;
        }
        let idx = (((v - min) / width) as usize).min(bins - 1);
        counts[idx] += 1.0;
    }
    Ok(counts)
}

/// Scale a nonnegative count vector into a probability vector.
pub fn normalize_histogram(counts: &ArrayView1<f32>) -> Result<Array1<f32>> {
    if counts.is_empty() {
        return Err(Error::Domain("counts must be non-empty"));
    }
    if counts.iter().any(|&c| c < 0.0 || !c.is_finite()) {
        return Err(Error::Domain("counts must be finite and nonnegative"));
    }
    let total: f32 = counts.sum();
    if total <= 0.0 {
        return Err(Error::Domain("counts must have positive total mass"));
    }
    Ok(counts / total)
}

/// `KL(p || q) = Σ p·ln(p/q)` in nats.
///
/// Terms with `p = 0` contribute nothing; `p > 0` against `q = 0` yields
/// `+inf`, the relative-entropy convention.
pub fn kl_divergence(p: &ArrayView1<f32>, q: &ArrayView1<f32>) -> Result<f32> {
    if p.len() != q.len() || p.is_empty() {
        return Err(Error::Shape("p and q must be non-empty and equally long"));
    }
    let mut sum = 0.0f64;
    for (&pi, &qi) in p.iter().zip(q.iter()) {
        if pi < 0.0 || qi < 0.0 {
            return Err(Error::Domain("probabilities must be nonnegative"));
        }
        if pi == 0.0 {
            continue;
        }
        if qi == 0.0 {
            return Ok(f32::INFINITY);
        }
        sum += pi as f64 * (pi as f64 / qi as f64).ln();
    }
    Ok(sum as f32)
}

/// Jensen-Shannon divergence in nats: symmetric, finite, bounded by `ln 2`.
pub fn js_divergence(p: &ArrayView1<f32>, q: &ArrayView1<f32>) -> Result<f32> {
    if p.len() != q.len() || p.is_empty() {
        return Err(Error::Shape("p and q must be non-empty and equally long"));
    }
    let m: Array1<f32> = (p + q) / 2.0;
    let kl_pm = kl_divergence(p, &m.view())?;
    let kl_qm = kl_divergence(q, &m.view())?;
    Ok(0.5 * kl_pm + 0.5 * kl_qm)
}

/// JS divergence per continuous column between real and fake data, each column
/// histogrammed over the same fixed range.
pub fn column_js_divergence(
    real: &ArrayView2<f32>,
    fake: &ArrayView2<f32>,
    min: f32,
    max: f32,
    bins: usize,
) -> Result<Array1<f32>> {
    if real.ncols() != fake.ncols() {
        return Err(Error::Shape("real and fake must have the same columns"));
    }
    let mut out = Array1::<f32>::zeros(real.ncols());
    for c in 0..real.ncols() {
        let hr = histogram(&real.column(c), min, max, bins)?;
        let hf = histogram(&fake.column(c), min, max, bins)?;
        let pr = normalize_histogram(&hr.view())?;
        let pf = normalize_histogram(&hf.view())?;
        out[c] = js_divergence(&pr.view(), &pf.view())?;
    }
    Ok(out)
}

/// Class frequencies of a one-hot block: column sums over row count.
///
/// Within each feature range of `layout` the frequencies sum to 1.
pub fn feature_frequencies(
    one_hot: &ArrayView2<f32>,
    layout: &FeatureLayout,
) -> Result<Array1<f32>> {
    if one_hot.ncols() != layout.total_width() {
        return Err(Error::Shape("one-hot width must match the layout"));
    }
    if one_hot.nrows() == 0 {
        return Err(Error::Domain("one-hot block must have rows"));
    }
    Ok(one_hot.sum_axis(Axis(0)) / one_hot.nrows() as f32)
}

/// Absolute per-column gaps in mean and standard deviation between real and
/// fake continuous data. Standard deviation is the unbiased estimate; a single
/// row yields 0.
pub fn moment_gaps(
    real: &ArrayView2<f32>,
    fake: &ArrayView2<f32>,
) -> Result<(Array1<f32>, Array1<f32>)> {
    if real.ncols() != fake.ncols() {
        return Err(Error::Shape("real and fake must have the same columns"));
    }
    if real.nrows() == 0 || fake.nrows() == 0 {
        return Err(Error::Domain("both data sets must have rows"));
    }
    let stats = |data: &ArrayView2<f32>, c: usize| -> (f64, f64) {
        let col = data.column(c);
        let n = col.len() as f64;
        let mean: f64 = col.iter().map(|&v| v as f64).sum::<f64>() / n;
        let var = if col.len() > 1 {
            col.iter()
                .map(|&v| {
                    let d = v as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / (n - 1.0)
        } else {
            0.0
        };
        (mean, var.sqrt())
    };
    let mut mean_gap = Array1::<f32>::zeros(real.ncols());
    let mut std_gap = Array1::<f32>::zeros(real.ncols());
    for c in 0..real.ncols() {
        let (mr, sr) = stats(real, c);
        let (mf, sf) = stats(fake, c);
        mean_gap[c] = (mr - mf).abs() as f32;
        std_gap[c] = (sr - sf).abs() as f32;
    }
    Ok((mean_gap, std_gap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gaussian::randn;
    use crate::loss::random_one_hot;
    use ndarray::array;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn histogram_buckets_known_values() {
        let v = array![-1.0f32, -0.95, 0.0, 0.99, 1.0, 2.0, f32::NAN];
        let h = histogram(&v.view(), -1.0, 1.0, 10).unwrap();
        assert_eq!(h[0], 2.0); // -1.0 and -0.95
        assert_eq!(h[5], 1.0); // 0.0
        assert_eq!(h[9], 2.0); // 0.99 and the inclusive max
        assert_eq!(h.sum(), 5.0); // 2.0 and NaN ignored
    }

    #[test]
    fn kl_is_zero_for_identical_distributions() {
        let p = array![0.25f32, 0.25, 0.5];
        assert!(kl_divergence(&p.view(), &p.view()).unwrap().abs() < 1e-7);
    }

    #[test]
    fn kl_is_infinite_when_support_is_missing() {
        let p = array![0.5f32, 0.5];
        let q = array![1.0f32, 0.0];
        assert!(kl_divergence(&p.view(), &q.view()).unwrap().is_infinite());
        // The other direction is finite: q puts no mass where p does.
        assert!(kl_divergence(&q.view(), &p.view()).unwrap().is_finite());
    }

    #[test]
    fn js_of_disjoint_distributions_is_ln_two() {
        let p = array![1.0f32, 0.0];
        let q = array![0.0f32, 1.0];
        let js = js_divergence(&p.view(), &q.view()).unwrap();
        assert!((js - core::f32::consts::LN_2).abs() < 1e-6);
    }

    #[test]
    fn feature_frequencies_sum_to_one_per_feature() {
        let layout = FeatureLayout::from_cardinalities(&[3, 2]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut block = ndarray::Array2::<f32>::zeros((40, 5));
        for range in layout.ranges() {
            for i in 0..40 {
                let c = rng.random_range(range.start..range.end);
                block[[i, c]] = 1.0;
            }
        }
        let freq = feature_frequencies(&block.view(), &layout).unwrap();
        for range in layout.ranges() {
            let sum: f32 = (range.start..range.end).map(|c| freq[c]).sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn moment_gaps_vanish_for_identical_data() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let data = randn(&mut rng, 50, 3);
        let (mg, sg) = moment_gaps(&data.view(), &data.view()).unwrap();
        assert!(mg.iter().all(|&g| g < 1e-6));
        assert!(sg.iter().all(|&g| g < 1e-6));
    }

    #[test]
    fn column_js_is_small_for_same_distribution_large_for_shifted() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let real = randn(&mut rng, 2000, 1).mapv(|v| (v * 0.25).clamp(-1.0, 1.0));
        let same = randn(&mut rng, 2000, 1).mapv(|v| (v * 0.25).clamp(-1.0, 1.0));
        let shifted = real.mapv(|v| (v + 0.8).clamp(-1.0, 1.0));

        let close = column_js_divergence(&real.view(), &same.view(), -1.0, 1.0, 10).unwrap();
        let far = column_js_divergence(&real.view(), &shifted.view(), -1.0, 1.0, 10).unwrap();
        assert!(close[0] < far[0]);
    }

    #[test]
    fn frequencies_of_uniform_one_hot_are_near_uniform() {
        let layout = FeatureLayout::from_cardinalities(&[4]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(8);
        let block = random_one_hot(&mut rng, 4000, 4);
        let freq = feature_frequencies(&block.view(), &layout).unwrap();
        for &f in freq.iter() {
            assert!((f - 0.25).abs() < 0.05);
        }
    }

    proptest! {
        #[test]
        fn prop_js_is_symmetric_and_bounded(
            a in proptest::collection::vec(0.01f32..1.0, 4),
            b in proptest::collection::vec(0.01f32..1.0, 4),
        ) {
            let p = normalize_histogram(&Array1::from(a).view()).unwrap();
            let q = normalize_histogram(&Array1::from(b).view()).unwrap();
            let pq = js_divergence(&p.view(), &q.view()).unwrap();
            let qp = js_divergence(&q.view(), &p.view()).unwrap();
            prop_assert!((pq - qp).abs() < 1e-5);
            prop_assert!(pq >= -1e-6);
            prop_assert!(pq <= core::f32::consts::LN_2 + 1e-5);
        }
    }
}
