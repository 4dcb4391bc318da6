//! Typed layout of the one-hot discrete block.
//!
//! A [`FeatureLayout`] is an ordered list of column ranges into the concatenated
//! one-hot matrix, one range per discrete feature, validated once at construction.
//! Every routine that slices the discrete block goes through this type instead of
//! ad hoc `(start, end)` tuples.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView2};

/// Column range of one discrete feature inside the one-hot block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureRange {
    /// First column (inclusive).
    pub start: usize,
    /// One past the last column; `end - start` is the feature's cardinality.
    pub end: usize,
}

impl FeatureRange {
    #[inline]
    pub fn cardinality(&self) -> usize {
        self.end - self.start
    }
}

/// Ordered, validated list of discrete-feature ranges.
///
/// Invariants (checked by the constructors):
/// - the first range starts at column 0,
/// - ranges are contiguous (each starts where the previous ended), hence disjoint
///   and covering exactly [`Self::total_width`] columns,
/// - every range has cardinality >= 2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureLayout {
    ranges: Vec<FeatureRange>,
}

impl FeatureLayout {
    /// Build a layout from explicit `(start, end)` ranges.
    pub fn new(ranges: Vec<(usize, usize)>) -> Result<Self> {
        if ranges.is_empty() {
            return Err(Error::Domain("layout must contain at least one feature"));
        }
        let mut out = Vec::with_capacity(ranges.len());
        let mut cursor = 0usize;
        for &(start, end) in &ranges {
            if start != cursor {
                return Err(Error::Domain(
                    "feature ranges must be contiguous from column 0",
                ));
            }
            if end < start + 2 {
                return Err(Error::Domain("feature cardinality must be >= 2"));
            }
            out.push(FeatureRange { start, end });
            cursor = end;
        }
        Ok(Self { ranges: out })
    }

    /// Build a contiguous layout from per-feature cardinalities.
    pub fn from_cardinalities(cardinalities: &[usize]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(cardinalities.len());
        let mut cursor = 0usize;
        for &k in cardinalities {
            ranges.push((cursor, cursor + k));
            cursor += k;
        }
        Self::new(ranges)
    }

    /// Number of discrete features.
    #[inline]
    pub fn num_features(&self) -> usize {
        self.ranges.len()
    }

    /// Total one-hot width (the `k` summed over all features).
    #[inline]
    pub fn total_width(&self) -> usize {
        // Constructor guarantees contiguity, so the last end is the width.
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }

    /// The validated ranges, in feature order.
    #[inline]
    pub fn ranges(&self) -> &[FeatureRange] {
        &self.ranges
    }

    /// One-hot encode a matrix of category indices, one column per feature.
    ///
    /// `indices` is `(n, num_features)`; the result is `(n, total_width)`. A
    /// category index at or beyond its feature's cardinality is a configuration
    /// error and fails fast instead of silently misencoding.
    pub fn to_one_hot(&self, indices: &ArrayView2<usize>) -> Result<Array2<f32>> {
        if indices.ncols() != self.num_features() {
            return Err(Error::Shape(
                "indices must have one column per discrete feature",
            ));
        }
        let n = indices.nrows();
        let mut out = Array2::<f32>::zeros((n, self.total_width()));
        for (f, range) in self.ranges.iter().enumerate() {
            let k = range.cardinality();
            for i in 0..n {
                let class = indices[[i, f]];
                if class >= k {
                    return Err(Error::Domain(
                        "category index exceeds feature cardinality",
                    ));
                }
                out[[i, range.start + class]] = 1.0;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    #[test]
    fn rejects_gaps_overlaps_and_degenerate_ranges() {
        assert!(FeatureLayout::new(vec![]).is_err());
        assert!(FeatureLayout::new(vec![(1, 3)]).is_err()); // does not start at 0
        assert!(FeatureLayout::new(vec![(0, 3), (4, 6)]).is_err()); // gap
        assert!(FeatureLayout::new(vec![(0, 3), (2, 5)]).is_err()); // overlap
        assert!(FeatureLayout::new(vec![(0, 1)]).is_err()); // cardinality 1
        assert!(FeatureLayout::new(vec![(0, 3), (3, 5)]).is_ok());
    }

    #[test]
    fn one_hot_places_ones_at_feature_offsets() {
        let layout = FeatureLayout::from_cardinalities(&[3, 2]).unwrap();
        assert_eq!(layout.total_width(), 5);

        let indices = array![[2usize, 0], [0, 1]];
        let one_hot = layout.to_one_hot(&indices.view()).unwrap();
        assert_eq!(
            one_hot,
            array![[0.0f32, 0.0, 1.0, 1.0, 0.0], [1.0, 0.0, 0.0, 0.0, 1.0]]
        );
    }

    #[test]
    fn one_hot_fails_fast_on_out_of_range_category() {
        let layout = FeatureLayout::from_cardinalities(&[3]).unwrap();
        let indices = array![[3usize]];
        assert!(layout.to_one_hot(&indices.view()).is_err());
    }

    proptest! {
        #[test]
        fn prop_from_cardinalities_covers_exactly(
            cards in proptest::collection::vec(2usize..7, 1..6),
        ) {
            let layout = FeatureLayout::from_cardinalities(&cards).unwrap();
            prop_assert_eq!(layout.num_features(), cards.len());
            prop_assert_eq!(layout.total_width(), cards.iter().sum::<usize>());

            let mut cursor = 0usize;
            for (range, &k) in layout.ranges().iter().zip(&cards) {
                prop_assert_eq!(range.start, cursor);
                prop_assert_eq!(range.cardinality(), k);
                cursor = range.end;
            }

            // Each valid row one-hot encodes to exactly one 1 per feature.
            let indices = ndarray::Array2::from_shape_fn((4, cards.len()), |(i, f)| {
                (i * 3 + f) % cards[f]
            });
            let one_hot = layout.to_one_hot(&indices.view()).unwrap();
            for i in 0..4 {
                for range in layout.ranges() {
                    let slice = one_hot.row(i);
                    let ones: f32 = (range.start..range.end).map(|c| slice[c]).sum();
                    prop_assert_eq!(ones, 1.0);
                }
            }
        }
    }
}
