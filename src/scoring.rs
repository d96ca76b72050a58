//! BM25 relevance with floored IDF and phrase proximity.

use std::{cmp::Reverse, collections::BinaryHeap};

use crate::query::MatchStage;

/// Lower bound for IDF so very common terms never contribute negatively.
pub const IDF_FLOOR: f64 = 1e-6;

/// Document length ratios above this are clamped.
pub const MAX_LENGTH_RATIO: f64 = 4.0;

/// Scale of the phrase proximity bonus.
pub const PROXIMITY_WEIGHT: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringParams {
    pub k1: f64,
    pub b: f64,
    pub synonym_weight: f64,
    pub fuzzy_weight: f64,
    pub prefix_weight: f64,
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            synonym_weight: 0.6,
            fuzzy_weight: 0.5,
            prefix_weight: 0.4,
        }
    }
}

impl ScoringParams {
    /// Weight of a term derived through `stage`; fuzzy matches are divided
    /// by their edit distance.
    pub fn term_weight(&self, stage: MatchStage, distance: usize) -> f64 {
        match stage {
            MatchStage::Exact => 1.0,
            MatchStage::Synonym => self.synonym_weight,
            MatchStage::Fuzzy => self.fuzzy_weight / distance.max(1) as f64,
            MatchStage::Prefix => self.prefix_weight,
        }
    }
}

/// Inverse document frequency with a positive floor.
///
/// `df` is clamped to `n`, so inconsistent statistics still produce a
/// finite, positive weight.
pub fn idf(df: usize, n: usize) -> f64 {
    let df = df.min(n) as f64;
    let n = n as f64;
    let raw = ((n - df + 0.5) / (df + 0.5) + IDF_FLOOR).ln() + 1.0;
    raw.max(IDF_FLOOR)
}

/// Ratio of a document length to the average, clamped to
/// [`MAX_LENGTH_RATIO`]. An unknown average counts as 1.
pub fn length_ratio(dl: f64, avgdl: f64) -> f64 {
    if avgdl <= 0.0 || !avgdl.is_finite() {
        1.0
    } else {
        (dl / avgdl).min(MAX_LENGTH_RATIO)
    }
}

/// BM25 term-frequency weight. Zero for `tf <= 0`.
pub fn bm25(tf: f64, dl: f64, avgdl: f64, k1: f64, b: f64) -> f64 {
    if tf <= 0.0 {
        return 0.0;
    }
    let norm = 1.0 - b + b * length_ratio(dl, avgdl);
    tf * (k1 + 1.0) / (tf + k1 * norm)
}

/// Smallest window of token positions covering one position from every
/// list.
///
/// Lists must be ascending. Returns `f64::INFINITY` when there are no
/// lists or any list is empty, and 1 for a single non-empty list.
///
/// # Examples
///
/// ```
/// use segdex::scoring::min_span;
///
/// assert_eq!(min_span([vec![0, 10], vec![4, 11]]), 2.0);
/// assert_eq!(min_span([vec![3]]), 1.0);
/// assert!(min_span(Vec::<Vec<u32>>::new()).is_infinite());
/// ```
pub fn min_span<I>(lists: I) -> f64
where
    I: IntoIterator,
    I::Item: AsRef<[u32]>,
{
    let lists: Vec<I::Item> = lists.into_iter().collect();
    if lists.is_empty() || lists.iter().any(|l| l.as_ref().is_empty()) {
        return f64::INFINITY;
    }
    if lists.len() == 1 {
        return 1.0;
    }

    // Heap of (position, list, index into list); the window is
    // [heap min, current max].
    let mut heap = BinaryHeap::with_capacity(lists.len());
    let mut max = 0u32;
    for (i, list) in lists.iter().enumerate() {
        let first = list.as_ref()[0];
        max = max.max(first);
        heap.push(Reverse((first, i, 0usize)));
    }

    let mut best = u32::MAX;
    while let Some(Reverse((min, list, idx))) = heap.pop() {
        best = best.min(max - min + 1);
        if best == 1 {
            break;
        }
        let positions = lists[list].as_ref();
        let Some(&next) = positions.get(idx + 1) else {
            break;
        };
        max = max.max(next);
        heap.push(Reverse((next, list, idx + 1)));
    }

    f64::from(best)
}

/// Multiplier rewarding `term_count` terms found within `span` positions.
/// Never below 1; decreases as the span grows.
pub fn proximity_bonus(term_count: usize, span: f64) -> f64 {
    if term_count < 2 || !span.is_finite() || span <= 0.0 {
        return 1.0;
    }
    1.0 + PROXIMITY_WEIGHT * term_count as f64 / span
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn idf_is_floored() {
        // Every document has the term.
        assert!(idf(100, 100) > 0.0);
        assert!(idf(1_000, 100) >= IDF_FLOOR);
        assert!(idf(0, 0) > 0.0);
        assert!(idf(1, 100) > idf(50, 100));
    }

    #[test]
    fn bm25_zero_tf() {
        assert_eq!(bm25(0.0, 10.0, 10.0, 1.5, 0.75), 0.0);
        assert_eq!(bm25(-1.0, 10.0, 10.0, 1.5, 0.75), 0.0);
    }

    #[test]
    fn bm25_length_ratio_is_capped() {
        let at_cap = bm25(2.0, 40.0, 10.0, 1.5, 0.75);
        let beyond = bm25(2.0, 4_000.0, 10.0, 1.5, 0.75);
        assert_eq!(at_cap, beyond);
    }

    #[test]
    fn bm25_unknown_average() {
        let a = bm25(1.0, 5.0, 0.0, 1.5, 0.75);
        let b = bm25(1.0, 5.0, 5.0, 1.5, 0.75);
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn term_weights() {
        let params = ScoringParams::default();
        assert_eq!(params.term_weight(MatchStage::Exact, 0), 1.0);
        assert_eq!(params.term_weight(MatchStage::Synonym, 0), 0.6);
        assert_eq!(params.term_weight(MatchStage::Fuzzy, 2), 0.25);
        assert_eq!(params.term_weight(MatchStage::Prefix, 0), 0.4);
    }

    #[test]
    fn min_span_cases() {
        assert_eq!(min_span([vec![1, 5, 9], vec![4, 12], vec![10]]), 4.0);
        assert_eq!(min_span([vec![0], vec![1]]), 2.0);
        assert_eq!(min_span([vec![7], vec![7]]), 1.0);
        assert!(min_span([vec![1], vec![]]).is_infinite());
        assert_eq!(min_span([[2u32, 8].as_slice()]), 1.0);
    }

    #[test]
    fn min_span_reference_vectors() {
        assert_eq!(min_span([vec![0], vec![1], vec![2]]), 3.0);
        assert_eq!(min_span([vec![0, 10], vec![2, 15]]), 3.0);
    }

    #[test]
    fn proximity_prefers_tight_spans() {
        assert!(proximity_bonus(2, 2.0) > proximity_bonus(2, 20.0));
        assert_eq!(proximity_bonus(1, 1.0), 1.0);
        assert_eq!(proximity_bonus(3, f64::INFINITY), 1.0);
    }

    proptest! {
        #[test]
        fn bm25_grows_with_tf(tf in 1u32..50, dl in 1u32..500, avg in 1u32..500) {
            let lo = bm25(f64::from(tf), f64::from(dl), f64::from(avg), 1.5, 0.75);
            let hi = bm25(f64::from(tf + 1), f64::from(dl), f64::from(avg), 1.5, 0.75);
            prop_assert!(hi > lo);
            prop_assert!(hi < 2.5 + 1e-9);
        }

        #[test]
        fn idf_is_never_below_floor(df in 0usize..1_000, n in 0usize..1_000) {
            let value = idf(df, n);
            prop_assert!(value.is_finite());
            prop_assert!(value >= IDF_FLOOR);
        }

        #[test]
        fn min_span_matches_brute_force(
            a in proptest::collection::btree_set(0u32..40, 1..6),
            b in proptest::collection::btree_set(0u32..40, 1..6),
        ) {
            let a: Vec<u32> = a.into_iter().collect();
            let b: Vec<u32> = b.into_iter().collect();
            let brute = a
                .iter()
                .flat_map(|x| b.iter().map(move |y| x.abs_diff(*y) + 1))
                .min()
                .unwrap();
            prop_assert_eq!(min_span([&a, &b]), f64::from(brute));
        }
    }
}
