//! Vectorized BM25 over batches of postings.

use tracing::warn;
use wide::f64x4;

use crate::scoring::{self, MAX_LENGTH_RATIO};

/// Batches smaller than this are scored with the scalar kernel.
pub const MIN_VECTOR_ROWS: usize = 10;

/// Whether the target was compiled with a SIMD instruction set that
/// `wide` lowers to. Without one `wide` emulates lanes in scalar code.
pub fn simd_available() -> bool {
    cfg!(any(
        target_feature = "sse2",
        target_feature = "neon",
        target_feature = "simd128"
    ))
}

/// Columns of BM25 inputs; row `i` is one posting.
#[derive(Debug, Clone, Default)]
pub struct ScoreBatch {
    tf: Vec<f64>,
    dl: Vec<f64>,
    avgdl: Vec<f64>,
    /// Everything multiplied onto the BM25 weight: idf, boost, term weight.
    factor: Vec<f64>,
}

impl ScoreBatch {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            tf: Vec::with_capacity(rows),
            dl: Vec::with_capacity(rows),
            avgdl: Vec::with_capacity(rows),
            factor: Vec::with_capacity(rows),
        }
    }

    /// Append a row. An unusable average length is stored as a length
    /// ratio of 1.
    pub fn push(&mut self, tf: f64, dl: f64, avgdl: f64, factor: f64) {
        let (dl, avgdl) = if avgdl > 0.0 && avgdl.is_finite() {
            (dl, avgdl)
        } else {
            (1.0, 1.0)
        };
        self.tf.push(tf);
        self.dl.push(dl);
        self.avgdl.push(avgdl);
        self.factor.push(factor);
    }

    pub fn len(&self) -> usize {
        self.tf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tf.is_empty()
    }

    pub fn clear(&mut self) {
        self.tf.clear();
        self.dl.clear();
        self.avgdl.clear();
        self.factor.clear();
    }
}

/// Score every row with [`scoring::bm25`].
pub fn score_scalar(batch: &ScoreBatch, k1: f64, b: f64) -> Vec<f64> {
    (0..batch.len())
        .map(|i| {
            scoring::bm25(batch.tf[i], batch.dl[i], batch.avgdl[i], k1, b)
                * batch.factor[i]
        })
        .collect()
}

/// Score rows four at a time.
///
/// Agrees with [`score_scalar`] to within floating-point rounding. Small
/// batches and batches producing non-finite values go through the scalar
/// kernel instead.
pub fn score_vectorized(batch: &ScoreBatch, k1: f64, b: f64) -> Vec<f64> {
    let rows = batch.len();
    if rows < MIN_VECTOR_ROWS {
        return score_scalar(batch, k1, b);
    }

    let k1_v = f64x4::splat(k1);
    let k1_plus_one = f64x4::splat(k1 + 1.0);
    let one_minus_b = f64x4::splat(1.0 - b);
    let b_v = f64x4::splat(b);
    let cap = f64x4::splat(MAX_LENGTH_RATIO);

    let mut out = Vec::with_capacity(rows);
    let full = rows - rows % 4;
    for i in (0..full).step_by(4) {
        let lane = |col: &[f64]| {
            f64x4::from([col[i], col[i + 1], col[i + 2], col[i + 3]])
        };
        let tf = lane(&batch.tf);
        let ratio = (lane(&batch.dl) / lane(&batch.avgdl)).min(cap);
        let norm = one_minus_b + b_v * ratio;
        let weight = tf * k1_plus_one / (tf + k1_v * norm);
        out.extend_from_slice(&(weight * lane(&batch.factor)).to_array());
    }
    for i in full..rows {
        out.push(
            scoring::bm25(batch.tf[i], batch.dl[i], batch.avgdl[i], k1, b)
                * batch.factor[i],
        );
    }

    // bm25 is zero for non-positive tf; the lanes do not branch.
    for (score, tf) in out.iter_mut().zip(&batch.tf) {
        if *tf <= 0.0 {
            *score = 0.0;
        }
    }

    if out.iter().any(|s| !s.is_finite()) {
        warn!(
            target: "segdex::simd",
            rows,
            "non-finite vectorized scores, using scalar kernel"
        );
        return score_scalar(batch, k1, b);
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn batch(rows: &[(f64, f64, f64, f64)]) -> ScoreBatch {
        let mut batch = ScoreBatch::with_capacity(rows.len());
        for &(tf, dl, avgdl, factor) in rows {
            batch.push(tf, dl, avgdl, factor);
        }
        batch
    }

    fn assert_close(a: &[f64], b: &[f64]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            let scale = x.abs().max(y.abs()).max(1e-300);
            assert!((x - y).abs() / scale <= 1e-9, "{x} vs {y}");
        }
    }

    #[test]
    fn small_batches_use_scalar() {
        let rows = batch(&[(1.0, 10.0, 10.0, 2.0), (3.0, 5.0, 10.0, 1.0)]);
        assert_eq!(
            score_vectorized(&rows, 1.5, 0.75),
            score_scalar(&rows, 1.5, 0.75)
        );
    }

    #[test]
    fn handles_remainder_and_zero_tf() {
        let rows: Vec<_> = (0..13)
            .map(|i| (f64::from(i % 4), f64::from(i + 1), 7.5, 1.3))
            .collect();
        let rows = batch(&rows);
        let vectorized = score_vectorized(&rows, 1.5, 0.75);
        assert_close(&vectorized, &score_scalar(&rows, 1.5, 0.75));
        assert_eq!(vectorized[0], 0.0);
        assert_eq!(vectorized[4], 0.0);
    }

    #[test]
    fn unknown_average_counts_as_ratio_one() {
        let rows: Vec<_> = (0..12).map(|_| (2.0, 50.0, 0.0, 1.0)).collect();
        let rows = batch(&rows);
        let expected = scoring::bm25(2.0, 1.0, 1.0, 1.5, 0.75);
        for score in score_vectorized(&rows, 1.5, 0.75) {
            assert!((score - expected).abs() < 1e-12);
        }
    }

    #[test]
    fn non_finite_falls_back() {
        let rows: Vec<_> = (0..12).map(|_| (1.0, 1.0, 1.0, f64::INFINITY)).collect();
        let rows = batch(&rows);
        let scores = score_vectorized(&rows, 1.5, 0.75);
        assert_eq!(scores, score_scalar(&rows, 1.5, 0.75));
    }

    proptest! {
        #[test]
        fn vectorized_matches_scalar(
            rows in proptest::collection::vec(
                (0u32..30, 1u32..2_000, 1u32..500, 0.001f64..20.0),
                0..64,
            ),
            k1 in 0.5f64..3.0,
            b in 0.0f64..=1.0,
        ) {
            let rows: Vec<_> = rows
                .into_iter()
                .map(|(tf, dl, avg, f)| {
                    (f64::from(tf), f64::from(dl), f64::from(avg), f)
                })
                .collect();
            let rows = batch(&rows);
            let scalar = score_scalar(&rows, k1, b);
            let vectorized = score_vectorized(&rows, k1, b);
            prop_assert_eq!(scalar.len(), vectorized.len());
            for (x, y) in scalar.iter().zip(&vectorized) {
                let scale = x.abs().max(y.abs()).max(1e-300);
                prop_assert!((x - y).abs() / scale <= 1e-9);
            }
        }
    }
}
