//! Rand Index: pairwise agreement between two partitions of the same
//! units. Labels are symbols, so the score is invariant under relabeling
//! of either input.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScoreError {
    #[error("Partitions have different lengths: {a} vs {b}.")]
    LengthMismatch { a: usize, b: usize },
}

/// Fraction of unordered unit pairs on which the two partitions agree
/// (both co-cluster the pair, or both separate it). Value in [0, 1].
///
/// With fewer than two units there are no pairs to disagree on; the
/// partitions vacuously agree and the score is 1.
pub fn rand_index(a: &[usize], b: &[usize]) -> Result<f64, ScoreError> {
    if a.len() != b.len() {
        return Err(ScoreError::LengthMismatch {
            a: a.len(),
            b: b.len(),
        });
    }
    let s = a.len();
    if s < 2 {
        return Ok(1.0);
    }
    let mut agreements = 0usize;
    let mut pairs = 0usize;
    for i in 0..s {
        for j in (i + 1)..s {
            pairs += 1;
            let together_a = a[i] == a[j];
            let together_b = b[i] == b[j];
            if together_a == together_b {
                agreements += 1;
            }
        }
    }
    Ok(agreements as f64 / pairs as f64)
}
