//! Posterior-consensus clustering.
//!
//! Mixture labels switch freely between draws, so partitions are compared
//! on co-membership rather than raw label identity. Dahl's method picks,
//! among the observed partitions, the one whose binary co-membership
//! matrix is closest (squared Frobenius distance) to the ensemble average
//! — the output is always an actually observed partition, never a
//! synthetic blend. The mode estimator is the cheap per-unit baseline and
//! carries no such guarantee.

use crate::oracle::PartitionEnsemble;
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Partition ensemble is empty; nothing to aggregate.")]
    EmptyEnsemble,
}

/// Pairwise co-clustering frequency across the ensemble (`bBar`).
/// Symmetric, unit diagonal, entries in [0, 1].
pub fn co_membership(labels: ArrayView2<'_, usize>) -> Array2<f64> {
    let m = labels.nrows();
    let s = labels.ncols();
    let mut b_bar = Array2::<f64>::zeros((s, s));
    for row in labels.rows() {
        for i in 0..s {
            for j in 0..s {
                if row[i] == row[j] {
                    b_bar[[i, j]] += 1.0;
                }
            }
        }
    }
    if m > 0 {
        b_bar.mapv_inplace(|v| v / m as f64);
    }
    b_bar
}

/// The consensus partition chosen by Dahl's method.
#[derive(Debug, Clone, PartialEq)]
pub struct DahlConsensus {
    /// Row of the ensemble that won.
    pub member_index: usize,
    /// MCMC draw the winning row came from.
    pub draw_index: usize,
    /// The winning partition itself (an exact copy of an observed row).
    pub partition: Vec<usize>,
    /// Its squared Frobenius distance to the mean co-membership matrix.
    pub distance: f64,
}

/// Dahl's method: the observed partition minimizing the squared Frobenius
/// distance between its binary co-membership matrix and `bBar`. Ties break
/// to the lowest member index, so the result is reproducible.
pub fn dahl_partition(ensemble: &PartitionEnsemble) -> Result<DahlConsensus, ConsensusError> {
    let labels = ensemble.labels.view();
    let m = labels.nrows();
    let s = labels.ncols();
    if m == 0 {
        return Err(ConsensusError::EmptyEnsemble);
    }
    let b_bar = co_membership(labels);

    let mut best_index = 0usize;
    let mut best_distance = f64::INFINITY;
    for idx in 0..m {
        let row = labels.row(idx);
        let mut distance = 0.0;
        for i in 0..s {
            for j in 0..s {
                let b_ij = if row[i] == row[j] { 1.0 } else { 0.0 };
                let d = b_ij - b_bar[[i, j]];
                distance += d * d;
            }
        }
        // Strict inequality keeps the lowest index on ties.
        if distance < best_distance {
            best_distance = distance;
            best_index = idx;
        }
    }

    Ok(DahlConsensus {
        member_index: best_index,
        draw_index: ensemble.draw_indices[best_index],
        partition: labels.row(best_index).to_vec(),
        distance: best_distance,
    })
}

/// Mode estimator: each unit independently takes its most frequent label
/// across the ensemble, ties to the smallest label value. O(M*S), but the
/// result is not guaranteed to equal any observed partition.
pub fn mode_partition(ensemble: &PartitionEnsemble) -> Result<Vec<usize>, ConsensusError> {
    let labels = ensemble.labels.view();
    let m = labels.nrows();
    let s = labels.ncols();
    if m == 0 {
        return Err(ConsensusError::EmptyEnsemble);
    }
    let mut result = Vec::with_capacity(s);
    for unit in 0..s {
        let mut counts: Vec<(usize, usize)> = Vec::new();
        for draw in 0..m {
            let label = labels[[draw, unit]];
            match counts.iter_mut().find(|(l, _)| *l == label) {
                Some((_, c)) => *c += 1,
                None => counts.push((label, 1)),
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        result.push(counts[0].0);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ensemble_from(labels: Array2<usize>) -> PartitionEnsemble {
        let draw_indices = (0..labels.nrows()).collect();
        let total_draws = labels.nrows();
        PartitionEnsemble {
            labels,
            draw_indices,
            dropped: Vec::new(),
            total_draws,
        }
    }

    #[test]
    fn co_membership_matches_hand_computed_scenario() {
        let labels = array![[1, 1, 2], [1, 1, 2], [1, 2, 2]];
        let b_bar = co_membership(labels.view());
        let expected = [
            [1.0, 2.0 / 3.0, 0.0],
            [2.0 / 3.0, 1.0, 1.0 / 3.0],
            [0.0, 1.0 / 3.0, 1.0],
        ];
        for i in 0..3 {
            for j in 0..3 {
                assert!(
                    (b_bar[[i, j]] - expected[i][j]).abs() < 1e-12,
                    "bBar[{i},{j}] = {}",
                    b_bar[[i, j]]
                );
            }
        }
    }

    #[test]
    fn dahl_tie_breaks_to_lowest_index() {
        // Members 0 and 1 are identical, so they tie; the lowest wins.
        let ensemble = ensemble_from(array![[1, 1, 2], [1, 1, 2], [1, 2, 2]]);
        let consensus = dahl_partition(&ensemble).expect("non-empty ensemble");
        assert_eq!(consensus.member_index, 0);
        assert_eq!(consensus.partition, vec![1, 1, 2]);
    }

    #[test]
    fn dahl_output_is_an_observed_member() {
        let labels = array![
            [1, 1, 2, 2],
            [1, 2, 2, 2],
            [1, 1, 1, 2],
            [1, 1, 2, 2],
            [2, 2, 1, 1],
        ];
        let ensemble = ensemble_from(labels.clone());
        let consensus = dahl_partition(&ensemble).expect("non-empty ensemble");
        let observed: Vec<usize> = labels.row(consensus.member_index).to_vec();
        assert_eq!(consensus.partition, observed);
    }

    #[test]
    fn dahl_singleton_ensemble_returns_its_only_member() {
        let ensemble = ensemble_from(array![[3, 1, 3, 2]]);
        let consensus = dahl_partition(&ensemble).expect("non-empty ensemble");
        assert_eq!(consensus.member_index, 0);
        assert_eq!(consensus.partition, vec![3, 1, 3, 2]);
        assert!(consensus.distance.abs() < 1e-12);
    }

    #[test]
    fn dahl_two_member_ensemble_picks_first_on_tie() {
        // Two distinct members are equidistant from their average.
        let ensemble = ensemble_from(array![[1, 1, 2], [1, 2, 2]]);
        let consensus = dahl_partition(&ensemble).expect("non-empty ensemble");
        assert_eq!(consensus.member_index, 0);
    }

    #[test]
    fn dahl_reports_source_draw_index() {
        let labels = array![[1, 1, 2], [1, 1, 2], [1, 2, 2]];
        let mut ensemble = ensemble_from(labels);
        // Pretend draws 4, 7, 9 survived the oracle stage.
        ensemble.draw_indices = vec![4, 7, 9];
        let consensus = dahl_partition(&ensemble).expect("non-empty ensemble");
        assert_eq!(consensus.draw_index, 4);
    }

    #[test]
    fn mode_of_identical_members_is_that_member() {
        let ensemble = ensemble_from(array![[2, 1, 3], [2, 1, 3], [2, 1, 3]]);
        let mode = mode_partition(&ensemble).expect("non-empty ensemble");
        assert_eq!(mode, vec![2, 1, 3]);
    }

    #[test]
    fn mode_breaks_ties_to_smallest_label() {
        let ensemble = ensemble_from(array![[1, 5], [2, 4], [2, 5], [1, 4]]);
        let mode = mode_partition(&ensemble).expect("non-empty ensemble");
        assert_eq!(mode, vec![1, 4]);
    }

    #[test]
    fn empty_ensemble_is_rejected() {
        let ensemble = ensemble_from(Array2::<usize>::zeros((0, 3)));
        assert!(matches!(
            dahl_partition(&ensemble),
            Err(ConsensusError::EmptyEnsemble)
        ));
        assert!(matches!(
            mode_partition(&ensemble),
            Err(ConsensusError::EmptyEnsemble)
        ));
    }
}
