//! Spatial kernel builder.
//!
//! Turns the normalized distance matrix and a bandwidth into the weight
//! matrix `W(lambda)[i,j] = exp(-d_ij / lambda)`. The bandwidth is itself
//! sampled, so this is a pure function that the sampler recomputes freely;
//! the weights are never stored detached from the bandwidth that produced
//! them.

use crate::types::DistanceMatrix;
use ndarray::Array2;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Kernel bandwidth must be positive and finite, got {0}.")]
    InvalidBandwidth(f64),
}

/// Exponential distance-decay weights for bandwidth `lambda`.
///
/// Symmetry is inherited from the distance matrix and the diagonal is
/// exactly `exp(0) = 1`.
pub fn kernel_weights(dist: &DistanceMatrix, lambda: f64) -> Result<Array2<f64>, KernelError> {
    if !(lambda.is_finite() && lambda > 0.0) {
        return Err(KernelError::InvalidBandwidth(lambda));
    }
    Ok(dist.view().mapv(|d| (-d / lambda).exp()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy_distances() -> DistanceMatrix {
        let raw = array![[0.0, 3.0, 7.0], [3.0, 0.0, 5.0], [7.0, 5.0, 0.0]];
        DistanceMatrix::from_matrix(raw, 10.0).expect("valid matrix")
    }

    #[test]
    fn weights_have_unit_diagonal() {
        let w = kernel_weights(&toy_distances(), 2.5).expect("valid bandwidth");
        for i in 0..3 {
            assert_eq!(w[[i, i]], 1.0);
        }
    }

    #[test]
    fn weights_are_symmetric_for_symmetric_distances() {
        let w = kernel_weights(&toy_distances(), 0.7).expect("valid bandwidth");
        for i in 0..3 {
            for j in 0..3 {
                assert!((w[[i, j]] - w[[j, i]]).abs() < 1e-15);
            }
        }
    }

    #[test]
    fn weights_decay_with_distance() {
        let w = kernel_weights(&toy_distances(), 4.0).expect("valid bandwidth");
        // d(0,1) < d(0,2) after rescaling, so the nearer pair gets more weight.
        assert!(w[[0, 1]] > w[[0, 2]]);
        assert!(w[[0, 2]] > 0.0);
    }

    #[test]
    fn rejects_nonpositive_bandwidth() {
        assert!(matches!(
            kernel_weights(&toy_distances(), 0.0),
            Err(KernelError::InvalidBandwidth(_))
        ));
        assert!(matches!(
            kernel_weights(&toy_distances(), -1.0),
            Err(KernelError::InvalidBandwidth(_))
        ));
    }
}
