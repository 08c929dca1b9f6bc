use ndarray::{Array1, Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in kilometres, used for great-circle distances.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Default maximum the distance matrix is rescaled to. The bandwidth prior
/// is Uniform(0, max), so this fixes the scale of the bandwidth chain.
pub fn default_distance_max() -> f64 {
    10.0
}

/// One spatial unit: identifier, centroid, covariate row, scalar response.
/// Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialUnit {
    pub id: String,
    /// Centroid longitude in degrees.
    pub lon: f64,
    /// Centroid latitude in degrees.
    pub lat: f64,
    /// Covariate row of fixed dimension P.
    pub covariates: Array1<f64>,
    pub response: f64,
}

#[derive(Error, Debug)]
pub enum DistanceMatrixError {
    #[error("Distance matrix must be square, but has shape {rows}x{cols}.")]
    NotSquare { rows: usize, cols: usize },

    #[error("Distance matrix entry [{i},{j}] = {value} is negative or non-finite.")]
    InvalidEntry { i: usize, j: usize, value: f64 },

    #[error("Distance matrix diagonal entry [{i},{i}] = {value} must be zero.")]
    NonZeroDiagonal { i: usize, value: f64 },

    #[error("Distance matrix is asymmetric at [{i},{j}]: {a} vs {b}.")]
    Asymmetric { i: usize, j: usize, a: f64, b: f64 },

    #[error("All pairwise distances are zero; cannot rescale to a positive maximum.")]
    Degenerate,

    #[error("Normalization target must be positive, got {0}.")]
    InvalidTarget(f64),

    #[error("Need at least 2 spatial units to build a distance matrix, got {0}.")]
    TooFewUnits(usize),
}

/// Validated symmetric matrix of inter-unit distances with zero diagonal,
/// rescaled to a fixed maximum so the bandwidth prior has a known support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistanceMatrix {
    values: Array2<f64>,
    max: f64,
}

impl DistanceMatrix {
    /// Validate and wrap a raw distance matrix, rescaling entries so the
    /// largest equals `target_max`.
    pub fn from_matrix(raw: Array2<f64>, target_max: f64) -> Result<Self, DistanceMatrixError> {
        if target_max <= 0.0 || !target_max.is_finite() {
            return Err(DistanceMatrixError::InvalidTarget(target_max));
        }
        let (rows, cols) = raw.dim();
        if rows != cols {
            return Err(DistanceMatrixError::NotSquare { rows, cols });
        }
        if rows < 2 {
            return Err(DistanceMatrixError::TooFewUnits(rows));
        }
        let mut observed_max = 0.0f64;
        for i in 0..rows {
            let d_ii = raw[[i, i]];
            if d_ii != 0.0 {
                return Err(DistanceMatrixError::NonZeroDiagonal { i, value: d_ii });
            }
            for j in 0..cols {
                let d = raw[[i, j]];
                if !(d.is_finite() && d >= 0.0) {
                    return Err(DistanceMatrixError::InvalidEntry { i, j, value: d });
                }
                let d_t = raw[[j, i]];
                // Practical distances: symmetry up to floating-point roundoff.
                if (d - d_t).abs() > 1e-9 * (1.0 + d.abs()) {
                    return Err(DistanceMatrixError::Asymmetric { i, j, a: d, b: d_t });
                }
                observed_max = observed_max.max(d);
            }
        }
        if observed_max == 0.0 {
            return Err(DistanceMatrixError::Degenerate);
        }
        let scale = target_max / observed_max;
        Ok(Self {
            values: raw.mapv(|d| d * scale),
            max: target_max,
        })
    }

    /// Great-circle (haversine) distances between unit centroids, rescaled
    /// to `target_max`.
    pub fn from_units(units: &[SpatialUnit], target_max: f64) -> Result<Self, DistanceMatrixError> {
        let s = units.len();
        if s < 2 {
            return Err(DistanceMatrixError::TooFewUnits(s));
        }
        let mut raw = Array2::<f64>::zeros((s, s));
        for i in 0..s {
            for j in (i + 1)..s {
                let d = haversine_km(units[i].lon, units[i].lat, units[j].lon, units[j].lat);
                raw[[i, j]] = d;
                raw[[j, i]] = d;
            }
        }
        Self::from_matrix(raw, target_max)
    }

    /// `from_units` with the canonical rescale target.
    pub fn from_units_default(units: &[SpatialUnit]) -> Result<Self, DistanceMatrixError> {
        Self::from_units(units, default_distance_max())
    }

    /// Number of spatial units S.
    pub fn n_units(&self) -> usize {
        self.values.nrows()
    }

    /// The fixed maximum the matrix was rescaled to (the bandwidth prior's
    /// upper bound).
    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}

fn haversine_km(lon_a: f64, lat_a: f64, lon_b: f64, lat_b: f64) -> f64 {
    let phi_a = lat_a.to_radians();
    let phi_b = lat_b.to_radians();
    let d_phi = (lat_b - lat_a).to_radians();
    let d_lambda = (lon_b - lon_a).to_radians();
    let h = (d_phi / 2.0).sin().powi(2)
        + phi_a.cos() * phi_b.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

fn default_gamma_one() -> f64 {
    1.0
}

/// Hyperparameters for the hierarchical priors.
///
/// The observation-scale prior is deliberately configurable: published
/// analyses alternate between Gamma(1,1) and Gamma(100,100) for psi with no
/// stated rationale, so neither value is hard-coded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorConfig {
    /// Shape of the Gamma prior on the shared coefficient precision tau.
    #[serde(default = "default_gamma_one")]
    pub tau_shape: f64,
    /// Rate of the Gamma prior on tau.
    #[serde(default = "default_gamma_one")]
    pub tau_rate: f64,
    /// Shape of the Gamma prior on each observation-level precision psi_i.
    #[serde(default = "default_gamma_one")]
    pub psi_shape: f64,
    /// Rate of the Gamma prior on psi_i.
    #[serde(default = "default_gamma_one")]
    pub psi_rate: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            tau_shape: 1.0,
            tau_rate: 1.0,
            psi_shape: 1.0,
            psi_rate: 1.0,
        }
    }
}
