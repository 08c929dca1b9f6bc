//! Per-draw clustering of the posterior coefficient surfaces.
//!
//! For every retained MCMC draw, the S x P coefficient matrix is handed to
//! a clustering oracle that picks a model order by an information criterion
//! and returns per-unit labels. The oracle is a contract: the built-in
//! diagonal Gaussian mixture satisfies it, and any external fitter
//! (including a Dirichlet-process mixture) can replace it.
//!
//! The ensemble builder fans the per-draw calls out on the rayon pool.
//! Draws are independent, seeds are derived from the run seed plus the draw
//! index, and results are written back to the slot matching their source
//! draw — never in completion order. A draw whose fit fails after the
//! configured retries is dropped and recorded, not replaced by a default
//! partition.

use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Odd constant mixed into the per-draw seed on each retry, so retries are
/// deterministic but decorrelated from the first attempt.
const RETRY_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

/// A clustering oracle could not converge on one draw. Recoverable at the
/// ensemble level: the draw is dropped and recorded.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitFailure {
    #[error("input coefficient matrix contains non-finite values")]
    NonFiniteInput,

    #[error("mixture with {k} components collapsed (empty or near-singular component)")]
    Collapsed { k: usize },

    #[error("no candidate order in 1..={max_components} produced a finite fit")]
    NoViableOrder { max_components: usize },
}

#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Coefficient tensor holds no draws.")]
    EmptyTensor,

    #[error(
        "Only {kept} of {total} draws produced a partition; below the minimum success \
         fraction {min_fraction}."
    )]
    TooFewPartitions {
        kept: usize,
        total: usize,
        min_fraction: f64,
    },

    #[error("Clustering oracle violated its contract: {0}")]
    ContractViolation(String),

    #[error("Ensemble construction was cancelled.")]
    Cancelled,
}

/// Model-order selection criterion applied over the candidate range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionCriterion {
    Bic,
    Aic,
}

/// One oracle result: a chosen component count and a label per unit.
/// Labels are positive integers; they are symbols, not ordinals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleFit {
    pub n_components: usize,
    pub labels: Vec<usize>,
}

/// Clustering-oracle contract. Implementations must be deterministic given
/// the seed and input, return exactly one positive label per row, use at
/// most `max_components` distinct labels, and signal degenerate fits as a
/// `FitFailure` instead of fabricating a partition.
pub trait ClusteringOracle {
    fn fit(&self, data: ArrayView2<'_, f64>, seed: u64) -> Result<OracleFit, FitFailure>;

    /// Upper bound of the model-order search range.
    fn max_components(&self) -> usize;
}

fn default_max_components() -> usize {
    10
}

fn default_em_max_iter() -> usize {
    200
}

fn default_em_tol() -> f64 {
    1e-6
}

fn default_restarts() -> usize {
    3
}

fn default_criterion() -> SelectionCriterion {
    SelectionCriterion::Bic
}

/// Built-in oracle: diagonal-covariance Gaussian mixture fit by EM with
/// k-means++ initialization, model order chosen by BIC (or AIC) over
/// `1..=max_components`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussianMixtureOracle {
    #[serde(default = "default_max_components")]
    pub max_components: usize,
    #[serde(default = "default_criterion")]
    pub criterion: SelectionCriterion,
    #[serde(default = "default_em_max_iter")]
    pub em_max_iter: usize,
    #[serde(default = "default_em_tol")]
    pub em_tol: f64,
    /// EM restarts per candidate order; the best log-likelihood wins.
    #[serde(default = "default_restarts")]
    pub restarts: usize,
}

impl Default for GaussianMixtureOracle {
    fn default() -> Self {
        Self {
            max_components: default_max_components(),
            criterion: default_criterion(),
            em_max_iter: default_em_max_iter(),
            em_tol: default_em_tol(),
            restarts: default_restarts(),
        }
    }
}

impl ClusteringOracle for GaussianMixtureOracle {
    fn fit(&self, data: ArrayView2<'_, f64>, seed: u64) -> Result<OracleFit, FitFailure> {
        if data.iter().any(|v| !v.is_finite()) {
            return Err(FitFailure::NonFiniteInput);
        }
        let s = data.nrows();
        let p = data.ncols();
        if s == 0 || p == 0 {
            return Err(FitFailure::NonFiniteInput);
        }

        // Variance floor scaled to the data so a tight regime cannot drive
        // a component covariance to exact singularity.
        let var_floor = variance_floor(&data);

        let k_max = self.max_components.min(s).max(1);
        let mut best: Option<(f64, OracleFit)> = None;
        let mut last_collapse: Option<FitFailure> = None;

        for k in 1..=k_max {
            let mut best_ll: Option<(f64, Vec<usize>)> = None;
            for restart in 0..self.restarts.max(1) {
                let rng_seed = seed
                    .wrapping_add((k as u64) << 32)
                    .wrapping_add(restart as u64);
                match self.run_em(&data, k, var_floor, rng_seed) {
                    Ok((ll, labels)) => {
                        if best_ll.as_ref().is_none_or(|(b, _)| ll > *b) {
                            best_ll = Some((ll, labels));
                        }
                    }
                    Err(f) => last_collapse = Some(f),
                }
            }
            let Some((ll, labels)) = best_ll else {
                continue;
            };
            let n_params = (k - 1) + 2 * k * p;
            let score = match self.criterion {
                SelectionCriterion::Bic => -2.0 * ll + n_params as f64 * (s as f64).ln(),
                SelectionCriterion::Aic => -2.0 * ll + 2.0 * n_params as f64,
            };
            if !score.is_finite() {
                continue;
            }
            if best.as_ref().is_none_or(|(b, _)| score < *b) {
                best = Some((
                    score,
                    OracleFit {
                        n_components: k,
                        labels,
                    },
                ));
            }
        }

        match best {
            Some((_, fit)) => Ok(fit),
            None => Err(last_collapse.unwrap_or(FitFailure::NoViableOrder {
                max_components: k_max,
            })),
        }
    }

    fn max_components(&self) -> usize {
        self.max_components
    }
}

impl GaussianMixtureOracle {
    /// One EM run for a fixed component count. Returns the final
    /// log-likelihood and the argmax-responsibility labels (1-based).
    fn run_em(
        &self,
        data: &ArrayView2<'_, f64>,
        k: usize,
        var_floor: f64,
        seed: u64,
    ) -> Result<(f64, Vec<usize>), FitFailure> {
        let s = data.nrows();
        let p = data.ncols();
        let mut rng = StdRng::seed_from_u64(seed);

        let mut means = kmeanspp_init(data, k, &mut rng);
        let mut vars = Array2::<f64>::from_elem((k, p), initial_variance(data, var_floor));
        let mut weights = vec![1.0 / k as f64; k];
        let mut resp = Array2::<f64>::zeros((s, k));
        let mut prev_ll = f64::NEG_INFINITY;
        let mut ll = f64::NEG_INFINITY;

        for _ in 0..self.em_max_iter.max(1) {
            // E-step in log space with a log-sum-exp per row.
            ll = 0.0;
            for r in 0..s {
                let mut log_p = vec![0.0f64; k];
                for c in 0..k {
                    let mut lp = weights[c].max(1e-300).ln();
                    for j in 0..p {
                        let v = vars[[c, j]];
                        let d = data[[r, j]] - means[[c, j]];
                        lp += -0.5 * (LN_2PI + v.ln()) - 0.5 * d * d / v;
                    }
                    log_p[c] = lp;
                }
                let m = log_p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                if !m.is_finite() {
                    return Err(FitFailure::Collapsed { k });
                }
                let denom: f64 = log_p.iter().map(|lp| (lp - m).exp()).sum();
                ll += m + denom.ln();
                for c in 0..k {
                    resp[[r, c]] = (log_p[c] - m).exp() / denom;
                }
            }
            if !ll.is_finite() {
                return Err(FitFailure::Collapsed { k });
            }

            // M-step.
            for c in 0..k {
                let nk: f64 = (0..s).map(|r| resp[[r, c]]).sum();
                if nk < 1e-8 {
                    return Err(FitFailure::Collapsed { k });
                }
                weights[c] = nk / s as f64;
                for j in 0..p {
                    let mu = (0..s).map(|r| resp[[r, c]] * data[[r, j]]).sum::<f64>() / nk;
                    means[[c, j]] = mu;
                    let var = (0..s)
                        .map(|r| {
                            let d = data[[r, j]] - mu;
                            resp[[r, c]] * d * d
                        })
                        .sum::<f64>()
                        / nk;
                    vars[[c, j]] = var.max(var_floor);
                }
            }

            if (ll - prev_ll).abs() < self.em_tol * (1.0 + ll.abs()) {
                break;
            }
            prev_ll = ll;
        }

        let labels = (0..s)
            .map(|r| {
                let mut best_c = 0;
                for c in 1..k {
                    if resp[[r, c]] > resp[[r, best_c]] {
                        best_c = c;
                    }
                }
                best_c + 1
            })
            .collect();
        Ok((ll, labels))
    }
}

fn variance_floor(data: &ArrayView2<'_, f64>) -> f64 {
    let s = data.nrows() as f64;
    let p = data.ncols();
    let mut total_var = 0.0;
    for j in 0..p {
        let col = data.column(j);
        let mean = col.sum() / s;
        total_var += col.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / s;
    }
    (1e-6 * total_var / p as f64).max(1e-10)
}

fn initial_variance(data: &ArrayView2<'_, f64>, var_floor: f64) -> f64 {
    let s = data.nrows() as f64;
    let p = data.ncols();
    let mut total = 0.0;
    for j in 0..p {
        let col = data.column(j);
        let mean = col.sum() / s;
        total += col.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / s;
    }
    (total / p as f64).max(var_floor)
}

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

/// k-means++ seeding: each new center is drawn with probability
/// proportional to squared distance from the nearest existing center.
fn kmeanspp_init<R: Rng + ?Sized>(
    data: &ArrayView2<'_, f64>,
    k: usize,
    rng: &mut R,
) -> Array2<f64> {
    let s = data.nrows();
    let p = data.ncols();
    let mut centers = Array2::<f64>::zeros((k, p));
    let first = rng.random_range(0..s);
    centers.row_mut(0).assign(&data.row(first));
    let mut d2 = vec![f64::INFINITY; s];
    for c in 1..k {
        for (r, slot) in d2.iter_mut().enumerate() {
            let dist = squared_distance(data.row(r), centers.row(c - 1));
            *slot = slot.min(dist);
        }
        let total: f64 = d2.iter().sum();
        let chosen = if total > 0.0 {
            let mut u = rng.random::<f64>() * total;
            let mut idx = s - 1;
            for (r, &w) in d2.iter().enumerate() {
                if u <= w {
                    idx = r;
                    break;
                }
                u -= w;
            }
            idx
        } else {
            // All points coincide with an existing center.
            rng.random_range(0..s)
        };
        centers.row_mut(c).assign(&data.row(chosen));
    }
    centers
}

fn default_max_retries() -> usize {
    2
}

fn default_min_success_fraction() -> f64 {
    0.5
}

/// Configuration of the per-draw ensemble construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    /// Run seed; draw `d` uses `run_seed + d`, perturbed on retries.
    #[serde(default)]
    pub run_seed: u64,
    /// Perturbed-seed retries per draw before the draw is dropped.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Minimum fraction of draws that must yield a partition for the
    /// ensemble to be usable downstream.
    #[serde(default = "default_min_success_fraction")]
    pub min_success_fraction: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            run_seed: 0,
            max_retries: default_max_retries(),
            min_success_fraction: default_min_success_fraction(),
        }
    }
}

/// A draw lost to a clustering failure, kept for the final report.
#[derive(Debug, Clone)]
pub struct DroppedDraw {
    pub draw: usize,
    pub failure: FitFailure,
}

/// Retained per-draw partitions, in source-draw order, plus the loss record.
#[derive(Debug, Clone)]
pub struct PartitionEnsemble {
    /// M x S label matrix, one retained partition per row.
    pub labels: Array2<usize>,
    /// Source draw index of each retained row.
    pub draw_indices: Vec<usize>,
    pub dropped: Vec<DroppedDraw>,
    pub total_draws: usize,
}

impl PartitionEnsemble {
    pub fn n_partitions(&self) -> usize {
        self.labels.nrows()
    }

    pub fn n_units(&self) -> usize {
        self.labels.ncols()
    }

    pub fn drop_count(&self) -> usize {
        self.dropped.len()
    }

    /// User-visible loss summary: how many draws were dropped, and why.
    pub fn drop_report(&self) -> String {
        if self.dropped.is_empty() {
            return format!("all {} draws clustered", self.total_draws);
        }
        let mut reasons: Vec<String> = Vec::new();
        for d in &self.dropped {
            reasons.push(format!("draw {}: {}", d.draw, d.failure));
        }
        format!(
            "{} of {} draws dropped ({})",
            self.drop_count(),
            self.total_draws,
            reasons.join("; ")
        )
    }
}

/// Cluster every retained draw of the coefficient tensor, in parallel.
///
/// Each worker sees only its own read-only draw slice and its own derived
/// seed, so the result is reproducible regardless of scheduling. Failed
/// draws are retried with perturbed seeds, then dropped and recorded.
pub fn build_partition_ensemble<O: ClusteringOracle + Sync>(
    coefficients: &Array3<f64>,
    oracle: &O,
    cfg: &EnsembleConfig,
    cancel: &AtomicBool,
) -> Result<PartitionEnsemble, OracleError> {
    let total_draws = coefficients.shape()[0];
    let n_units = coefficients.shape()[1];
    if total_draws == 0 {
        return Err(OracleError::EmptyTensor);
    }

    let outcomes: Vec<(usize, Result<OracleFit, FitFailure>)> = (0..total_draws)
        .into_par_iter()
        .map(|draw| {
            if cancel.load(Ordering::Relaxed) {
                return Err(OracleError::Cancelled);
            }
            let data = coefficients.slice(s![draw, .., ..]);
            let base_seed = cfg.run_seed.wrapping_add(draw as u64);
            let mut outcome = oracle.fit(data, base_seed);
            let mut attempt = 0usize;
            while outcome.is_err() && attempt < cfg.max_retries {
                attempt += 1;
                let seed = base_seed.wrapping_add(RETRY_SEED_STRIDE.wrapping_mul(attempt as u64));
                outcome = oracle.fit(data, seed);
            }
            Ok((draw, outcome))
        })
        .collect::<Result<_, _>>()?;

    let mut kept_rows: Vec<(usize, Vec<usize>)> = Vec::with_capacity(total_draws);
    let mut dropped: Vec<DroppedDraw> = Vec::new();
    for (draw, outcome) in outcomes {
        match outcome {
            Ok(fit) => {
                validate_contract(&fit, n_units, oracle.max_components(), draw)?;
                kept_rows.push((draw, fit.labels));
            }
            Err(failure) => {
                log::warn!("draw {draw} dropped from ensemble: {failure}");
                dropped.push(DroppedDraw { draw, failure });
            }
        }
    }

    let kept = kept_rows.len();
    if (kept as f64) < cfg.min_success_fraction * total_draws as f64 {
        return Err(OracleError::TooFewPartitions {
            kept,
            total: total_draws,
            min_fraction: cfg.min_success_fraction,
        });
    }

    let mut labels = Array2::<usize>::zeros((kept, n_units));
    let mut draw_indices = Vec::with_capacity(kept);
    for (row, (draw, partition)) in kept_rows.into_iter().enumerate() {
        for (col, label) in partition.into_iter().enumerate() {
            labels[[row, col]] = label;
        }
        draw_indices.push(draw);
    }

    let ensemble = PartitionEnsemble {
        labels,
        draw_indices,
        dropped,
        total_draws,
    };
    if ensemble.drop_count() > 0 {
        log::warn!("{}", ensemble.drop_report());
    }
    Ok(ensemble)
}

fn validate_contract(
    fit: &OracleFit,
    n_units: usize,
    max_components: usize,
    draw: usize,
) -> Result<(), OracleError> {
    if fit.labels.len() != n_units {
        return Err(OracleError::ContractViolation(format!(
            "draw {draw}: oracle returned {} labels for {n_units} units",
            fit.labels.len()
        )));
    }
    if fit.labels.iter().any(|&l| l == 0) {
        return Err(OracleError::ContractViolation(format!(
            "draw {draw}: labels must be positive integers"
        )));
    }
    let mut distinct: Vec<usize> = fit.labels.clone();
    distinct.sort_unstable();
    distinct.dedup();
    if distinct.len() > max_components {
        return Err(OracleError::ContractViolation(format!(
            "draw {draw}: {} distinct labels exceed the {max_components}-component bound",
            distinct.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_distr::{Distribution, Normal};

    fn two_blob_matrix(per_blob: usize, separation: f64, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, 0.3).expect("valid params");
        let mut data = Array2::<f64>::zeros((2 * per_blob, 2));
        for r in 0..(2 * per_blob) {
            let center = if r < per_blob { 0.0 } else { separation };
            data[[r, 0]] = center + noise.sample(&mut rng);
            data[[r, 1]] = -center + noise.sample(&mut rng);
        }
        data
    }

    #[test]
    fn gmm_recovers_two_separated_blobs() {
        let data = two_blob_matrix(20, 8.0, 5);
        let oracle = GaussianMixtureOracle::default();
        let fit = oracle.fit(data.view(), 99).expect("fit succeeds");
        assert_eq!(fit.n_components, 2);
        assert_eq!(fit.labels.len(), 40);
        // All of blob A shares one label, all of blob B the other.
        let first = fit.labels[0];
        assert!(fit.labels[..20].iter().all(|&l| l == first));
        let second = fit.labels[20];
        assert_ne!(first, second);
        assert!(fit.labels[20..].iter().all(|&l| l == second));
    }

    #[test]
    fn gmm_prefers_one_component_for_a_single_blob() {
        let data = two_blob_matrix(20, 0.0, 11);
        let oracle = GaussianMixtureOracle::default();
        let fit = oracle.fit(data.view(), 3).expect("fit succeeds");
        assert_eq!(fit.n_components, 1);
        assert!(fit.labels.iter().all(|&l| l == 1));
    }

    #[test]
    fn gmm_is_deterministic_given_seed() {
        let data = two_blob_matrix(15, 6.0, 21);
        let oracle = GaussianMixtureOracle::default();
        let a = oracle.fit(data.view(), 7).expect("fit a");
        let b = oracle.fit(data.view(), 7).expect("fit b");
        assert_eq!(a, b);
    }

    #[test]
    fn gmm_rejects_non_finite_input() {
        let mut data = two_blob_matrix(5, 4.0, 31);
        data[[0, 0]] = f64::NAN;
        let oracle = GaussianMixtureOracle::default();
        assert_eq!(
            oracle.fit(data.view(), 1),
            Err(FitFailure::NonFiniteInput)
        );
    }

    /// Oracle that fails whenever the draw's marker value (stored at
    /// [0,0]) hits a multiple of ten. Mirrors injected per-draw failures.
    struct MarkerFailingOracle;

    impl ClusteringOracle for MarkerFailingOracle {
        fn fit(&self, data: ArrayView2<'_, f64>, _seed: u64) -> Result<OracleFit, FitFailure> {
            let marker = data[[0, 0]] as usize;
            if marker % 10 == 0 {
                return Err(FitFailure::Collapsed { k: 2 });
            }
            Ok(OracleFit {
                n_components: 1,
                labels: vec![1; data.nrows()],
            })
        }

        fn max_components(&self) -> usize {
            10
        }
    }

    fn marker_tensor(draws: usize, n_units: usize) -> Array3<f64> {
        let mut t = Array3::<f64>::zeros((draws, n_units, 1));
        for d in 0..draws {
            t[[d, 0, 0]] = d as f64;
        }
        t
    }

    #[test]
    fn ten_percent_failures_drop_fifty_of_five_hundred() {
        let tensor = marker_tensor(500, 3);
        let cfg = EnsembleConfig {
            run_seed: 1,
            max_retries: 0,
            min_success_fraction: 0.5,
        };
        let cancel = AtomicBool::new(false);
        let ensemble = build_partition_ensemble(&tensor, &MarkerFailingOracle, &cfg, &cancel)
            .expect("enough draws survive");
        assert_eq!(ensemble.total_draws, 500);
        assert_eq!(ensemble.n_partitions(), 450);
        assert_eq!(ensemble.drop_count(), 50);
        assert!(ensemble.drop_report().starts_with("50 of 500 draws dropped"));
        // Retained rows stay in source-draw order with correct indices.
        assert_eq!(ensemble.draw_indices[0], 1);
        assert!(ensemble.draw_indices.windows(2).all(|w| w[0] < w[1]));
    }

    /// Succeeds only on odd seeds, so the base attempt fails for even
    /// seeds and the perturbed retry (odd stride) recovers the draw.
    struct OddSeedOracle;

    impl ClusteringOracle for OddSeedOracle {
        fn fit(&self, data: ArrayView2<'_, f64>, seed: u64) -> Result<OracleFit, FitFailure> {
            if seed % 2 == 0 {
                return Err(FitFailure::Collapsed { k: 3 });
            }
            Ok(OracleFit {
                n_components: 1,
                labels: vec![1; data.nrows()],
            })
        }

        fn max_components(&self) -> usize {
            10
        }
    }

    #[test]
    fn retries_with_perturbed_seed_recover_every_draw() {
        let tensor = marker_tensor(20, 2);
        let cfg = EnsembleConfig {
            run_seed: 0,
            max_retries: 1,
            min_success_fraction: 1.0,
        };
        let cancel = AtomicBool::new(false);
        let ensemble = build_partition_ensemble(&tensor, &OddSeedOracle, &cfg, &cancel)
            .expect("retries recover all draws");
        assert_eq!(ensemble.n_partitions(), 20);
        assert_eq!(ensemble.drop_count(), 0);
    }

    struct AlwaysFailingOracle;

    impl ClusteringOracle for AlwaysFailingOracle {
        fn fit(&self, _data: ArrayView2<'_, f64>, _seed: u64) -> Result<OracleFit, FitFailure> {
            Err(FitFailure::NoViableOrder { max_components: 10 })
        }

        fn max_components(&self) -> usize {
            10
        }
    }

    #[test]
    fn too_many_failures_abort_the_ensemble() {
        let tensor = marker_tensor(10, 2);
        let cfg = EnsembleConfig::default();
        let cancel = AtomicBool::new(false);
        let err = build_partition_ensemble(&tensor, &AlwaysFailingOracle, &cfg, &cancel);
        assert!(matches!(
            err,
            Err(OracleError::TooFewPartitions {
                kept: 0,
                total: 10,
                ..
            })
        ));
    }

    #[test]
    fn cancellation_aborts_the_batch() {
        let tensor = marker_tensor(10, 2);
        let cfg = EnsembleConfig::default();
        let cancel = AtomicBool::new(true);
        let err = build_partition_ensemble(&tensor, &MarkerFailingOracle, &cfg, &cancel);
        assert!(matches!(err, Err(OracleError::Cancelled)));
    }
}
