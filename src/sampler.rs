//! MCMC driver: the sampler contract plus a built-in
//! Metropolis-within-Gibbs implementation.
//!
//! The contract is deliberately small — any engine that can turn the model,
//! a configuration and a seed into ordered draw tensors can stand in for
//! the built-in sampler. The built-in one updates, per iteration:
//!
//! 1. included coefficients `b_ij` by their conjugate univariate normal
//!    full conditionals (excluded coefficients stay frozen);
//! 2. the reversible-jump birth/death pass over inclusion indicators,
//!    then the conjugate Beta update for each `pi_j` (RJ mode only);
//! 3. each observation-level precision `psi_i` (conjugate Gamma);
//! 4. the shared coefficient precision `tau` (conjugate Gamma over the
//!    included coefficients only);
//! 5. the bandwidth `lambda` by reflected random-walk Metropolis on
//!    `(0, d_max)`, recomputing the kernel weights on acceptance.
//!
//! A single chain is inherently sequential; chains are independent and run
//! on the rayon pool. Cancellation is cooperative and only honored between
//! iterations, so no retained draw row is ever half-written.

use crate::kernel::{kernel_weights, KernelError};
use crate::model::{GwrModel, ModelSpecError};
use crate::rj::{self, RjConfig};
use ndarray::{s, Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution, Gamma, StandardNormal};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

fn default_iterations() -> usize {
    2000
}

fn default_burn_in() -> usize {
    1000
}

fn default_thinning() -> usize {
    1
}

fn default_chains() -> usize {
    2
}

fn default_lambda_step() -> f64 {
    0.5
}

/// Run-level MCMC configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McmcConfig {
    /// Total iterations per chain, burn-in included.
    #[serde(default = "default_iterations")]
    pub iterations: usize,
    /// Iterations discarded from the front of each chain.
    #[serde(default = "default_burn_in")]
    pub burn_in: usize,
    /// Keep every `thinning`-th post-burn-in iteration.
    #[serde(default = "default_thinning")]
    pub thinning: usize,
    /// Number of independent chains.
    #[serde(default = "default_chains")]
    pub chains: usize,
    /// Run seed; chain `c` uses `seed + c`.
    #[serde(default)]
    pub seed: u64,
    /// Standard deviation of the bandwidth random-walk proposal.
    #[serde(default = "default_lambda_step")]
    pub lambda_step: f64,
    /// Enables the reversible-jump variable-selection layer.
    #[serde(default)]
    pub rj: Option<RjConfig>,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            iterations: default_iterations(),
            burn_in: default_burn_in(),
            thinning: default_thinning(),
            chains: default_chains(),
            seed: 0,
            lambda_step: default_lambda_step(),
            rj: None,
        }
    }
}

impl McmcConfig {
    /// Retained draws per chain after burn-in and thinning.
    pub fn retained_per_chain(&self) -> usize {
        if self.iterations <= self.burn_in {
            return 0;
        }
        let kept = self.iterations - self.burn_in;
        kept.div_ceil(self.thinning.max(1))
    }
}

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error(transparent)]
    ModelSpec(#[from] ModelSpecError),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error("Invalid MCMC configuration: {0}")]
    InvalidConfig(String),

    #[error("Non-finite posterior density in chain {chain} at iteration {iteration}.")]
    NumericalInstability { chain: usize, iteration: usize },

    #[error("Sampling was cancelled.")]
    Cancelled,
}

/// Posterior draws handed downstream read-only. Draw order is chain-major
/// and preserves within-chain iteration order end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PosteriorDraws {
    /// Coefficient tensor, `(retained_draws, S, P)`.
    pub coefficients: Array3<f64>,
    /// Inclusion indicators, `(retained_draws, S, P)`; present iff the
    /// reversible-jump layer was active. A zero entry means the matching
    /// coefficient value was frozen out of the linear predictor for that
    /// draw.
    pub inclusion: Option<Array3<u8>>,
    /// Bandwidth chain, one value per retained draw.
    pub lambda: Array1<f64>,
    /// Shared coefficient-precision chain.
    pub tau: Array1<f64>,
    /// Observation-level precision chains, `(retained_draws, S)`.
    pub psi: Array2<f64>,
    pub n_chains: usize,
    pub draws_per_chain: usize,
}

impl PosteriorDraws {
    pub fn n_draws(&self) -> usize {
        self.coefficients.shape()[0]
    }

    pub fn n_units(&self) -> usize {
        self.coefficients.shape()[1]
    }

    pub fn n_predictors(&self) -> usize {
        self.coefficients.shape()[2]
    }
}

/// Contract consumed by the clustering stage: any conforming engine can be
/// substituted for the built-in sampler without touching downstream code.
pub trait Sampler {
    fn run(
        &self,
        model: &GwrModel,
        cfg: &McmcConfig,
        cancel: &AtomicBool,
    ) -> Result<PosteriorDraws, SamplerError>;
}

/// Built-in Metropolis-within-Gibbs sampler.
#[derive(Debug, Clone, Copy, Default)]
pub struct GibbsMetropolisSampler;

impl Sampler for GibbsMetropolisSampler {
    fn run(
        &self,
        model: &GwrModel,
        cfg: &McmcConfig,
        cancel: &AtomicBool,
    ) -> Result<PosteriorDraws, SamplerError> {
        validate_config(model, cfg)?;
        let retained = cfg.retained_per_chain();

        let chain_draws: Vec<ChainDraws> = (0..cfg.chains)
            .into_par_iter()
            .map(|chain| run_chain(model, cfg, chain, cancel))
            .collect::<Result<_, _>>()?;

        let s = model.n_units();
        let p = model.n_predictors();
        let total = retained * cfg.chains;
        let mut coefficients = Array3::<f64>::zeros((total, s, p));
        let mut inclusion = cfg
            .rj
            .as_ref()
            .map(|_| Array3::<u8>::zeros((total, s, p)));
        let mut lambda = Array1::<f64>::zeros(total);
        let mut tau = Array1::<f64>::zeros(total);
        let mut psi = Array2::<f64>::zeros((total, s));

        for (chain, draws) in chain_draws.iter().enumerate() {
            let lo = chain * retained;
            let hi = lo + retained;
            coefficients
                .slice_mut(s![lo..hi, .., ..])
                .assign(&draws.coefficients);
            if let (Some(all), Some(per_chain)) = (inclusion.as_mut(), draws.inclusion.as_ref()) {
                all.slice_mut(s![lo..hi, .., ..]).assign(per_chain);
            }
            lambda.slice_mut(s![lo..hi]).assign(&draws.lambda);
            tau.slice_mut(s![lo..hi]).assign(&draws.tau);
            psi.slice_mut(s![lo..hi, ..]).assign(&draws.psi);
            log::debug!(
                "chain {chain}: lambda acceptance {:.3}, rj acceptance {:.3}",
                draws.lambda_acceptance,
                draws.rj_acceptance
            );
        }
        log::info!(
            "MCMC finished: {} chains x {} retained draws ({} units, {} predictors)",
            cfg.chains,
            retained,
            s,
            p
        );

        Ok(PosteriorDraws {
            coefficients,
            inclusion,
            lambda,
            tau,
            psi,
            n_chains: cfg.chains,
            draws_per_chain: retained,
        })
    }
}

fn validate_config(model: &GwrModel, cfg: &McmcConfig) -> Result<(), SamplerError> {
    if cfg.chains == 0 {
        return Err(SamplerError::InvalidConfig(
            "chain count must be at least 1".to_string(),
        ));
    }
    if cfg.thinning == 0 {
        return Err(SamplerError::InvalidConfig(
            "thinning must be at least 1".to_string(),
        ));
    }
    if cfg.iterations <= cfg.burn_in {
        return Err(SamplerError::InvalidConfig(format!(
            "iterations ({}) must exceed burn-in ({})",
            cfg.iterations, cfg.burn_in
        )));
    }
    if !(cfg.lambda_step.is_finite() && cfg.lambda_step > 0.0) {
        return Err(SamplerError::InvalidConfig(format!(
            "lambda_step must be positive, got {}",
            cfg.lambda_step
        )));
    }
    if let Some(rj_cfg) = &cfg.rj {
        if !(rj_cfg.proposal_sd.is_finite() && rj_cfg.proposal_sd > 0.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "RJ proposal_sd must be positive, got {}",
                rj_cfg.proposal_sd
            )));
        }
        for &(i, j) in &rj_cfg.forced_exclusions {
            if i >= model.n_units() || j >= model.n_predictors() {
                return Err(SamplerError::InvalidConfig(format!(
                    "forced exclusion ({i},{j}) is out of range for {} units x {} predictors",
                    model.n_units(),
                    model.n_predictors()
                )));
            }
        }
    }
    Ok(())
}

struct ChainDraws {
    coefficients: Array3<f64>,
    inclusion: Option<Array3<u8>>,
    lambda: Array1<f64>,
    tau: Array1<f64>,
    psi: Array2<f64>,
    lambda_acceptance: f64,
    rj_acceptance: f64,
}

/// Mutable per-chain state. `eta[[i, n]]` caches unit i's linear predictor
/// at observation n and is updated incrementally with every coefficient
/// change.
struct ChainState {
    b: Array2<f64>,
    gamma: Array2<u8>,
    psi: Array1<f64>,
    tau: f64,
    lambda: f64,
    pi: Array1<f64>,
    w: Array2<f64>,
    eta: Array2<f64>,
}

impl ChainState {
    fn init(model: &GwrModel, cfg: &McmcConfig) -> Result<Self, SamplerError> {
        let s = model.n_units();
        let p = model.n_predictors();
        let lambda = model.lambda_max() / 2.0;
        let mut gamma = Array2::<u8>::ones((s, p));
        if let Some(rj_cfg) = &cfg.rj {
            for &(i, j) in &rj_cfg.forced_exclusions {
                gamma[[i, j]] = 0;
            }
        }
        Ok(Self {
            b: Array2::zeros((s, p)),
            gamma,
            psi: Array1::ones(s),
            tau: 1.0,
            lambda,
            pi: Array1::from_elem(p, 0.5),
            w: kernel_weights(model.distances(), lambda)?,
            eta: Array2::zeros((s, s)),
        })
    }

    /// Likelihood change for unit i if predictor j's contribution moves by
    /// `delta` (birth, death, or coefficient update). Normalization terms
    /// cancel, so only the quadratic parts are accumulated.
    fn delta_log_likelihood(&self, model: &GwrModel, i: usize, j: usize, delta: f64) -> f64 {
        let x = model.x();
        let y = model.y();
        let mut dll = 0.0;
        for n in 0..y.len() {
            let precision = self.psi[i] * self.w[[n, i]];
            let r_old = y[n] - self.eta[[i, n]];
            let r_new = r_old - delta * x[[n, j]];
            dll += 0.5 * precision * (r_old * r_old - r_new * r_new);
        }
        dll
    }

    fn shift_predictor(&mut self, model: &GwrModel, i: usize, j: usize, delta: f64) {
        let x = model.x();
        for n in 0..self.eta.ncols() {
            self.eta[[i, n]] += delta * x[[n, j]];
        }
    }
}

fn run_chain(
    model: &GwrModel,
    cfg: &McmcConfig,
    chain: usize,
    cancel: &AtomicBool,
) -> Result<ChainDraws, SamplerError> {
    let s = model.n_units();
    let p = model.n_predictors();
    let retained = cfg.retained_per_chain();
    let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(chain as u64));
    let mut state = ChainState::init(model, cfg)?;

    let mut coefficients = Array3::<f64>::zeros((retained, s, p));
    let mut inclusion = cfg.rj.as_ref().map(|_| Array3::<u8>::zeros((retained, s, p)));
    let mut lambda_out = Array1::<f64>::zeros(retained);
    let mut tau_out = Array1::<f64>::zeros(retained);
    let mut psi_out = Array2::<f64>::zeros((retained, s));

    let mut lambda_accepted = 0usize;
    let mut rj_accepted = 0usize;
    let mut rj_proposed = 0usize;
    let mut kept = 0usize;

    for t in 0..cfg.iterations {
        if cancel.load(Ordering::Relaxed) {
            return Err(SamplerError::Cancelled);
        }

        update_coefficients(model, &mut state, &mut rng);
        if let Some(rj_cfg) = &cfg.rj {
            let (acc, prop) = rj_pass(model, rj_cfg, &mut state, &mut rng);
            rj_accepted += acc;
            rj_proposed += prop;
            update_inclusion_probabilities(&mut state, &mut rng, chain, t)?;
        }
        update_psi(model, &mut state, &mut rng, chain, t)?;
        update_tau(model, &mut state, &mut rng, chain, t)?;
        if update_lambda(model, cfg, &mut state, &mut rng, chain, t)? {
            lambda_accepted += 1;
        }

        if t >= cfg.burn_in && (t - cfg.burn_in) % cfg.thinning == 0 {
            coefficients.slice_mut(s![kept, .., ..]).assign(&state.b);
            if let Some(incl) = inclusion.as_mut() {
                incl.slice_mut(s![kept, .., ..]).assign(&state.gamma);
            }
            lambda_out[kept] = state.lambda;
            tau_out[kept] = state.tau;
            psi_out.row_mut(kept).assign(&state.psi);
            kept += 1;
        }
    }
    debug_assert_eq!(kept, retained);

    Ok(ChainDraws {
        coefficients,
        inclusion,
        lambda: lambda_out,
        tau: tau_out,
        psi: psi_out,
        lambda_acceptance: lambda_accepted as f64 / cfg.iterations as f64,
        rj_acceptance: if rj_proposed > 0 {
            rj_accepted as f64 / rj_proposed as f64
        } else {
            0.0
        },
    })
}

/// Conjugate normal full-conditional draw for every INCLUDED coefficient.
/// Excluded coefficients are frozen: no draw, no prior update.
fn update_coefficients<R: Rng + ?Sized>(model: &GwrModel, state: &mut ChainState, rng: &mut R) {
    let x = model.x();
    let y = model.y();
    let n_obs = y.len();
    for i in 0..model.n_units() {
        for j in 0..model.n_predictors() {
            if state.gamma[[i, j]] == 0 {
                continue;
            }
            let b_old = state.b[[i, j]];
            let mut weighted_x2 = 0.0;
            let mut weighted_xr = 0.0;
            for n in 0..n_obs {
                let precision = state.psi[i] * state.w[[n, i]];
                // Residual with predictor j's current contribution removed.
                let r = y[n] - state.eta[[i, n]] + b_old * x[[n, j]];
                weighted_x2 += precision * x[[n, j]] * x[[n, j]];
                weighted_xr += precision * x[[n, j]] * r;
            }
            let post_precision = state.tau + weighted_x2;
            let post_mean = weighted_xr / post_precision;
            let z: f64 = rng.sample(StandardNormal);
            let b_new = post_mean + z / post_precision.sqrt();
            state.b[[i, j]] = b_new;
            state.shift_predictor(model, i, j, b_new - b_old);
        }
    }
}

/// One birth/death proposal per (unit, predictor) pair.
/// Returns (accepted, proposed) counts.
fn rj_pass<R: Rng + ?Sized>(
    model: &GwrModel,
    rj_cfg: &RjConfig,
    state: &mut ChainState,
    rng: &mut R,
) -> (usize, usize) {
    let mut accepted = 0usize;
    let mut proposed = 0usize;
    for i in 0..model.n_units() {
        for j in 0..model.n_predictors() {
            if rj_cfg.forced_exclusions.contains(&(i, j)) {
                continue;
            }
            proposed += 1;
            let pi_j = state.pi[j];
            if state.gamma[[i, j]] == 1 {
                // Death: drop the term, freeze the value.
                let b_cur = state.b[[i, j]];
                let dll = state.delta_log_likelihood(model, i, j, -b_cur);
                let log_alpha =
                    rj::death_log_acceptance(model, rj_cfg, dll, b_cur, state.tau, pi_j);
                if rj::accept(log_alpha, rng) {
                    state.gamma[[i, j]] = 0;
                    state.shift_predictor(model, i, j, -b_cur);
                    accepted += 1;
                }
            } else {
                // Birth: jointly propose indicator flip and a fresh value.
                let b_star = rj_cfg.draw_proposal(rng);
                let dll = state.delta_log_likelihood(model, i, j, b_star);
                let log_alpha =
                    rj::birth_log_acceptance(model, rj_cfg, dll, b_star, state.tau, pi_j);
                if rj::accept(log_alpha, rng) {
                    state.b[[i, j]] = b_star;
                    state.gamma[[i, j]] = 1;
                    state.shift_predictor(model, i, j, b_star);
                    accepted += 1;
                }
            }
        }
    }
    (accepted, proposed)
}

/// Conjugate Beta(1 + n_included, 1 + S - n_included) update per predictor.
fn update_inclusion_probabilities<R: Rng + ?Sized>(
    state: &mut ChainState,
    rng: &mut R,
    chain: usize,
    iteration: usize,
) -> Result<(), SamplerError> {
    let s = state.gamma.nrows();
    for j in 0..state.pi.len() {
        let n_inc: usize = (0..s).map(|i| state.gamma[[i, j]] as usize).sum();
        let beta = Beta::new(1.0 + n_inc as f64, 1.0 + (s - n_inc) as f64)
            .map_err(|_| SamplerError::NumericalInstability { chain, iteration })?;
        state.pi[j] = beta.sample(rng);
    }
    Ok(())
}

/// Conjugate Gamma update for each observation-level precision psi_i.
fn update_psi<R: Rng + ?Sized>(
    model: &GwrModel,
    state: &mut ChainState,
    rng: &mut R,
    chain: usize,
    iteration: usize,
) -> Result<(), SamplerError> {
    let priors = model.priors();
    let y = model.y();
    let n_obs = y.len() as f64;
    for i in 0..model.n_units() {
        let mut weighted_rss = 0.0;
        for n in 0..y.len() {
            let r = y[n] - state.eta[[i, n]];
            weighted_rss += state.w[[n, i]] * r * r;
        }
        let shape = priors.psi_shape + 0.5 * n_obs;
        let rate = priors.psi_rate + 0.5 * weighted_rss;
        if !rate.is_finite() {
            return Err(SamplerError::NumericalInstability { chain, iteration });
        }
        let gamma = Gamma::new(shape, 1.0 / rate)
            .map_err(|_| SamplerError::NumericalInstability { chain, iteration })?;
        state.psi[i] = gamma.sample(rng);
    }
    Ok(())
}

/// Conjugate Gamma update for the shared coefficient precision tau.
/// Only included coefficients enter the sufficient statistics — frozen
/// (excluded) coefficients carry no prior update for this iteration.
fn update_tau<R: Rng + ?Sized>(
    model: &GwrModel,
    state: &mut ChainState,
    rng: &mut R,
    chain: usize,
    iteration: usize,
) -> Result<(), SamplerError> {
    let priors = model.priors();
    let mut count = 0usize;
    let mut sum_sq = 0.0;
    for i in 0..state.b.nrows() {
        for j in 0..state.b.ncols() {
            if state.gamma[[i, j]] == 1 {
                count += 1;
                sum_sq += state.b[[i, j]] * state.b[[i, j]];
            }
        }
    }
    let shape = priors.tau_shape + 0.5 * count as f64;
    let rate = priors.tau_rate + 0.5 * sum_sq;
    if !rate.is_finite() {
        return Err(SamplerError::NumericalInstability { chain, iteration });
    }
    let gamma = Gamma::new(shape, 1.0 / rate)
        .map_err(|_| SamplerError::NumericalInstability { chain, iteration })?;
    state.tau = gamma.sample(rng);
    Ok(())
}

/// Reflected random-walk Metropolis step for the bandwidth. The Uniform
/// prior contributes nothing inside the support and the reflection keeps
/// the proposal symmetric, so the ratio is purely the likelihood change.
/// Returns whether the proposal was accepted.
fn update_lambda<R: Rng + ?Sized>(
    model: &GwrModel,
    cfg: &McmcConfig,
    state: &mut ChainState,
    rng: &mut R,
    chain: usize,
    iteration: usize,
) -> Result<bool, SamplerError> {
    let d_max = model.lambda_max();
    let z: f64 = rng.sample(StandardNormal);
    let mut proposal = state.lambda + cfg.lambda_step * z;
    for _ in 0..64 {
        if proposal > 0.0 && proposal < d_max {
            break;
        }
        if proposal <= 0.0 {
            proposal = -proposal;
        }
        if proposal >= d_max {
            proposal = 2.0 * d_max - proposal;
        }
    }
    if !(proposal > 0.0 && proposal < d_max) {
        // Step size absurdly larger than the support; skip the move.
        return Ok(false);
    }

    let w_new = kernel_weights(model.distances(), proposal)?;
    let mut ll_old = 0.0;
    let mut ll_new = 0.0;
    for i in 0..model.n_units() {
        let eta_i = state.eta.row(i);
        ll_old += model.unit_log_likelihood(eta_i, state.psi[i], state.w.column(i));
        ll_new += model.unit_log_likelihood(eta_i, state.psi[i], w_new.column(i));
    }
    if !ll_old.is_finite() || !ll_new.is_finite() {
        return Err(SamplerError::NumericalInstability { chain, iteration });
    }
    if rj::accept(ll_new - ll_old, rng) {
        state.lambda = proposal;
        state.w = w_new;
        return Ok(true);
    }
    Ok(false)
}
