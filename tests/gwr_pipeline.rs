use gwr::{
    build_partition_ensemble, dahl_partition, mode_partition, rand_index, DistanceMatrix,
    EnsembleConfig, GaussianMixtureOracle, GibbsMetropolisSampler, GwrModel, McmcConfig,
    PosteriorDraws, PriorConfig, RjConfig, Sampler,
};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::sync::atomic::AtomicBool;

/// Two spatial regimes far apart on a line: units in the first regime have
/// slope +2, units in the second slope -2, shared intercept. Within-regime
/// distances are tiny relative to the gap, so local regressions see almost
/// only their own regime once the bandwidth adapts.
fn simulate_two_regimes(
    per_regime: usize,
    seed: u64,
) -> (GwrModel, Vec<usize>) {
    let s = 2 * per_regime;
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, 0.3).expect("valid params");

    let mut positions = Vec::with_capacity(s);
    for i in 0..per_regime {
        positions.push(i as f64 * 0.2);
    }
    for i in 0..per_regime {
        positions.push(100.0 + i as f64 * 0.2);
    }

    let mut raw = Array2::<f64>::zeros((s, s));
    for i in 0..s {
        for j in (i + 1)..s {
            let d = (positions[i] - positions[j]).abs();
            raw[[i, j]] = d;
            raw[[j, i]] = d;
        }
    }
    let dist = DistanceMatrix::from_matrix(raw, 10.0).expect("valid matrix");

    let mut x = Array2::<f64>::zeros((s, 2));
    let mut y = Array1::<f64>::zeros(s);
    let mut truth = Vec::with_capacity(s);
    for i in 0..s {
        let slope = if i < per_regime { 2.0 } else { -2.0 };
        truth.push(if i < per_regime { 1 } else { 2 });
        x[[i, 0]] = 1.0;
        x[[i, 1]] = rng.random_range(-1.0..1.0);
        y[i] = 0.5 + slope * x[[i, 1]] + noise.sample(&mut rng);
    }

    let model = GwrModel::new(x, y, dist, PriorConfig::default()).expect("valid model");
    (model, truth)
}

fn run_sampler(model: &GwrModel, cfg: &McmcConfig) -> PosteriorDraws {
    let cancel = AtomicBool::new(false);
    GibbsMetropolisSampler
        .run(model, cfg, &cancel)
        .expect("sampling succeeds")
}

#[test]
fn full_pipeline_recovers_two_spatial_regimes() {
    let (model, truth) = simulate_two_regimes(12, 20250301);
    let cfg = McmcConfig {
        iterations: 700,
        burn_in: 300,
        thinning: 2,
        chains: 1,
        seed: 71,
        lambda_step: 0.5,
        rj: None,
    };
    let draws = run_sampler(&model, &cfg);
    assert_eq!(draws.n_draws(), 200);

    let oracle = GaussianMixtureOracle {
        max_components: 4,
        ..GaussianMixtureOracle::default()
    };
    let ensemble_cfg = EnsembleConfig {
        run_seed: 9,
        ..EnsembleConfig::default()
    };
    let cancel = AtomicBool::new(false);
    let ensemble = build_partition_ensemble(&draws.coefficients, &oracle, &ensemble_cfg, &cancel)
        .expect("ensemble builds");
    assert_eq!(ensemble.n_units(), 24);
    assert!(ensemble.n_partitions() >= 100, "too many dropped draws");

    let consensus = dahl_partition(&ensemble).expect("non-empty ensemble");
    // Dahl's output must be an exact observed row of the ensemble.
    let winner_row: Vec<usize> = ensemble
        .labels
        .row(consensus.member_index)
        .to_vec();
    assert_eq!(consensus.partition, winner_row);

    let ri = rand_index(&consensus.partition, &truth).expect("equal lengths");
    assert!(ri >= 0.9, "consensus Rand index {ri} below 0.9");

    let mode = mode_partition(&ensemble).expect("non-empty ensemble");
    let ri_mode = rand_index(&mode, &truth).expect("equal lengths");
    assert!(ri_mode >= 0.9, "mode Rand index {ri_mode} below 0.9");
}

#[test]
fn rj_keeps_strong_predictors_and_prunes_weak_ones() {
    // Third predictor has a zero true coefficient everywhere; the strong
    // slope should stay included essentially always, the null one should
    // hover near its Beta(1,1) prior.
    let (base_model, _truth) = simulate_two_regimes(8, 4);
    let s = base_model.n_units();
    let mut rng = StdRng::seed_from_u64(99);
    let mut x = Array2::<f64>::zeros((s, 3));
    for i in 0..s {
        x[[i, 0]] = base_model.x()[[i, 0]];
        x[[i, 1]] = base_model.x()[[i, 1]];
        x[[i, 2]] = rng.random_range(-1.0..1.0);
    }
    let model = GwrModel::new(
        x,
        base_model.y().clone(),
        base_model.distances().clone(),
        PriorConfig::default(),
    )
    .expect("valid model");

    let cfg = McmcConfig {
        iterations: 500,
        burn_in: 200,
        thinning: 1,
        chains: 1,
        seed: 13,
        lambda_step: 0.5,
        rj: Some(RjConfig::default()),
    };
    let draws = run_sampler(&model, &cfg);
    let incl = draws.inclusion.as_ref().expect("inclusion tensor present");

    let rate = |j: usize| -> f64 {
        let mut total = 0usize;
        for d in 0..draws.n_draws() {
            for i in 0..s {
                total += incl[[d, i, j]] as usize;
            }
        }
        total as f64 / (draws.n_draws() * s) as f64
    };
    let strong = rate(1);
    let null = rate(2);
    assert!(strong >= 0.95, "strong predictor inclusion {strong}");
    assert!(null <= 0.9, "null predictor inclusion {null}");
    assert!(strong > null);
}

#[test]
fn draw_tensors_round_trip_through_json() {
    let (model, _truth) = simulate_two_regimes(4, 61);
    let cfg = McmcConfig {
        iterations: 40,
        burn_in: 20,
        thinning: 2,
        chains: 2,
        seed: 3,
        lambda_step: 0.5,
        rj: Some(RjConfig::default()),
    };
    let draws = run_sampler(&model, &cfg);

    let payload = serde_json::to_string(&draws).expect("draws serialize");
    let restored: PosteriorDraws = serde_json::from_str(&payload).expect("draws deserialize");
    assert_eq!(restored.coefficients, draws.coefficients);
    assert_eq!(restored.inclusion, draws.inclusion);
    assert_eq!(restored.lambda, draws.lambda);
    assert_eq!(restored.n_chains, 2);

    let cfg_payload = serde_json::to_string(&cfg).expect("config serializes");
    let cfg_restored: McmcConfig = serde_json::from_str(&cfg_payload).expect("config restores");
    assert_eq!(cfg_restored.iterations, cfg.iterations);
    assert_eq!(cfg_restored.seed, cfg.seed);
}
