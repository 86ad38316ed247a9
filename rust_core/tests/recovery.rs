use latentmc_core::chain::ChainStatus;
use latentmc_core::diagnostics::DiagnosticWarning;
use latentmc_core::gradient::GradientEngine;
use latentmc_core::nuts::{run_chain, NutsConfig};
use latentmc_core::progress::ProgressState;
use latentmc_core::{run, simulate, ModelSpec, RunConfig, RunOutput};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let cov: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    let va: f64 = a.iter().map(|x| (x - ma).powi(2)).sum();
    let vb: f64 = b.iter().map(|y| (y - mb).powi(2)).sum();
    cov / (va * vb).sqrt()
}

/// RMSE between the posterior mean of `latent[t] * loading[d]` and the
/// noiseless signal.
fn reconstruction_rmse(out: &RunOutput) -> f64 {
    let mut sq = 0.0;
    for ((t, d), fitted) in out.fit.mu.indexed_iter() {
        let truth = out.latent_true[t] * out.loading_true[d];
        sq += (fitted - truth).powi(2);
    }
    (sq / out.fit.mu.len() as f64).sqrt()
}

#[test]
fn test_run_is_reproducible() {
    let config = RunConfig {
        n_time: 20,
        n_series: 5,
        draws: 100,
        tune: 100,
        seed: 9,
        ..RunConfig::default()
    };
    let a = run(&config, None).unwrap();
    let b = run(&config, None).unwrap();
    assert_eq!(a.y, b.y);
    assert_eq!(a.fit.latent, b.fit.latent);
    for (ca, cb) in a.fit.samples.chains.iter().zip(b.fit.samples.chains.iter()) {
        assert_eq!(ca.samples, cb.samples);
    }

    let threaded = run(&RunConfig { num_threads: 1, ..config }, None).unwrap();
    assert_eq!(a.fit.latent, threaded.fit.latent);
}

#[test]
fn test_recovers_latent_path() {
    let config = RunConfig {
        n_time: 40,
        n_series: 10,
        sigma: 0.3,
        draws: 300,
        tune: 300,
        seed: 42,
        ..RunConfig::default()
    };
    let out = run(&config, None).unwrap();

    let corr = correlation(&out.fit.latent.mean, &out.latent_true).abs();
    assert!(corr > 0.9, "correlation {}", corr);

    let rmse = reconstruction_rmse(&out);
    assert!(rmse < 0.2, "reconstruction RMSE {}", rmse);

    let sigma = out.fit.obs_sigma;
    assert!((sigma.mean - 0.3).abs() < 0.05, "obs_sigma mean {}", sigma.mean);
    assert!(sigma.hdi_lower < sigma.mean && sigma.mean < sigma.hdi_upper);

    assert!(out.latent_coverage() > 0.3, "coverage {}", out.latent_coverage());
    for t in 0..40 {
        assert!(out.fit.latent.hdi_lower[t] <= out.fit.latent.hdi_upper[t]);
    }
    // Both chains start in the same sign mode.
    let report = &out.fit.diagnostics;
    assert_eq!(report.chains.len(), 2);
    assert!(report.divergences() < 30, "{} divergences", report.divergences());
}

#[test]
fn test_zero_noise_limit() {
    let config = RunConfig {
        n_time: 30,
        n_series: 6,
        sigma: 0.01,
        draws: 200,
        tune: 200,
        chains: 1,
        seed: 3,
        ..RunConfig::default()
    };
    let out = run(&config, None).unwrap();

    let corr = correlation(&out.fit.latent.mean, &out.latent_true).abs();
    assert!(corr > 0.99, "correlation {}", corr);
    let rmse = reconstruction_rmse(&out);
    assert!(rmse < 0.05, "reconstruction RMSE {}", rmse);
    assert!(out.fit.obs_sigma.mean < 0.05);
}

#[test]
fn test_oversized_step_diverges() {
    let config = RunConfig {
        n_time: 20,
        n_series: 4,
        sigma: 0.05,
        draws: 50,
        tune: 0,
        chains: 1,
        init_step_size: Some(5.0),
        ..RunConfig::default()
    };
    let out = run(&config, None).unwrap();
    let report = &out.fit.diagnostics;
    assert!(report.divergences() > 0);
    assert!(report.divergences() <= 50);
    let chain = &out.fit.samples.chains[0];
    assert_eq!(chain.len(), 50);
    assert!(chain.samples.iter().all(|s| s.position.iter().all(|x| x.is_finite())));
    assert!(report
        .warnings
        .iter()
        .any(|w| matches!(w, DiagnosticWarning::Divergences { .. })));
}

#[test]
fn test_cancelled_run_reports_unreliable_step_size() {
    let config = RunConfig {
        n_time: 10,
        n_series: 3,
        draws: 50,
        tune: 50,
        ..RunConfig::default()
    };
    let progress = ProgressState::new(config.chains, config.draws, config.tune);
    progress.cancel();
    let out = run(&config, Some(&progress)).unwrap();

    for chain in &out.fit.samples.chains {
        assert_eq!(chain.status, ChainStatus::CancelledDuringTuning);
        assert!(chain.is_empty());
    }
    let warnings = &out.fit.diagnostics.warnings;
    assert!(warnings
        .iter()
        .any(|w| matches!(w, DiagnosticWarning::UnreliableStepSize { chain: 0 })));
    assert!(out.fit.latent.mean.iter().all(|m| m.is_nan()));
}

#[test]
fn test_run_from_json() {
    let config = RunConfig::from_json_str(r#"{"T": 12, "D": 3, "draws": 30, "tune": 30}"#).unwrap();
    assert_eq!(config.n_time, 12);
    assert_eq!(config.chains, 2);
    let out = run(&config, None).unwrap();
    assert_eq!(out.fit.samples.total_draws(), 60);
    assert_eq!(out.fit.latent.len(), 12);
}

#[test]
fn test_default_run_hdi_coverage_is_nominal() {
    // T = 80, D = 25, 2 chains × (1000 tune + 1000 draws), 94% HDI.
    for seed in 1..=4 {
        let out = run(&RunConfig { seed, ..RunConfig::default() }, None).unwrap();
        let coverage = out.latent_coverage();
        assert!(
            (0.88..=0.98).contains(&coverage),
            "seed {}: sign-aligned coverage {}",
            seed,
            coverage
        );
        assert!(out.fit.diagnostics.max_r_hat() < 1.05, "seed {}", seed);
    }
}

#[test]
fn test_obs_sigma_near_zero_diverges_without_panic() {
    let data = simulate(20, 4, 0.5, 8).unwrap();
    let model = ModelSpec::new(data.y, 0.25).unwrap();
    let mut init = model.initial_point();
    init[model.sigma_index()] = 1e-6_f64.ln();

    let draws = 40;
    for (chain_id, step_size) in [(0, Some(0.05)), (1, None)] {
        let config = NutsConfig {
            step_size,
            num_tune: 0,
            num_draws: draws,
            ..NutsConfig::default()
        };
        let mut engine = GradientEngine::new(&model);
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        rng.set_stream(chain_id as u64 + 1);
        let chain =
            run_chain(&mut engine, &config, chain_id, &mut rng, Some(init.clone()), None).unwrap();

        assert_eq!(chain.status, ChainStatus::Completed);
        assert_eq!(chain.len(), draws);
        assert!(chain.divergences() <= draws);
        assert!(chain.samples.iter().all(|s| s.position.iter().all(|x| x.is_finite())));
        assert!(chain.samples.iter().all(|s| s.position[model.sigma_index()] > 0.0));
        if step_size.is_some() {
            // A step sized for the posterior bulk cannot cross the σ → 0 funnel.
            assert!(chain.divergences() > 0, "no divergences with step {:?}", step_size);
        }
    }
}
