//! Simulate, fit and summarize in one call.

use ndarray::Array2;

use crate::config::RunConfig;
use crate::diagnostics::{compute_diagnostics, DiagnosticsReport};
use crate::error::Result;
use crate::model::ModelSpec;
use crate::progress::ProgressState;
use crate::sampler::{sample, SampleResult};
use crate::simulate::{simulate, SimulatedData};
use crate::summary::{summarize_component, summarize_latent, summarize_mu, ComponentSummary, Summary};

/// Posterior of a fitted model together with its summaries.
#[derive(Debug, Clone)]
pub struct FitOutput {
    pub samples: SampleResult,
    pub latent: Summary,
    pub obs_sigma: ComponentSummary,
    /// Posterior mean of `latent[t] * loading[d]`, shape T×D.
    pub mu: Array2<f64>,
    pub diagnostics: DiagnosticsReport,
}

/// Everything produced by [`run`]: the simulated data and its fit.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub t: Vec<f64>,
    pub latent_true: Vec<f64>,
    pub loading_true: Vec<f64>,
    pub y: Array2<f64>,
    pub fit: FitOutput,
}

impl RunOutput {
    /// Share of true latent values inside their HDI, after flipping the
    /// posterior to the sign of the truth.
    pub fn latent_coverage(&self) -> f64 {
        let latent = &self.fit.latent;
        let dot: f64 = latent.mean.iter().zip(&self.latent_true).map(|(m, x)| m * x).sum();
        if dot >= 0.0 {
            latent.coverage(&self.latent_true)
        } else {
            let flipped: Vec<f64> = self.latent_true.iter().map(|x| -x).collect();
            latent.coverage(&flipped)
        }
    }
}

/// Fit the model to user-supplied observations `y` (shape T×D).
///
/// The simulation fields of `config` (`n_time`, `n_series`, `sigma`) are
/// ignored; the shape comes from `y`.
pub fn fit(y: Array2<f64>, config: &RunConfig, progress: Option<&ProgressState>) -> Result<FitOutput> {
    config.validate()?;
    let model = ModelSpec::new(y, config.rw_sigma)?;
    fit_model(&model, config, progress)
}

/// Simulate data from `config`, fit it and summarize the posterior.
pub fn run(config: &RunConfig, progress: Option<&ProgressState>) -> Result<RunOutput> {
    config.validate()?;
    let SimulatedData { t, latent_true, loading, y } =
        simulate(config.n_time, config.n_series, config.sigma, config.seed)?;
    log::info!(
        "simulated {}×{} observations (sigma = {}, seed = {})",
        config.n_time,
        config.n_series,
        config.sigma,
        config.seed
    );

    let model = ModelSpec::new(y.clone(), config.rw_sigma)?;
    let fit = fit_model(&model, config, progress)?;

    Ok(RunOutput { t, latent_true, loading_true: loading, y, fit })
}

fn fit_model(model: &ModelSpec, config: &RunConfig, progress: Option<&ProgressState>) -> Result<FitOutput> {
    let samples = sample(model, &config.sampler_config(), progress)?;

    let latent = summarize_latent(&samples.chains, model.n_time(), config.hdi_prob);
    let obs_sigma = summarize_component(&samples.chains, model.sigma_index(), config.hdi_prob);
    let mu = summarize_mu(&samples.chains, model.n_time(), model.n_series());
    let diagnostics = compute_diagnostics(&samples, config.hdi_prob);

    log::info!(
        "obs_sigma posterior mean {:.4}, {} divergences, max R-hat {:.3}",
        obs_sigma.mean,
        diagnostics.divergences(),
        diagnostics.max_r_hat()
    );

    Ok(FitOutput { samples, latent, obs_sigma, mu, diagnostics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, Error};

    fn tiny_config() -> RunConfig {
        RunConfig {
            n_time: 15,
            n_series: 4,
            draws: 40,
            tune: 40,
            chains: 2,
            seed: 5,
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_run_shapes() {
        let out = run(&tiny_config(), None).unwrap();
        assert_eq!(out.t.len(), 15);
        assert_eq!(out.y.dim(), (15, 4));
        assert_eq!(out.fit.latent.len(), 15);
        assert_eq!(out.fit.samples.chains.len(), 2);
        assert_eq!(out.fit.samples.total_draws(), 80);
        assert_eq!(out.fit.diagnostics.params.len(), 20);
        assert_eq!(out.fit.mu.dim(), (15, 4));
        assert!(out.fit.mu.iter().all(|x| x.is_finite()));
        assert!(out.fit.obs_sigma.mean > 0.0);
        for t in 0..15 {
            assert!(out.fit.latent.hdi_lower[t] <= out.fit.latent.hdi_upper[t]);
        }
    }

    #[test]
    fn test_invalid_config_fails_before_sampling() {
        let config = RunConfig { rw_sigma: 0.0, ..tiny_config() };
        let err = run(&config, None).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::NonPositive { name: "rw_sigma", .. })));
    }

    #[test]
    fn test_fit_rejects_nan_data() {
        let mut y = Array2::zeros((5, 2));
        y[[3, 1]] = f64::NAN;
        let err = fit(y, &tiny_config(), None).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::NonFiniteData { row: 3, col: 1 })));
    }
}
