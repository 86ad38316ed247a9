use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};

/// Everything needed for one simulate-and-recover run.
///
/// Defaults reproduce the reference analysis: 80 time steps, 25 series,
/// noise 0.6, two chains of 1000 tuning and 1000 kept draws.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    #[serde(alias = "T")]
    pub n_time: usize,
    #[serde(alias = "D")]
    pub n_series: usize,
    /// Observation noise used by the simulator.
    pub sigma: f64,
    pub seed: u64,
    /// Step scale of the Gaussian random-walk prior on the latent path.
    pub rw_sigma: f64,
    pub draws: usize,
    pub tune: usize,
    pub chains: usize,
    pub target_accept: f64,
    pub hdi_prob: f64,
    pub max_tree_depth: usize,
    pub init_step_size: Option<f64>,
    pub init_jitter: f64,
    pub adapt_mass_matrix: bool,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            n_time: 80,
            n_series: 25,
            sigma: 0.6,
            seed: 42,
            rw_sigma: 0.25,
            draws: 1000,
            tune: 1000,
            chains: 2,
            target_accept: 0.9,
            hdi_prob: 0.94,
            max_tree_depth: 10,
            init_step_size: None,
            init_jitter: 0.1,
            adapt_mass_matrix: true,
            num_threads: 0,
        }
    }
}

impl RunConfig {
    /// Parse a JSON document (missing fields take their defaults) and validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RunConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.n_time == 0 {
            return Err(ConfigError::EmptyTime);
        }
        if self.n_series == 0 {
            return Err(ConfigError::EmptySeries);
        }
        check_positive("sigma", self.sigma)?;
        check_positive("rw_sigma", self.rw_sigma)?;
        if !(self.hdi_prob > 0.0 && self.hdi_prob <= 1.0) {
            return Err(ConfigError::HdiProb(self.hdi_prob));
        }
        self.sampler_config().validate()
    }

    /// The sampler-facing subset of this configuration.
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            num_chains: self.chains,
            num_draws: self.draws,
            num_tune: self.tune,
            target_accept: self.target_accept,
            max_tree_depth: self.max_tree_depth,
            init_step_size: self.init_step_size,
            init_jitter: self.init_jitter,
            adapt_mass_matrix: self.adapt_mass_matrix,
            seed: self.seed,
            num_threads: self.num_threads,
        }
    }
}

/// Configuration for the multi-chain NUTS sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub num_chains: usize,
    pub num_draws: usize,
    pub num_tune: usize,
    pub target_accept: f64,
    pub max_tree_depth: usize,
    /// Starting step size. `None` runs the step-size heuristic.
    pub init_step_size: Option<f64>,
    /// Half-width of the uniform jitter added to each chain's start point.
    pub init_jitter: f64,
    pub adapt_mass_matrix: bool,
    pub seed: u64,
    /// Number of threads. 0 means use Rayon's default (all cores).
    pub num_threads: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_chains: 2,
            num_draws: 1000,
            num_tune: 1000,
            target_accept: 0.9,
            max_tree_depth: 10,
            init_step_size: None,
            init_jitter: 0.1,
            adapt_mass_matrix: true,
            seed: 42,
            num_threads: 0,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.num_chains == 0 {
            return Err(ConfigError::NoChains);
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(ConfigError::TargetAccept(self.target_accept));
        }
        if self.max_tree_depth == 0 {
            return Err(ConfigError::TreeDepth);
        }
        if let Some(eps) = self.init_step_size {
            check_positive("init_step_size", eps)?;
        }
        if !(self.init_jitter.is_finite() && self.init_jitter >= 0.0) {
            return Err(ConfigError::Jitter(self.init_jitter));
        }
        Ok(())
    }
}

fn check_positive(name: &'static str, value: f64) -> std::result::Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_defaults_are_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.n_time, 80);
        assert_eq!(config.n_series, 25);
        assert_eq!(config.chains, 2);
    }

    #[test]
    fn test_rejects_each_invalid_field() {
        let cases: Vec<(RunConfig, ConfigError)> = vec![
            (RunConfig { n_time: 0, ..Default::default() }, ConfigError::EmptyTime),
            (RunConfig { n_series: 0, ..Default::default() }, ConfigError::EmptySeries),
            (RunConfig { chains: 0, ..Default::default() }, ConfigError::NoChains),
            (
                RunConfig { target_accept: 1.0, ..Default::default() },
                ConfigError::TargetAccept(1.0),
            ),
            (
                RunConfig { target_accept: 0.0, ..Default::default() },
                ConfigError::TargetAccept(0.0),
            ),
            (
                RunConfig { sigma: 0.0, ..Default::default() },
                ConfigError::NonPositive { name: "sigma", value: 0.0 },
            ),
            (
                RunConfig { rw_sigma: -0.25, ..Default::default() },
                ConfigError::NonPositive { name: "rw_sigma", value: -0.25 },
            ),
            (RunConfig { hdi_prob: 1.5, ..Default::default() }, ConfigError::HdiProb(1.5)),
            (RunConfig { max_tree_depth: 0, ..Default::default() }, ConfigError::TreeDepth),
            (
                RunConfig { init_step_size: Some(0.0), ..Default::default() },
                ConfigError::NonPositive { name: "init_step_size", value: 0.0 },
            ),
            (RunConfig { init_jitter: -1.0, ..Default::default() }, ConfigError::Jitter(-1.0)),
        ];
        for (config, expected) in cases {
            assert_eq!(config.validate(), Err(expected));
        }
    }

    #[test]
    fn test_nan_sigma_rejected() {
        let config = RunConfig { sigma: f64::NAN, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositive { name: "sigma", .. })
        ));
    }

    #[test]
    fn test_from_json_with_aliases() {
        let config = RunConfig::from_json_str(r#"{"T": 40, "D": 5, "draws": 200}"#).unwrap();
        assert_eq!(config.n_time, 40);
        assert_eq!(config.n_series, 5);
        assert_eq!(config.draws, 200);
        assert_eq!(config.tune, 1000);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        let err = RunConfig::from_json_str(r#"{"chains": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::NoChains)));

        let err = RunConfig::from_json_str(r#"{"draws": -3}"#).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
