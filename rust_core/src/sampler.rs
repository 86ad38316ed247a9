use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::chain::Chain;
use crate::config::SamplerConfig;
use crate::error::{Error, Result};
use crate::gradient::{GradientEngine, LogDensity};
use crate::model::ModelSpec;
use crate::nuts::{self, NutsConfig};
use crate::progress::ProgressState;

/// Result of sampling across all chains.
#[derive(Debug, Clone)]
pub struct SampleResult {
    pub chains: Vec<Chain>,
    pub param_names: Vec<String>,
    pub num_tune: usize,
    pub num_draws: usize,
}

impl SampleResult {
    /// Get posterior mean for each parameter.
    pub fn mean(&self) -> Vec<f64> {
        let n_params = self.param_names.len();
        let mut sums = vec![0.0; n_params];
        let mut count = 0usize;

        for draw in self.chains.iter().flat_map(|c| c.samples.iter()) {
            for (s, v) in sums.iter_mut().zip(draw.position.iter()) {
                *s += v;
            }
            count += 1;
        }

        sums.iter().map(|s| s / count as f64).collect()
    }

    pub fn total_draws(&self) -> usize {
        self.chains.iter().map(Chain::len).sum()
    }

    pub fn divergences(&self) -> usize {
        self.chains.iter().map(Chain::divergences).sum()
    }

    /// Draws of one parameter from every chain, concatenated in chain order.
    pub fn pooled(&self, index: usize) -> Vec<f64> {
        self.chains.iter().flat_map(|c| c.samples.iter().map(move |s| s.position[index])).collect()
    }

    /// Draws of one parameter, one vector per chain.
    pub fn traces(&self, index: usize) -> Vec<Vec<f64>> {
        self.chains.iter().map(|c| c.trace(index)).collect()
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.param_names.iter().position(|n| n == name)
    }
}

/// Run parallel NUTS chains on the latent-factor model.
pub fn sample(
    model: &ModelSpec,
    config: &SamplerConfig,
    progress: Option<&ProgressState>,
) -> Result<SampleResult> {
    log::info!(
        "sampling {} chains × ({} tune + {} draws), {} parameters",
        config.num_chains,
        config.num_tune,
        config.num_draws,
        model.dim()
    );
    sample_with(|| GradientEngine::new(model), config, progress)
}

/// Run parallel NUTS chains, building one log density per chain with `make_target`.
///
/// Chain `k` draws from stream `k + 1` of a ChaCha8 generator seeded with
/// `config.seed`, so results depend on the seed and chain index only, never
/// on thread scheduling or the thread count.
pub fn sample_with<M, F>(
    make_target: F,
    config: &SamplerConfig,
    progress: Option<&ProgressState>,
) -> Result<SampleResult>
where
    M: LogDensity,
    F: Fn() -> M + Sync,
{
    config.validate()?;
    let nuts_config = NutsConfig::from(config);
    let param_names = make_target().param_names();

    let run = || -> Result<Vec<Chain>> {
        (0..config.num_chains)
            .into_par_iter()
            .map(|chain_id| {
                let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
                rng.set_stream(chain_id as u64 + 1);
                let mut target = make_target();
                nuts::run_chain(&mut target, &nuts_config, chain_id, &mut rng, None, progress)
            })
            .collect()
    };

    let chains = if config.num_threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .build()
            .map_err(|e| Error::ThreadPool(e.to_string()))?;
        pool.install(run)?
    } else {
        run()?
    };

    Ok(SampleResult {
        chains,
        param_names,
        num_tune: config.num_tune,
        num_draws: config.num_draws,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, NonFiniteDensity};
    use crate::simulate::simulate;

    struct StdNormal2;

    impl LogDensity for StdNormal2 {
        fn dim(&self) -> usize {
            2
        }

        fn logp_and_grad(&mut self, q: &[f64], grad: &mut [f64]) -> std::result::Result<f64, NonFiniteDensity> {
            let mut lp = 0.0;
            for (g, &x) in grad.iter_mut().zip(q) {
                *g = -x;
                lp -= 0.5 * x * x;
            }
            Ok(lp)
        }
    }

    fn small_config(num_threads: usize) -> SamplerConfig {
        SamplerConfig {
            num_chains: 3,
            num_draws: 50,
            num_tune: 50,
            seed: 11,
            num_threads,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn test_deterministic_across_thread_counts() {
        let a = sample_with(|| StdNormal2, &small_config(1), None).unwrap();
        let b = sample_with(|| StdNormal2, &small_config(3), None).unwrap();
        for (ca, cb) in a.chains.iter().zip(b.chains.iter()) {
            assert_eq!(ca.samples, cb.samples);
            assert_eq!(ca.step_size, cb.step_size);
        }
    }

    #[test]
    fn test_chains_are_distinct() {
        let result = sample_with(|| StdNormal2, &small_config(0), None).unwrap();
        assert_eq!(result.chains.len(), 3);
        assert_eq!(result.total_draws(), 150);
        assert_ne!(result.chains[0].samples, result.chains[1].samples);
        let ids: Vec<usize> = result.chains.iter().map(|c| c.chain_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_pooled_and_traces() {
        let result = sample_with(|| StdNormal2, &small_config(0), None).unwrap();
        let traces = result.traces(1);
        assert_eq!(traces.len(), 3);
        let pooled = result.pooled(1);
        assert_eq!(pooled.len(), 150);
        assert_eq!(pooled[50..100], traces[1][..]);
        assert_eq!(result.mean().len(), 2);
        assert_eq!(result.param_index("x[1]"), Some(1));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SamplerConfig { num_chains: 0, ..small_config(0) };
        let err = sample_with(|| StdNormal2, &config, None).unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::NoChains)));
    }

    #[test]
    fn test_model_param_names() {
        let data = simulate(10, 3, 0.5, 1).unwrap();
        let model = ModelSpec::new(data.y, 0.25).unwrap();
        let config = SamplerConfig { num_chains: 1, num_draws: 5, num_tune: 5, ..SamplerConfig::default() };
        let result = sample(&model, &config, None).unwrap();
        assert_eq!(result.param_names.len(), 14);
        assert_eq!(result.param_names[13], "obs_sigma");
        assert!(result.chains[0].samples.iter().all(|s| s.position[13] > 0.0));
    }
}
