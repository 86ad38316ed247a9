//! Chain storage.

use crate::model::ModelParameters;

/// One recorded post-warmup draw.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSample {
    /// Position in model (constrained) space.
    pub position: Vec<f64>,
    /// Unconstrained log density at `position`, including Jacobian terms.
    pub log_prob: f64,
    pub diverged: bool,
    pub tree_depth: usize,
    /// Mean Metropolis acceptance statistic over the trajectory.
    pub accept_stat: f64,
    pub n_leapfrog: usize,
    /// Hamiltonian after momentum resampling.
    pub energy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    Completed,
    /// Stopped before tuning finished; the step size was never frozen.
    CancelledDuringTuning,
    /// Stopped during sampling; recorded draws are valid but fewer than requested.
    CancelledDuringSampling,
}

/// Result of a single NUTS chain run. Tuning draws are not kept.
#[derive(Debug, Clone)]
pub struct Chain {
    pub chain_id: usize,
    pub samples: Vec<PosteriorSample>,
    pub status: ChainStatus,
    /// Step size used for the sampling phase (or the last warmup step size
    /// when cancelled during tuning).
    pub step_size: f64,
    /// Diagonal of the inverse mass matrix.
    pub inv_mass: Vec<f64>,
    pub tune_divergences: usize,
    pub max_tree_depth: usize,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn step_size_reliable(&self) -> bool {
        self.status != ChainStatus::CancelledDuringTuning
    }

    pub fn divergences(&self) -> usize {
        self.samples.iter().filter(|s| s.diverged).count()
    }

    /// Draws whose trajectory stopped at the tree-depth cap instead of a U-turn.
    pub fn depth_saturated(&self) -> usize {
        self.samples.iter().filter(|s| s.tree_depth >= self.max_tree_depth).count()
    }

    pub fn mean_accept_stat(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.samples.iter().map(|s| s.accept_stat).sum::<f64>() / self.samples.len() as f64
    }

    pub fn mean_tree_depth(&self) -> f64 {
        if self.samples.is_empty() {
            return f64::NAN;
        }
        self.samples.iter().map(|s| s.tree_depth as f64).sum::<f64>() / self.samples.len() as f64
    }

    /// Draws of one coordinate, in order.
    pub fn trace(&self, index: usize) -> Vec<f64> {
        self.samples.iter().map(|s| s.position[index]).collect()
    }

    /// Unpack each draw into model parameters.
    pub fn parameters(&self, n_time: usize, n_series: usize) -> Vec<ModelParameters> {
        self.samples
            .iter()
            .filter_map(|s| ModelParameters::from_flat(&s.position, n_time, n_series).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(x: f64, diverged: bool, depth: usize) -> PosteriorSample {
        PosteriorSample {
            position: vec![x, 2.0 * x, 0.5],
            log_prob: -1.0,
            diverged,
            tree_depth: depth,
            accept_stat: 0.5,
            n_leapfrog: (1 << depth) - 1,
            energy: 1.0,
        }
    }

    #[test]
    fn test_chain_statistics() {
        let chain = Chain {
            chain_id: 0,
            samples: vec![sample(1.0, false, 2), sample(2.0, true, 4), sample(3.0, false, 3)],
            status: ChainStatus::Completed,
            step_size: 0.1,
            inv_mass: vec![1.0; 3],
            tune_divergences: 0,
            max_tree_depth: 10,
        };
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.divergences(), 1);
        assert_eq!(chain.trace(1), vec![2.0, 4.0, 6.0]);
        assert!((chain.mean_tree_depth() - 3.0).abs() < 1e-12);
        assert_eq!(chain.depth_saturated(), 0);
        assert_eq!(Chain { max_tree_depth: 3, ..chain.clone() }.depth_saturated(), 2);
        assert!(chain.step_size_reliable());

        let params = chain.parameters(1, 1);
        assert_eq!(params.len(), 3);
        assert_eq!(params[2].latent, vec![3.0]);
        assert_eq!(params[2].obs_sigma, 0.5);
    }

    #[test]
    fn test_cancelled_tuning_is_unreliable() {
        let chain = Chain {
            chain_id: 1,
            samples: Vec::new(),
            status: ChainStatus::CancelledDuringTuning,
            step_size: 0.3,
            inv_mass: vec![1.0],
            tune_divergences: 0,
            max_tree_depth: 10,
        };
        assert!(!chain.step_size_reliable());
        assert!(chain.mean_accept_stat().is_nan());
        assert!(chain.is_empty());
    }
}
