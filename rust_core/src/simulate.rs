use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, StandardNormal};
use std::f64::consts::TAU;

use crate::error::ConfigError;

/// RNG stream reserved for the simulator. Sampler chains use streams 1, 2, ...
pub const SIMULATOR_STREAM: u64 = 0;

/// Synthetic dataset: a known latent path driving `D` observed series.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedData {
    /// Time index 0..T as floats, for plotting.
    pub t: Vec<f64>,
    pub latent_true: Vec<f64>,
    /// True factor loadings, one per series.
    pub loading: Vec<f64>,
    /// Observations, shape (T, D).
    pub y: Array2<f64>,
}

/// Deterministic latent signal `0.8 sin(2πt/30) + 0.3 cos(2πt/12)`.
pub fn latent_signal(n_time: usize) -> Vec<f64> {
    (0..n_time)
        .map(|t| {
            let t = t as f64;
            0.8 * (TAU * t / 30.0).sin() + 0.3 * (TAU * t / 12.0).cos()
        })
        .collect()
}

/// Simulate `Y[t, d] = latent[t] * w[d] + Normal(0, sigma)` with `w ~ Normal(0, 1)`.
///
/// Loadings are drawn first, then the noise in row-major order, from a
/// ChaCha8 stream seeded by `seed`. Same inputs give bit-identical output.
pub fn simulate(
    n_time: usize,
    n_series: usize,
    sigma: f64,
    seed: u64,
) -> Result<SimulatedData, ConfigError> {
    if n_time == 0 {
        return Err(ConfigError::EmptyTime);
    }
    if n_series == 0 {
        return Err(ConfigError::EmptySeries);
    }
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(ConfigError::NonPositive { name: "sigma", value: sigma });
    }
    let noise = Normal::new(0.0, sigma)
        .map_err(|_| ConfigError::NonPositive { name: "sigma", value: sigma })?;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(SIMULATOR_STREAM);

    let latent_true = latent_signal(n_time);
    let loading: Vec<f64> = (0..n_series).map(|_| StandardNormal.sample(&mut rng)).collect();

    let mut y = Array2::<f64>::zeros((n_time, n_series));
    for ((t, d), value) in y.indexed_iter_mut() {
        *value = latent_true[t] * loading[d] + noise.sample(&mut rng);
    }

    Ok(SimulatedData {
        t: (0..n_time).map(|t| t as f64).collect(),
        latent_true,
        loading,
        y,
    })
}
