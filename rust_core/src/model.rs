//! The latent random-walk factor model.
//!
//! ```text
//! latent[0]  ~ Normal(0, rw_sigma)
//! latent[t]  ~ Normal(latent[t-1], rw_sigma)
//! loading[d] ~ Normal(0, 1)
//! obs_sigma  ~ HalfNormal(1)
//! Y[t, d]    ~ Normal(latent[t] * loading[d], obs_sigma)
//! ```
//!
//! The sampler works on the unconstrained vector
//! `[latent[0..T], loading[0..D], ln(obs_sigma)]`.

use ndarray::{Array1, Array2, ArrayView1, Zip};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

use crate::distributions::{GaussianRandomWalk, HalfNormal, Normal, NEG_HALF_LN_TAU};
use crate::error::ConfigError;

const POWER_ITERATIONS: usize = 100;
const MIN_INIT_SIGMA: f64 = 1e-3;

/// Parameters in model (constrained) space.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameters {
    pub latent: Vec<f64>,
    pub loading: Vec<f64>,
    pub obs_sigma: f64,
}

impl ModelParameters {
    /// Split a flat `[latent.., loading.., obs_sigma]` vector.
    pub fn from_flat(flat: &[f64], n_time: usize, n_series: usize) -> Result<Self, ConfigError> {
        let expected = n_time + n_series + 1;
        if flat.len() != expected {
            return Err(ConfigError::Dimension { expected, got: flat.len() });
        }
        Ok(Self {
            latent: flat[..n_time].to_vec(),
            loading: flat[n_time..n_time + n_series].to_vec(),
            obs_sigma: flat[n_time + n_series],
        })
    }

    pub fn to_flat(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.latent.len() + self.loading.len() + 1);
        flat.extend_from_slice(&self.latent);
        flat.extend_from_slice(&self.loading);
        flat.push(self.obs_sigma);
        flat
    }
}

/// Immutable model definition with the observations bound as data.
///
/// The observation matrix sits behind an `Arc`, so clones are cheap and
/// chains on different threads read the same buffer.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    y: Arc<Array2<f64>>,
    rw_sigma: f64,
}

impl ModelSpec {
    pub fn new(y: Array2<f64>, rw_sigma: f64) -> Result<Self, ConfigError> {
        let (n_time, n_series) = y.dim();
        if n_time == 0 {
            return Err(ConfigError::EmptyTime);
        }
        if n_series == 0 {
            return Err(ConfigError::EmptySeries);
        }
        if !(rw_sigma.is_finite() && rw_sigma > 0.0) {
            return Err(ConfigError::NonPositive { name: "rw_sigma", value: rw_sigma });
        }
        if let Some(((row, col), _)) = y.indexed_iter().find(|(_, v)| !v.is_finite()) {
            return Err(ConfigError::NonFiniteData { row, col });
        }
        Ok(Self { y: Arc::new(y), rw_sigma })
    }

    pub fn y(&self) -> &Array2<f64> {
        &self.y
    }

    pub fn rw_sigma(&self) -> f64 {
        self.rw_sigma
    }

    pub fn n_time(&self) -> usize {
        self.y.nrows()
    }

    pub fn n_series(&self) -> usize {
        self.y.ncols()
    }

    /// Number of continuous parameters, T + D + 1.
    pub fn dim(&self) -> usize {
        self.n_time() + self.n_series() + 1
    }

    /// Index of `ln(obs_sigma)` in the unconstrained vector.
    pub fn sigma_index(&self) -> usize {
        self.n_time() + self.n_series()
    }

    pub fn param_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.dim());
        names.extend((0..self.n_time()).map(|t| format!("latent[{}]", t)));
        names.extend((0..self.n_series()).map(|d| format!("loading[{}]", d)));
        names.push("obs_sigma".to_string());
        names
    }

    /// Joint log density in model space: log prior + log likelihood.
    ///
    /// Returns `-inf` when `obs_sigma <= 0`.
    pub fn log_joint(&self, params: &ModelParameters) -> Result<f64, ConfigError> {
        self.check_shapes(params)?;
        if !(params.obs_sigma > 0.0) {
            return Ok(f64::NEG_INFINITY);
        }
        let ln_sigma = params.obs_sigma.ln();
        let mut resid = Array2::zeros(self.y.dim());
        let ss = self.residuals_into(&params.latent, &params.loading, &mut resid);

        let log_prior = GaussianRandomWalk::logp(&params.latent, self.rw_sigma)
            + params.loading.iter().map(|&w| Normal::logp(w, 0.0, 1.0)).sum::<f64>()
            + HalfNormal::logp(params.obs_sigma, 1.0);
        Ok(log_prior + self.log_likelihood_from_ss(ss, ln_sigma))
    }

    /// Map model-space parameters to the sampler's unconstrained vector.
    pub fn to_unconstrained(&self, params: &ModelParameters) -> Result<Vec<f64>, ConfigError> {
        self.check_shapes(params)?;
        let mut q = params.to_flat();
        let i = self.sigma_index();
        q[i] = q[i].ln();
        Ok(q)
    }

    /// Map an unconstrained vector back to model space.
    pub fn to_constrained(&self, q: &[f64]) -> Result<ModelParameters, ConfigError> {
        let mut params = ModelParameters::from_flat(q, self.n_time(), self.n_series())?;
        params.obs_sigma = params.obs_sigma.exp();
        Ok(params)
    }

    /// Data-informed starting point in unconstrained space.
    ///
    /// Rank-one fit of Y by power iteration, loading scaled to norm sqrt(D)
    /// and signed so that the loadings sum to a non-negative value. Every
    /// chain starts in the same sign mode of the likelihood.
    pub fn initial_point(&self) -> Vec<f64> {
        let (n_time, n_series) = self.y.dim();
        let mut v = Array1::from_elem(n_series, 1.0 / (n_series as f64).sqrt());
        let mut u = Array1::zeros(n_time);
        let mut s = 0.0;
        for _ in 0..POWER_ITERATIONS {
            u = self.y.dot(&v);
            let u_norm = u.dot(&u).sqrt();
            if u_norm <= f64::EPSILON {
                s = 0.0;
                break;
            }
            u /= u_norm;
            v = self.y.t().dot(&u);
            s = v.dot(&v).sqrt();
            if s <= f64::EPSILON {
                break;
            }
            v /= s;
        }

        let (latent, loading) = if s > f64::EPSILON {
            let scale = (n_series as f64).sqrt();
            let sign = if v.sum() < 0.0 { -1.0 } else { 1.0 };
            let latent: Vec<f64> = u.iter().map(|&x| sign * s * x / scale).collect();
            let loading: Vec<f64> = v.iter().map(|&x| sign * x * scale).collect();
            (latent, loading)
        } else {
            (vec![0.0; n_time], vec![0.0; n_series])
        };

        let mut resid = Array2::zeros(self.y.dim());
        let ss = self.residuals_into(&latent, &loading, &mut resid);
        let rms = (ss / self.y.len() as f64).sqrt();
        let obs_sigma = if rms.is_finite() { rms.max(MIN_INIT_SIGMA) } else { 1.0 };

        let mut q = Vec::with_capacity(self.dim());
        q.extend_from_slice(&latent);
        q.extend_from_slice(&loading);
        q.push(obs_sigma.ln());
        q
    }

    /// `initial_point` plus independent `Uniform(-jitter, jitter)` noise per coordinate.
    pub fn jittered_initial_point(&self, rng: &mut ChaCha8Rng, jitter: f64) -> Vec<f64> {
        let mut q = self.initial_point();
        if jitter > 0.0 {
            for qi in &mut q {
                *qi += rng.gen_range(-jitter..jitter);
            }
        }
        q
    }

    /// Fill `resid` with `Y - latent ⊗ loading` and return its sum of squares.
    pub(crate) fn residuals_into(
        &self,
        latent: &[f64],
        loading: &[f64],
        resid: &mut Array2<f64>,
    ) -> f64 {
        assert_eq!(resid.dim(), self.y.dim(), "residual buffer has wrong shape");
        let latent = ArrayView1::from(latent);
        let loading = ArrayView1::from(loading);
        assert_eq!(latent.len(), self.n_time(), "latent length mismatch");
        assert_eq!(loading.len(), self.n_series(), "loading length mismatch");

        let mut ss = 0.0;
        Zip::indexed(resid.view_mut()).and(self.y.view()).for_each(|(t, d), r, &y| {
            *r = y - latent[t] * loading[d];
            ss += *r * *r;
        });
        ss
    }

    /// `N * (-0.5 ln 2π - ln σ) - 0.5 * SS / σ²`, with `1/σ²` taken as `exp(-2 ln σ)`.
    pub(crate) fn log_likelihood_from_ss(&self, ss: f64, ln_sigma: f64) -> f64 {
        let n_obs = self.y.len() as f64;
        n_obs * (NEG_HALF_LN_TAU - ln_sigma) - 0.5 * ss * (-2.0 * ln_sigma).exp()
    }

    fn check_shapes(&self, params: &ModelParameters) -> Result<(), ConfigError> {
        let got = params.latent.len() + params.loading.len() + 1;
        if params.latent.len() != self.n_time() || params.loading.len() != self.n_series() {
            return Err(ConfigError::Dimension { expected: self.dim(), got });
        }
        Ok(())
    }
}
