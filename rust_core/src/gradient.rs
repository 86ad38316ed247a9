use ndarray::{Array2, ArrayView1};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::distributions::{GaussianRandomWalk, HalfNormal, Normal};
use crate::error::NonFiniteDensity;
use crate::model::ModelSpec;

/// A differentiable log density over an unconstrained vector.
///
/// Implementors may keep scratch buffers, hence `&mut self`. Each chain owns
/// its own instance.
pub trait LogDensity {
    fn dim(&self) -> usize;

    /// Write the gradient into `grad` and return the log density.
    ///
    /// A non-finite log density or gradient entry is reported as
    /// `Err(NonFiniteDensity)`; the contents of `grad` are then unspecified.
    fn logp_and_grad(&mut self, q: &[f64], grad: &mut [f64]) -> Result<f64, NonFiniteDensity>;

    fn param_names(&self) -> Vec<String> {
        (0..self.dim()).map(|i| format!("x[{}]", i)).collect()
    }

    /// Map an unconstrained position to the values recorded in a draw.
    fn constrain(&self, q: &[f64]) -> Vec<f64> {
        q.to_vec()
    }

    /// Starting position for a chain.
    fn initial_point(&self, rng: &mut ChaCha8Rng, jitter: f64) -> Vec<f64> {
        (0..self.dim())
            .map(|_| if jitter > 0.0 { rng.gen_range(-jitter..jitter) } else { 0.0 })
            .collect()
    }
}

/// Closed-form log density and gradient of [`ModelSpec`] in unconstrained space.
///
/// Holds a T×D residual buffer that is reused across evaluations.
pub struct GradientEngine<'a> {
    model: &'a ModelSpec,
    resid: Array2<f64>,
}

impl<'a> GradientEngine<'a> {
    pub fn new(model: &'a ModelSpec) -> Self {
        Self { model, resid: Array2::zeros(model.y().dim()) }
    }

    pub fn model(&self) -> &ModelSpec {
        self.model
    }

    /// Log joint (including the `ln(obs_sigma)` Jacobian) without the gradient.
    pub fn logp(&mut self, q: &[f64]) -> f64 {
        let (latent, loading, ln_sigma) = self.split(q);
        let ss = self.model.residuals_into(latent, loading, &mut self.resid);
        self.log_prior(latent, loading, ln_sigma).0 + self.model.log_likelihood_from_ss(ss, ln_sigma)
    }

    fn split<'q>(&self, q: &'q [f64]) -> (&'q [f64], &'q [f64], f64) {
        let n_time = self.model.n_time();
        let n_series = self.model.n_series();
        (&q[..n_time], &q[n_time..n_time + n_series], q[n_time + n_series])
    }

    /// Prior terms and the HalfNormal derivative w.r.t. `ln(obs_sigma)`.
    fn log_prior(&self, latent: &[f64], loading: &[f64], ln_sigma: f64) -> (f64, f64) {
        let (lp_sigma, dsigma) = HalfNormal::logp_log_transformed(ln_sigma, 1.0);
        let lp = GaussianRandomWalk::logp(latent, self.model.rw_sigma())
            + loading.iter().map(|&w| Normal::logp(w, 0.0, 1.0)).sum::<f64>()
            + lp_sigma;
        (lp, dsigma)
    }
}

impl LogDensity for GradientEngine<'_> {
    fn dim(&self) -> usize {
        self.model.dim()
    }

    fn logp_and_grad(&mut self, q: &[f64], grad: &mut [f64]) -> Result<f64, NonFiniteDensity> {
        debug_assert_eq!(q.len(), self.dim());
        debug_assert_eq!(grad.len(), self.dim());
        let n_time = self.model.n_time();
        let n_series = self.model.n_series();
        let (latent, loading, ln_sigma) = self.split(q);

        let ss = self.model.residuals_into(latent, loading, &mut self.resid);
        let inv_s2 = (-2.0 * ln_sigma).exp();
        let (log_prior, dprior_sigma) = self.log_prior(latent, loading, ln_sigma);
        let logp = log_prior + self.model.log_likelihood_from_ss(ss, ln_sigma);
        if !logp.is_finite() {
            return Err(NonFiniteDensity);
        }

        let (grad_latent, rest) = grad.split_at_mut(n_time);
        let (grad_loading, grad_sigma) = rest.split_at_mut(n_series);

        // Likelihood: R · loading / σ² and Rᵀ · latent / σ².
        let from_lik_latent = self.resid.dot(&ArrayView1::from(loading));
        let from_lik_loading = self.resid.t().dot(&ArrayView1::from(latent));

        for (g, l) in grad_latent.iter_mut().zip(from_lik_latent.iter()) {
            *g = l * inv_s2;
        }
        GaussianRandomWalk::accumulate_grad(latent, self.model.rw_sigma(), grad_latent);

        for ((g, l), &w) in grad_loading.iter_mut().zip(from_lik_loading.iter()).zip(loading) {
            *g = l * inv_s2 + Normal::dlogp_dx(w, 0.0, 1.0);
        }

        let n_obs = (n_time * n_series) as f64;
        grad_sigma[0] = -n_obs + ss * inv_s2 + dprior_sigma;

        if grad.iter().all(|g| g.is_finite()) {
            Ok(logp)
        } else {
            Err(NonFiniteDensity)
        }
    }

    fn param_names(&self) -> Vec<String> {
        self.model.param_names()
    }

    fn constrain(&self, q: &[f64]) -> Vec<f64> {
        let mut x = q.to_vec();
        let i = self.model.sigma_index();
        x[i] = x[i].exp();
        x
    }

    fn initial_point(&self, rng: &mut ChaCha8Rng, jitter: f64) -> Vec<f64> {
        self.model.jittered_initial_point(rng, jitter)
    }
}
