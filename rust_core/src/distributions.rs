//! Scalar log densities used by the latent factor model, each paired with
//! the partial derivatives the gradient engine needs.

use std::f64::consts::LN_2;

/// `-0.5 * ln(2π)`
pub const NEG_HALF_LN_TAU: f64 = -0.918_938_533_204_672_8;

// ── Normal (unconstrained) ──────────────────────────────────────────

pub struct Normal;

impl Normal {
    pub fn logp(x: f64, mu: f64, sigma: f64) -> f64 {
        let z = (x - mu) / sigma;
        -0.5 * z * z - sigma.ln() + NEG_HALF_LN_TAU
    }

    /// d logp / d x. The derivative w.r.t. `mu` is the negation.
    pub fn dlogp_dx(x: f64, mu: f64, sigma: f64) -> f64 {
        -(x - mu) / (sigma * sigma)
    }
}

// ── HalfNormal (x > 0, log-transform) ──────────────────────────────

pub struct HalfNormal;

impl HalfNormal {
    /// Density on x >= 0. Returns -inf for negative `x`.
    pub fn logp(x: f64, sigma: f64) -> f64 {
        if x < 0.0 {
            return f64::NEG_INFINITY;
        }
        let z = x / sigma;
        LN_2 - sigma.ln() + NEG_HALF_LN_TAU - 0.5 * z * z
    }

    /// Log density of `raw = ln(x)` including the Jacobian `ln|dx/draw| = raw`,
    /// together with its derivative w.r.t. `raw`.
    pub fn logp_log_transformed(raw: f64, sigma: f64) -> (f64, f64) {
        let x = raw.exp();
        let z = x / sigma;
        let logp = Self::logp(x, sigma) + raw;
        (logp, 1.0 - z * z)
    }
}

// ── Gaussian random walk ────────────────────────────────────────────

/// `path[0] ~ Normal(0, sigma)`, `path[i] ~ Normal(path[i-1], sigma)`.
pub struct GaussianRandomWalk;

impl GaussianRandomWalk {
    pub fn logp(path: &[f64], sigma: f64) -> f64 {
        if path.is_empty() {
            return 0.0;
        }
        let inv_s2 = 1.0 / (sigma * sigma);
        let mut ss = path[0] * path[0];
        for w in path.windows(2) {
            let step = w[1] - w[0];
            ss += step * step;
        }
        let n = path.len() as f64;
        n * (NEG_HALF_LN_TAU - sigma.ln()) - 0.5 * ss * inv_s2
    }

    /// Add d logp / d path[i] into `grad`.
    ///
    /// Each element is pulled toward its predecessor and, except for the
    /// last one, toward its successor.
    pub fn accumulate_grad(path: &[f64], sigma: f64, grad: &mut [f64]) {
        debug_assert_eq!(path.len(), grad.len());
        if path.is_empty() {
            return;
        }
        let inv_s2 = 1.0 / (sigma * sigma);
        grad[0] -= path[0] * inv_s2;
        for i in 1..path.len() {
            let step = (path[i] - path[i - 1]) * inv_s2;
            grad[i] -= step;
            grad[i - 1] += step;
        }
    }
}
