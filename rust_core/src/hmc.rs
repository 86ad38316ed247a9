//! Hamiltonian dynamics: phase points and the leapfrog integrator.

use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::NonFiniteDensity;
use crate::gradient::LogDensity;

/// A point on the Hamiltonian trajectory: (position, momentum, gradient, log-probability).
#[derive(Debug, Clone)]
pub struct PhasePoint {
    pub q: Vec<f64>,
    pub p: Vec<f64>,
    pub grad: Vec<f64>,
    pub logp: f64,
}

impl PhasePoint {
    /// Evaluate the target at `q` with zero momentum.
    pub fn new<M: LogDensity>(target: &mut M, q: Vec<f64>) -> Result<Self, NonFiniteDensity> {
        let mut grad = vec![0.0; q.len()];
        let logp = target.logp_and_grad(&q, &mut grad)?;
        Ok(Self { p: vec![0.0; q.len()], q, grad, logp })
    }

    pub fn kinetic_energy(&self, inv_mass: &[f64]) -> f64 {
        self.p
            .iter()
            .zip(inv_mass.iter())
            .map(|(&pi, &im)| 0.5 * pi * pi * im)
            .sum()
    }

    /// Hamiltonian `-logp + ½ pᵀ M⁻¹ p`.
    pub fn energy(&self, inv_mass: &[f64]) -> f64 {
        -self.logp + self.kinetic_energy(inv_mass)
    }

    /// Draw momentum `p ~ N(0, M)` with `M = diag(1 / inv_mass)`.
    pub fn resample_momentum(&mut self, inv_mass: &[f64], rng: &mut ChaCha8Rng) {
        for (pi, &im) in self.p.iter_mut().zip(inv_mass.iter()) {
            let z: f64 = StandardNormal.sample(rng);
            *pi = z / im.sqrt();
        }
    }
}

/// Single leapfrog step (half-step momentum, full-step position, half-step momentum).
///
/// A negative `eps` integrates backward in time.
pub fn leapfrog<M: LogDensity>(
    target: &mut M,
    point: &PhasePoint,
    eps: f64,
    inv_mass: &[f64],
) -> Result<PhasePoint, NonFiniteDensity> {
    let dim = point.q.len();
    let mut p_new = vec![0.0; dim];
    let mut q_new = vec![0.0; dim];

    for i in 0..dim {
        p_new[i] = point.p[i] + 0.5 * eps * point.grad[i];
    }
    for i in 0..dim {
        q_new[i] = point.q[i] + eps * inv_mass[i] * p_new[i];
    }
    let mut grad_new = vec![0.0; dim];
    let logp_new = target.logp_and_grad(&q_new, &mut grad_new)?;
    for i in 0..dim {
        p_new[i] += 0.5 * eps * grad_new[i];
    }

    Ok(PhasePoint { q: q_new, p: p_new, grad: grad_new, logp: logp_new })
}

/// Run `n_steps` leapfrog steps from `start`.
pub fn integrate<M: LogDensity>(
    target: &mut M,
    start: &PhasePoint,
    eps: f64,
    n_steps: usize,
    inv_mass: &[f64],
) -> Result<PhasePoint, NonFiniteDensity> {
    let mut point = start.clone();
    for _ in 0..n_steps {
        point = leapfrog(target, &point, eps, inv_mass)?;
    }
    Ok(point)
}

/// Heuristic initial step size (Hoffman & Gelman 2014, Algorithm 4).
///
/// Doubles or halves `eps` until the one-step acceptance ratio crosses ½.
pub fn find_reasonable_step_size<M: LogDensity>(
    target: &mut M,
    start: &PhasePoint,
    inv_mass: &[f64],
    rng: &mut ChaCha8Rng,
) -> f64 {
    let mut initial = start.clone();
    initial.resample_momentum(inv_mass, rng);
    let h0 = initial.energy(inv_mass);
    let log_half = 0.5_f64.ln();

    let mut eps = 1.0;
    let log_ratio = |target: &mut M, eps: f64| -> f64 {
        match leapfrog(target, &initial, eps, inv_mass) {
            Ok(next) => h0 - next.energy(inv_mass),
            Err(NonFiniteDensity) => f64::NEG_INFINITY,
        }
    };

    let first = log_ratio(target, eps);
    let direction = if first.is_finite() && first > log_half { 1.0 } else { -1.0 };

    for _ in 0..50 {
        let lr = log_ratio(target, eps);
        if direction > 0.0 && !(lr > log_half) {
            break;
        }
        if direction < 0.0 && lr.is_finite() && lr > log_half {
            break;
        }
        eps *= 2.0_f64.powf(direction);
    }

    eps.clamp(1e-10, 1e3)
}
