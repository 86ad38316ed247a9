//! Warmup adaptation: dual-averaging step size and diagonal mass matrix.
//!
//! Schedule over `n_tune` iterations:
//!   Phase 1 (first 15%): step size only, identity mass matrix
//!   Phase 2 (15%..90%): also collect positions for the variance estimate
//!   Phase 3 (last 10%): step size again, with the adapted mass matrix

const PHASE1_FRACTION: usize = 15;
const PHASE2_FRACTION: usize = 90;
const MIN_WINDOW_DRAWS: usize = 10;

/// Dual averaging for step size adaptation (Nesterov 2009, Stan variant).
#[derive(Debug, Clone)]
pub struct DualAveraging {
    target_accept: f64,
    log_eps: f64,
    /// Smoothed iterate, `x_bar` in Hoffman & Gelman.
    log_eps_bar: f64,
    h_bar: f64,
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    step: usize,
}

impl DualAveraging {
    pub fn new(target_accept: f64, init_eps: f64) -> Self {
        let log_eps0 = init_eps.ln();
        Self {
            target_accept,
            log_eps: log_eps0,
            log_eps_bar: log_eps0,
            h_bar: 0.0,
            mu: (10.0 * init_eps).ln(),
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            step: 0,
        }
    }

    /// Update with the mean acceptance statistic of one transition.
    pub fn update(&mut self, accept_stat: f64) {
        self.step += 1;
        let m = self.step as f64;
        let w = 1.0 / (m + self.t0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target_accept - accept_stat);
        self.log_eps = self.mu - (m.sqrt() / self.gamma) * self.h_bar;
        let m_pow = m.powf(-self.kappa);
        self.log_eps_bar = m_pow * self.log_eps + (1.0 - m_pow) * self.log_eps_bar;
    }

    /// Step size to use for the next warmup transition.
    pub fn current_step_size(&self) -> f64 {
        self.log_eps.exp()
    }

    /// Smoothed step size, frozen for sampling.
    pub fn adapted_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }

    pub fn h_bar(&self) -> f64 {
        self.h_bar
    }

    pub fn iterations(&self) -> usize {
        self.step
    }

    /// Restart the averages around a new initial step size.
    pub fn reset(&mut self, init_eps: f64) {
        *self = Self::new(self.target_accept, init_eps);
    }
}

/// Online Welford variance estimator (diagonal mass matrix).
#[derive(Debug, Clone)]
pub struct WelfordVariance {
    mean: Vec<f64>,
    m2: Vec<f64>,
    count: usize,
}

impl WelfordVariance {
    pub fn new(dim: usize) -> Self {
        Self { mean: vec![0.0; dim], m2: vec![0.0; dim], count: 0 }
    }

    pub fn update(&mut self, x: &[f64]) {
        self.count += 1;
        let n = self.count as f64;
        for i in 0..x.len() {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x[i] - self.mean[i]);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Sample variance, regularized toward 1e-3 like Stan for small windows.
    pub fn regularized_variance(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![1.0; self.mean.len()];
        }
        let n = self.count as f64;
        let shrink = n / (n + 5.0);
        self.m2
            .iter()
            .map(|&m| (shrink * m / (n - 1.0) + 1e-3 * (1.0 - shrink)).max(1e-10))
            .collect()
    }
}

/// What the chain should do after an adaptation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptEvent {
    None,
    /// The inverse mass matrix changed; the caller re-initializes the step size
    /// and passes it to [`AdaptationState::restart_step_size`].
    MassMatrixUpdated,
}

/// Per-chain warmup state, discarded once tuning ends.
#[derive(Debug, Clone)]
pub struct AdaptationState {
    dual: DualAveraging,
    variance: WelfordVariance,
    adapt_mass_matrix: bool,
    phase1_end: usize,
    phase2_end: usize,
}

impl AdaptationState {
    pub fn new(
        dim: usize,
        n_tune: usize,
        target_accept: f64,
        init_eps: f64,
        adapt_mass_matrix: bool,
    ) -> Self {
        Self {
            dual: DualAveraging::new(target_accept, init_eps),
            variance: WelfordVariance::new(dim),
            adapt_mass_matrix,
            phase1_end: n_tune * PHASE1_FRACTION / 100,
            phase2_end: n_tune * PHASE2_FRACTION / 100,
        }
    }

    pub fn step_size(&self) -> f64 {
        self.dual.current_step_size()
    }

    pub fn final_step_size(&self) -> f64 {
        self.dual.adapted_step_size()
    }

    /// Record warmup iteration `iter` (0-based) that ended at `q` with the
    /// given acceptance statistic. May overwrite `inv_mass`.
    pub fn observe(
        &mut self,
        iter: usize,
        q: &[f64],
        accept_stat: f64,
        inv_mass: &mut [f64],
    ) -> AdaptEvent {
        self.dual.update(accept_stat);

        if !self.adapt_mass_matrix {
            return AdaptEvent::None;
        }
        if iter >= self.phase1_end && iter < self.phase2_end {
            self.variance.update(q);
        }
        if iter + 1 == self.phase2_end && self.variance.count() > MIN_WINDOW_DRAWS {
            for (m, v) in inv_mass.iter_mut().zip(self.variance.regularized_variance()) {
                *m = v;
            }
            return AdaptEvent::MassMatrixUpdated;
        }
        AdaptEvent::None
    }

    pub fn restart_step_size(&mut self, init_eps: f64) {
        self.dual.reset(init_eps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_dual_averaging_shrinks_on_low_acceptance() {
        let mut da = DualAveraging::new(0.8, 1.0);
        for _ in 0..50 {
            da.update(0.1);
        }
        assert!(da.current_step_size() < 1.0);
        assert!(da.adapted_step_size() < 1.0);
        assert!(da.h_bar() > 0.0);
    }

    #[test]
    fn test_dual_averaging_grows_on_high_acceptance() {
        let mut da = DualAveraging::new(0.8, 0.01);
        for _ in 0..50 {
            da.update(1.0);
        }
        assert!(da.adapted_step_size() > 0.01);
        assert_eq!(da.iterations(), 50);
    }

    #[test]
    fn test_dual_averaging_converges_to_target() {
        // Toy acceptance curve: accept = exp(-eps), target 0.8 ⇒ eps* = -ln 0.8.
        let mut da = DualAveraging::new(0.8, 1.0);
        for _ in 0..2000 {
            let eps = da.current_step_size();
            da.update((-eps).exp());
        }
        assert_abs_diff_eq!(da.adapted_step_size(), -(0.8_f64.ln()), epsilon = 0.03);
    }

    #[test]
    fn test_welford_matches_two_pass() {
        let xs = [[1.0, 10.0], [2.0, 12.0], [4.0, 11.0], [7.0, 9.0]];
        let mut w = WelfordVariance::new(2);
        for x in &xs {
            w.update(x);
        }
        let n = xs.len() as f64;
        let mean0 = xs.iter().map(|x| x[0]).sum::<f64>() / n;
        let var0 = xs.iter().map(|x| (x[0] - mean0).powi(2)).sum::<f64>() / (n - 1.0);
        let shrink = n / (n + 5.0);
        let expected = shrink * var0 + 1e-3 * (1.0 - shrink);
        assert_abs_diff_eq!(w.regularized_variance()[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn test_mass_matrix_updates_once_at_window_end() {
        let mut state = AdaptationState::new(1, 100, 0.8, 0.5, true);
        let mut inv_mass = vec![1.0];
        let mut events = Vec::new();
        for iter in 0..100 {
            let q = [if iter % 2 == 0 { 3.0 } else { -3.0 }];
            events.push(state.observe(iter, &q, 0.8, &mut inv_mass));
        }
        let updates: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| **e == AdaptEvent::MassMatrixUpdated)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(updates, vec![89]);
        assert!(inv_mass[0] > 5.0, "variance estimate {}", inv_mass[0]);
    }

    #[test]
    fn test_no_mass_matrix_when_disabled() {
        let mut state = AdaptationState::new(2, 100, 0.8, 0.5, false);
        let mut inv_mass = vec![1.0, 1.0];
        for iter in 0..100 {
            assert_eq!(state.observe(iter, &[iter as f64, 0.0], 0.8, &mut inv_mass), AdaptEvent::None);
        }
        assert_eq!(inv_mass, vec![1.0, 1.0]);
    }
}
