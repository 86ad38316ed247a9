//! No-U-Turn Sampler (NUTS), Hoffman & Gelman (2014), with multinomial
//! sampling (Betancourt 2017).
//!
//!   - Iterative tree doubling (extend trajectory forward or backward)
//!   - U-turn criterion on every merged subtree and on the whole trajectory
//!   - Multinomial candidate selection weighted by exp(-H)
//!   - Divergence detection via energy error threshold
//!   - Max tree depth cap (default 10)

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::adapt::{AdaptEvent, AdaptationState};
use crate::chain::{Chain, ChainStatus, PosteriorSample};
use crate::config::SamplerConfig;
use crate::error::{ConfigError, Error, Result};
use crate::gradient::LogDensity;
use crate::hmc::{find_reasonable_step_size, leapfrog, PhasePoint};
use crate::progress::ProgressState;

/// Energy error above which a leapfrog step counts as divergent.
pub const MAX_DELTA_H: f64 = 1000.0;

const MAX_INIT_ATTEMPTS: usize = 100;

#[derive(Debug, Clone)]
pub struct NutsConfig {
    /// `None` runs the step-size heuristic from the starting point.
    pub step_size: Option<f64>,
    pub max_tree_depth: usize,
    pub target_accept: f64,
    pub num_draws: usize,
    pub num_tune: usize,
    pub init_jitter: f64,
    pub adapt_mass_matrix: bool,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            step_size: None,
            max_tree_depth: 10,
            target_accept: 0.8,
            num_draws: 1000,
            num_tune: 1000,
            init_jitter: 0.1,
            adapt_mass_matrix: true,
        }
    }
}

impl From<&SamplerConfig> for NutsConfig {
    fn from(config: &SamplerConfig) -> Self {
        Self {
            step_size: config.init_step_size,
            max_tree_depth: config.max_tree_depth,
            target_accept: config.target_accept,
            num_draws: config.num_draws,
            num_tune: config.num_tune,
            init_jitter: config.init_jitter,
            adapt_mass_matrix: config.adapt_mass_matrix,
        }
    }
}

/// Result of building one subtree during the doubling process.
struct TreeResult {
    left: PhasePoint,
    right: PhasePoint,
    /// The candidate sample (multinomial-selected from valid leaves).
    proposal: PhasePoint,
    /// Log of the sum of leaf weights exp(H0 - H).
    log_sum_weight: f64,
    n_leapfrog: usize,
    /// Sum over leaves of min(1, exp(H0 - H)).
    sum_accept: f64,
    turning: bool,
    diverging: bool,
}

/// Outcome of one NUTS transition.
#[derive(Debug, Clone)]
pub struct Transition {
    pub proposal: PhasePoint,
    pub depth: usize,
    pub n_leapfrog: usize,
    pub diverging: bool,
    pub accept_stat: f64,
}

/// Run a single NUTS chain: `num_tune` adaptation iterations (not recorded)
/// followed by `num_draws` recorded iterations with a frozen step size.
///
/// The cancel flag in `progress` is polled once per iteration.
pub fn run_chain<M: LogDensity>(
    target: &mut M,
    config: &NutsConfig,
    chain_id: usize,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
    progress: Option<&ProgressState>,
) -> Result<Chain> {
    let dim = target.dim();
    let total_iters = config.num_tune + config.num_draws;

    let mut current = initial_state(target, config, chain_id, rng, init)?;
    let mut inv_mass = vec![1.0f64; dim];

    let mut step_size = match config.step_size {
        Some(eps) => eps,
        None => find_reasonable_step_size(target, &current, &inv_mass, rng),
    };
    let mut adaptation = AdaptationState::new(
        dim,
        config.num_tune,
        config.target_accept,
        step_size,
        config.adapt_mass_matrix,
    );

    let mut samples = Vec::with_capacity(config.num_draws);
    let mut tune_divergences = 0usize;
    let mut status = ChainStatus::Completed;

    for iter in 0..total_iters {
        let is_tune = iter < config.num_tune;

        if progress.is_some_and(|p| p.is_cancelled()) {
            status = if is_tune {
                ChainStatus::CancelledDuringTuning
            } else {
                ChainStatus::CancelledDuringSampling
            };
            log::warn!(
                "chain {} cancelled at iteration {} ({} draws recorded)",
                chain_id,
                iter,
                samples.len()
            );
            break;
        }

        current.resample_momentum(&inv_mass, rng);
        let h0 = current.energy(&inv_mass);

        let outcome =
            transition(target, &current, step_size, &inv_mass, h0, config.max_tree_depth, rng);

        // A divergent trajectory is rejected as a whole.
        if !outcome.diverging {
            current = outcome.proposal;
        }

        if let Some(p) = progress {
            p.record_iteration(outcome.n_leapfrog, outcome.diverging);
        }

        if is_tune {
            if outcome.diverging {
                tune_divergences += 1;
            }
            let event =
                adaptation.observe(iter, &current.q, outcome.accept_stat, &mut inv_mass);
            if event == AdaptEvent::MassMatrixUpdated {
                let eps = find_reasonable_step_size(target, &current, &inv_mass, rng);
                adaptation.restart_step_size(eps);
            }
            step_size = if iter + 1 == config.num_tune {
                adaptation.final_step_size()
            } else {
                adaptation.step_size()
            };
        } else {
            samples.push(PosteriorSample {
                position: target.constrain(&current.q),
                log_prob: current.logp,
                diverged: outcome.diverging,
                tree_depth: outcome.depth,
                accept_stat: outcome.accept_stat,
                n_leapfrog: outcome.n_leapfrog,
                energy: h0,
            });
        }
    }

    log::debug!(
        "chain {}: step size {:.4e}, {} tuning divergences, {} draws",
        chain_id,
        step_size,
        tune_divergences,
        samples.len()
    );

    Ok(Chain {
        chain_id,
        samples,
        status,
        step_size,
        inv_mass,
        tune_divergences,
        max_tree_depth: config.max_tree_depth,
    })
}

/// Find a starting point with finite log density and gradient.
fn initial_state<M: LogDensity>(
    target: &mut M,
    config: &NutsConfig,
    chain_id: usize,
    rng: &mut ChaCha8Rng,
    init: Option<Vec<f64>>,
) -> Result<PhasePoint> {
    if let Some(q) = init {
        if q.len() != target.dim() {
            return Err(ConfigError::Dimension { expected: target.dim(), got: q.len() }.into());
        }
        return PhasePoint::new(target, q).map_err(|_| Error::InitialPoint(chain_id));
    }
    for _ in 0..MAX_INIT_ATTEMPTS {
        let q = target.initial_point(rng, config.init_jitter);
        if let Ok(point) = PhasePoint::new(target, q) {
            return Ok(point);
        }
    }
    Err(Error::InitialPoint(chain_id))
}

/// One NUTS transition from `initial` (whose momentum is already drawn).
///
/// At each depth j the trajectory gains 2^j leapfrog steps, forward (+ε) or
/// backward (-ε) at random. Growth stops at a U-turn, a divergence or the
/// depth cap. Subtrees that diverged or turned contribute no candidates.
pub fn transition<M: LogDensity>(
    target: &mut M,
    initial: &PhasePoint,
    eps: f64,
    inv_mass: &[f64],
    h0: f64,
    max_depth: usize,
    rng: &mut ChaCha8Rng,
) -> Transition {
    let mut left = initial.clone();
    let mut right = initial.clone();
    let mut proposal = initial.clone();
    // exp(H0 - H(initial)) = 1
    let mut log_sum_weight = 0.0f64;
    let mut depth = 0;
    let mut n_leapfrog = 0;
    let mut sum_accept = 0.0f64;
    let mut diverging = false;

    while depth < max_depth {
        let forward = rng.gen::<bool>();
        let subtree = if forward {
            build_subtree(target, &right, eps, inv_mass, h0, depth, rng)
        } else {
            build_subtree(target, &left, -eps, inv_mass, h0, depth, rng)
        };
        depth += 1;
        n_leapfrog += subtree.n_leapfrog;
        sum_accept += subtree.sum_accept;

        if subtree.diverging {
            diverging = true;
            break;
        }
        if subtree.turning {
            break;
        }

        // Biased progressive sampling: favour the newer subtree.
        let accept_prob = (subtree.log_sum_weight - log_sum_weight).min(0.0).exp();
        if rng.gen::<f64>() < accept_prob {
            proposal = subtree.proposal;
        }
        log_sum_weight = log_sum_exp(log_sum_weight, subtree.log_sum_weight);

        if forward {
            right = subtree.right;
        } else {
            left = subtree.left;
        }

        if check_uturn(&left, &right, inv_mass) {
            break;
        }
    }

    let accept_stat = if n_leapfrog > 0 { sum_accept / n_leapfrog as f64 } else { 0.0 };

    Transition { proposal, depth, n_leapfrog, diverging, accept_stat }
}

/// Recursively build a balanced binary subtree of given depth.
///
/// depth=0: take a single leapfrog step.
/// depth=j: build two subtrees of depth j-1 and combine.
fn build_subtree<M: LogDensity>(
    target: &mut M,
    point: &PhasePoint,
    eps: f64,
    inv_mass: &[f64],
    h0: f64,
    depth: usize,
    rng: &mut ChaCha8Rng,
) -> TreeResult {
    if depth == 0 {
        let next = match leapfrog(target, point, eps, inv_mass) {
            Ok(next) => next,
            Err(_) => return diverged_leaf(point),
        };
        let delta_h = next.energy(inv_mass) - h0;
        if !delta_h.is_finite() || delta_h > MAX_DELTA_H {
            return diverged_leaf(point);
        }
        return TreeResult {
            left: next.clone(),
            right: next.clone(),
            proposal: next,
            log_sum_weight: -delta_h,
            n_leapfrog: 1,
            sum_accept: (-delta_h).min(0.0).exp(),
            turning: false,
            diverging: false,
        };
    }

    let inner = build_subtree(target, point, eps, inv_mass, h0, depth - 1, rng);
    if inner.diverging || inner.turning {
        return inner;
    }

    let start_point = if eps > 0.0 { &inner.right } else { &inner.left };
    let outer = build_subtree(target, start_point, eps, inv_mass, h0, depth - 1, rng);
    let n_leapfrog = inner.n_leapfrog + outer.n_leapfrog;
    let sum_accept = inner.sum_accept + outer.sum_accept;

    if outer.diverging || outer.turning {
        return TreeResult {
            n_leapfrog,
            sum_accept,
            turning: outer.turning,
            diverging: outer.diverging,
            ..inner
        };
    }

    // Uniform progressive sampling within a subtree.
    let log_sum = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
    let accept_outer = (outer.log_sum_weight - log_sum).exp();
    let proposal = if rng.gen::<f64>() < accept_outer { outer.proposal } else { inner.proposal };

    // inner is closer to the start point, outer is farther
    let (left, right) = if eps > 0.0 {
        (inner.left, outer.right)
    } else {
        (outer.left, inner.right)
    };

    let turning = check_uturn(&left, &right, inv_mass);

    TreeResult {
        left,
        right,
        proposal,
        log_sum_weight: log_sum,
        n_leapfrog,
        sum_accept,
        turning,
        diverging: false,
    }
}

fn diverged_leaf(point: &PhasePoint) -> TreeResult {
    TreeResult {
        left: point.clone(),
        right: point.clone(),
        proposal: point.clone(),
        log_sum_weight: f64::NEG_INFINITY,
        n_leapfrog: 1,
        sum_accept: 0.0,
        turning: false,
        diverging: true,
    }
}

/// U-turn check: the trajectory is turning if the momentum at either end
/// would decrease the distance between the endpoints.
///
///   (q_right - q_left) · (M⁻¹ p_left) < 0  OR
///   (q_right - q_left) · (M⁻¹ p_right) < 0
fn check_uturn(left: &PhasePoint, right: &PhasePoint, inv_mass: &[f64]) -> bool {
    let mut dot_left = 0.0f64;
    let mut dot_right = 0.0f64;
    for i in 0..left.q.len() {
        let dq = right.q[i] - left.q[i];
        dot_left += dq * (inv_mass[i] * left.p[i]);
        dot_right += dq * (inv_mass[i] * right.p[i]);
    }
    dot_left < 0.0 || dot_right < 0.0
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NonFiniteDensity;
    use rand::SeedableRng;

    /// Standard normal in `dim` dimensions.
    struct StdNormal {
        dim: usize,
    }

    impl LogDensity for StdNormal {
        fn dim(&self) -> usize {
            self.dim
        }

        fn logp_and_grad(
            &mut self,
            q: &[f64],
            grad: &mut [f64],
        ) -> std::result::Result<f64, NonFiniteDensity> {
            let mut logp = 0.0;
            for (g, &x) in grad.iter_mut().zip(q) {
                logp -= 0.5 * x * x;
                *g = -x;
            }
            Ok(logp)
        }
    }

    /// Standard normal whose density is undefined for x[0] > 1.5.
    struct Truncated;

    impl LogDensity for Truncated {
        fn dim(&self) -> usize {
            2
        }

        fn logp_and_grad(
            &mut self,
            q: &[f64],
            grad: &mut [f64],
        ) -> std::result::Result<f64, NonFiniteDensity> {
            if q[0] > 1.5 {
                return Err(NonFiniteDensity);
            }
            grad[0] = -q[0];
            grad[1] = -q[1];
            Ok(-0.5 * (q[0] * q[0] + q[1] * q[1]))
        }
    }

    fn config(draws: usize, tune: usize) -> NutsConfig {
        NutsConfig { num_draws: draws, num_tune: tune, ..Default::default() }
    }

    fn moments(chain: &Chain, index: usize) -> (f64, f64) {
        let xs = chain.trace(index);
        let n = xs.len() as f64;
        let mean = xs.iter().sum::<f64>() / n;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
        (mean, var)
    }

    #[test]
    fn test_draw_count_is_exact() {
        let mut target = StdNormal { dim: 3 };
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let chain = run_chain(&mut target, &config(137, 50), 0, &mut rng, None, None).unwrap();
        assert_eq!(chain.len(), 137);
        assert_eq!(chain.status, ChainStatus::Completed);
        assert!(chain.samples.iter().all(|s| s.tree_depth >= 1 && s.tree_depth <= 10));
    }

    #[test]
    fn test_standard_normal_moments() {
        for seed in [11u64, 12, 13] {
            let mut target = StdNormal { dim: 4 };
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let chain = run_chain(&mut target, &config(2000, 500), 0, &mut rng, None, None).unwrap();
            for i in 0..4 {
                let (mean, var) = moments(&chain, i);
                assert!(mean.abs() < 0.15, "seed {} coord {} mean {}", seed, i, mean);
                assert!((var - 1.0).abs() < 0.2, "seed {} coord {} var {}", seed, i, var);
            }
            assert_eq!(chain.divergences(), 0);
            let accept = chain.mean_accept_stat();
            assert!(accept > 0.6, "mean accept {}", accept);
        }
    }

    #[test]
    fn test_longer_runs_do_not_shift_mean() {
        let mut target = StdNormal { dim: 2 };
        let mut short_rng = ChaCha8Rng::seed_from_u64(5);
        let short = run_chain(&mut target, &config(1000, 300), 0, &mut short_rng, None, None).unwrap();
        let mut long_rng = ChaCha8Rng::seed_from_u64(6);
        let long = run_chain(&mut target, &config(4000, 300), 0, &mut long_rng, None, None).unwrap();
        let (m_short, _) = moments(&short, 0);
        let (m_long, _) = moments(&long, 0);
        assert!((m_short - m_long).abs() < 0.2, "short {} long {}", m_short, m_long);
    }

    #[test]
    fn test_huge_step_size_diverges_without_nan() {
        let mut target = StdNormal { dim: 2 };
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let cfg = NutsConfig { step_size: Some(1e4), ..config(50, 0) };
        let chain = run_chain(&mut target, &cfg, 0, &mut rng, Some(vec![0.5, -0.5]), None).unwrap();
        assert_eq!(chain.len(), 50);
        let divs = chain.divergences();
        assert!(divs > 0 && divs <= 50, "divergences {}", divs);
        assert!(chain.samples.iter().all(|s| s.position.iter().all(|x| x.is_finite())));
        // Rejected transitions keep the chain at its starting point.
        assert!(chain.samples.iter().all(|s| s.position == vec![0.5, -0.5]));
    }

    #[test]
    fn test_gradient_failure_counts_as_divergence() {
        let mut target = Truncated;
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let cfg = NutsConfig { step_size: Some(0.8), ..config(300, 0) };
        let chain = run_chain(&mut target, &cfg, 0, &mut rng, Some(vec![1.0, 0.0]), None).unwrap();
        assert_eq!(chain.len(), 300);
        assert!(chain.divergences() > 0);
        assert!(chain.samples.iter().all(|s| s.position[0] <= 1.5));
    }

    #[test]
    fn test_adaptation_reaches_target_acceptance() {
        let mut target = StdNormal { dim: 10 };
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let cfg = NutsConfig { target_accept: 0.9, ..config(500, 500) };
        let chain = run_chain(&mut target, &cfg, 0, &mut rng, None, None).unwrap();
        let accept = chain.mean_accept_stat();
        assert!(accept > 0.8 && accept < 0.98, "mean accept {}", accept);
    }

    #[test]
    fn test_cancel_before_start_flags_tuning() {
        let mut target = StdNormal { dim: 2 };
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let progress = ProgressState::new(1, 100, 100);
        progress.cancel();
        let chain =
            run_chain(&mut target, &config(100, 100), 0, &mut rng, None, Some(&progress)).unwrap();
        assert_eq!(chain.status, ChainStatus::CancelledDuringTuning);
        assert!(!chain.step_size_reliable());
        assert!(chain.is_empty());
    }

    #[test]
    fn test_progress_counts_every_iteration() {
        let mut target = StdNormal { dim: 2 };
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let progress = ProgressState::new(1, 40, 20);
        run_chain(&mut target, &config(40, 20), 0, &mut rng, None, Some(&progress)).unwrap();
        assert_eq!(progress.completed.load(std::sync::atomic::Ordering::Relaxed), 60);
    }

    #[test]
    fn test_wrong_init_length_is_config_error() {
        let mut target = StdNormal { dim: 2 };
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let err = run_chain(&mut target, &config(1, 0), 0, &mut rng, Some(vec![0.0]), None);
        assert!(matches!(err, Err(Error::Config(_))));
    }

    #[test]
    fn test_uturn_detection() {
        let p = |q: Vec<f64>, p: Vec<f64>| PhasePoint { grad: vec![0.0; q.len()], q, p, logp: 0.0 };
        let inv_mass = [1.0, 1.0];
        let left = p(vec![0.0, 0.0], vec![1.0, 0.0]);
        let right = p(vec![1.0, 0.0], vec![1.0, 0.0]);
        assert!(!check_uturn(&left, &right, &inv_mass));
        let right_back = p(vec![1.0, 0.0], vec![-1.0, 0.0]);
        assert!(check_uturn(&left, &right_back, &inv_mass));
    }

    #[test]
    fn test_log_sum_exp() {
        assert!((log_sum_exp(0.0, 0.0) - 2f64.ln()).abs() < 1e-12);
        assert_eq!(log_sum_exp(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert!((log_sum_exp(f64::NEG_INFINITY, -1.0) + 1.0).abs() < 1e-12);
    }
}
