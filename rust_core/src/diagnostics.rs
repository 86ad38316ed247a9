/// MCMC diagnostic computations: R-hat, ESS, HDI, divergence statistics.
///
/// All algorithms follow the definitions in:
///   Vehtari et al. (2021) "Rank-normalization, folding, and localization:
///   An improved R-hat for assessing convergence of MCMC"
use thiserror::Error;

use crate::chain::{Chain, ChainStatus};
use crate::sampler::SampleResult;
use crate::summary::hdi;

/// R-hat above this value means the chains disagree.
pub const R_HAT_THRESHOLD: f64 = 1.05;
/// Divergent fraction of post-warmup draws that triggers a warning.
pub const DIVERGENCE_RATE_THRESHOLD: f64 = 0.01;
/// Minimum useful ESS per chain.
pub const MIN_ESS_PER_CHAIN: f64 = 100.0;

/// A non-fatal problem found after sampling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DiagnosticWarning {
    #[error("R-hat up to {max_r_hat:.3} ({parameter}) > 1.05: chains may not have converged")]
    NonConvergence { parameter: String, max_r_hat: f64 },

    #[error("{count} divergent transitions ({:.1}% of draws): results may be unreliable", .rate * 100.0)]
    Divergences { count: usize, rate: f64 },

    #[error("chain {chain} was cancelled during tuning: its step size is unreliable")]
    UnreliableStepSize { chain: usize },

    #[error("{count} draws of chain {chain} hit the maximum tree depth {max_tree_depth}: consider a larger max_tree_depth")]
    TreeDepthSaturated { chain: usize, count: usize, max_tree_depth: usize },

    #[error("minimum ESS {min_ess:.0} ({parameter}) is low: consider more draws")]
    LowEss { parameter: String, min_ess: f64 },
}

/// Per-parameter diagnostic summary.
#[derive(Debug, Clone)]
pub struct ParamDiagnostics {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub hdi_lower: f64,
    pub hdi_upper: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
    pub r_hat: f64,
}

/// Per-chain sampler statistics.
#[derive(Debug, Clone)]
pub struct ChainDiagnostics {
    pub chain_id: usize,
    pub draws: usize,
    pub divergences: usize,
    pub tune_divergences: usize,
    /// Draws that stopped at the tree-depth cap.
    pub depth_saturated: usize,
    pub max_tree_depth: usize,
    pub step_size: f64,
    pub accept_rate: f64,
    pub mean_tree_depth: f64,
    pub status: ChainStatus,
}

/// Full diagnostic report for a sampling run.
#[derive(Debug, Clone)]
pub struct DiagnosticsReport {
    pub params: Vec<ParamDiagnostics>,
    pub chains: Vec<ChainDiagnostics>,
    pub hdi_prob: f64,
    pub warnings: Vec<DiagnosticWarning>,
}

impl DiagnosticsReport {
    pub fn divergences(&self) -> usize {
        self.chains.iter().map(|c| c.divergences).sum()
    }

    pub fn max_r_hat(&self) -> f64 {
        self.params.iter().map(|p| p.r_hat).filter(|r| r.is_finite()).fold(f64::NAN, f64::max)
    }

    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Render the diagnostics as a formatted table string.
    pub fn to_table(&self) -> String {
        let mut lines = Vec::new();
        let draws: Vec<String> = self.chains.iter().map(|c| c.draws.to_string()).collect();
        lines.push(format!("{} chains × [{}] draws", self.chains.len(), draws.join(", ")));
        lines.push(String::new());

        let lo_label = format!("hdi_{:.0}%", (1.0 - self.hdi_prob) * 50.0);
        let hi_label = format!("hdi_{:.0}%", 100.0 - (1.0 - self.hdi_prob) * 50.0);
        lines.push(format!(
            "{:<12} {:>8} {:>8} {:>10} {:>10} {:>10} {:>10} {:>8}",
            "Parameter", "mean", "std", lo_label, hi_label, "ess_bulk", "ess_tail", "r_hat"
        ));
        lines.push("─".repeat(84));

        for p in &self.params {
            lines.push(format!(
                "{:<12} {:>8.4} {:>8.4} {:>10.4} {:>10.4} {:>10} {:>10} {:>8.4}",
                p.name,
                p.mean,
                p.std,
                p.hdi_lower,
                p.hdi_upper,
                fmt_ess(p.ess_bulk),
                fmt_ess(p.ess_tail),
                p.r_hat,
            ));
        }

        lines.push("─".repeat(84));
        for c in &self.chains {
            lines.push(format!(
                "chain {}: step size {:.4}  │  accept {:.2}  │  tree depth {:.1}  │  divergences {}",
                c.chain_id, c.step_size, c.accept_rate, c.mean_tree_depth, c.divergences
            ));
        }
        for w in &self.warnings {
            lines.push(format!("⚠  {}", w));
        }

        lines.join("\n")
    }
}

fn fmt_ess(ess: f64) -> String {
    if ess.is_finite() {
        format!("{:.0}", ess)
    } else {
        "NaN".to_string()
    }
}

/// Compute diagnostics for every parameter and chain of `result`, and log
/// each warning.
pub fn compute_diagnostics(result: &SampleResult, hdi_prob: f64) -> DiagnosticsReport {
    let min_len = result.chains.iter().map(Chain::len).min().unwrap_or(0);
    let mut params = Vec::with_capacity(result.param_names.len());

    for (pidx, name) in result.param_names.iter().enumerate() {
        // Equal-length traces for the between-chain statistics.
        let chains: Vec<Vec<f64>> = result
            .chains
            .iter()
            .map(|c| c.samples[..min_len].iter().map(|s| s.position[pidx]).collect())
            .collect();
        let all: Vec<f64> =
            result.chains.iter().flat_map(|c| c.samples.iter().map(move |s| s.position[pidx])).collect();

        let mean = mean(&all);
        let std = std_dev(&all, mean);
        let (hdi_lower, hdi_upper) = hdi(&all, hdi_prob);

        params.push(ParamDiagnostics {
            name: name.clone(),
            mean,
            std,
            hdi_lower,
            hdi_upper,
            ess_bulk: ess_bulk_chains(&chains),
            ess_tail: ess_tail_chains(&chains),
            r_hat: r_hat_rank_normalized(&chains),
        });
    }

    let chains: Vec<ChainDiagnostics> = result
        .chains
        .iter()
        .map(|c| ChainDiagnostics {
            chain_id: c.chain_id,
            draws: c.len(),
            divergences: c.divergences(),
            tune_divergences: c.tune_divergences,
            depth_saturated: c.depth_saturated(),
            max_tree_depth: c.max_tree_depth,
            step_size: c.step_size,
            accept_rate: c.mean_accept_stat(),
            mean_tree_depth: c.mean_tree_depth(),
            status: c.status,
        })
        .collect();

    let warnings = collect_warnings(&params, &chains, min_len);
    for w in &warnings {
        log::warn!("{}", w);
    }

    DiagnosticsReport { params, chains, hdi_prob, warnings }
}

fn collect_warnings(
    params: &[ParamDiagnostics],
    chains: &[ChainDiagnostics],
    min_len: usize,
) -> Vec<DiagnosticWarning> {
    let mut warnings = Vec::new();

    if chains.len() >= 2 && min_len >= 4 {
        let worst = params
            .iter()
            .filter(|p| p.r_hat.is_finite())
            .max_by(|a, b| a.r_hat.total_cmp(&b.r_hat));
        if let Some(p) = worst {
            if p.r_hat > R_HAT_THRESHOLD {
                warnings.push(DiagnosticWarning::NonConvergence {
                    parameter: p.name.clone(),
                    max_r_hat: p.r_hat,
                });
            }
        }
    }

    let total_draws: usize = chains.iter().map(|c| c.draws).sum();
    let divergences: usize = chains.iter().map(|c| c.divergences).sum();
    if total_draws > 0 {
        let rate = divergences as f64 / total_draws as f64;
        if divergences > 0 && rate > DIVERGENCE_RATE_THRESHOLD {
            warnings.push(DiagnosticWarning::Divergences { count: divergences, rate });
        }
    }

    for c in chains {
        if c.status == ChainStatus::CancelledDuringTuning {
            warnings.push(DiagnosticWarning::UnreliableStepSize { chain: c.chain_id });
        }
        if c.depth_saturated > 0 {
            warnings.push(DiagnosticWarning::TreeDepthSaturated {
                chain: c.chain_id,
                count: c.depth_saturated,
                max_tree_depth: c.max_tree_depth,
            });
        }
    }

    if min_len >= 4 {
        let threshold = MIN_ESS_PER_CHAIN * chains.len() as f64;
        let worst = params
            .iter()
            .map(|p| (p, p.ess_bulk.min(p.ess_tail)))
            .filter(|(_, ess)| ess.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((p, ess)) = worst {
            if ess < threshold {
                warnings.push(DiagnosticWarning::LowEss { parameter: p.name.clone(), min_ess: ess });
            }
        }
    }

    warnings
}

// ── Statistics ──────────────────────────────────────────────────────

fn mean(data: &[f64]) -> f64 {
    data.iter().sum::<f64>() / data.len() as f64
}

fn std_dev(data: &[f64], mean: f64) -> f64 {
    if data.len() < 2 {
        return f64::NAN;
    }
    let ss: f64 = data.iter().map(|v| (v - mean).powi(2)).sum();
    (ss / (data.len() - 1) as f64).sqrt()
}

/// Linear-interpolated quantile of the pooled draws.
fn pooled_quantile(chains: &[Vec<f64>], q: f64) -> f64 {
    let mut sorted: Vec<f64> = chains.iter().flatten().copied().collect();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    let pos = q * (sorted.len() - 1) as f64;
    let below = pos.floor() as usize;
    let above = (below + 1).min(sorted.len() - 1);
    let w = pos - below as f64;
    sorted[below] + w * (sorted[above] - sorted[below])
}

fn usable(chains: &[Vec<f64>]) -> bool {
    !chains.is_empty() && chains.iter().all(|c| c.len() >= 4)
}

/// Chains cut in half (odd middle draw dropped) with their first two moments.
struct SplitChains {
    halves: Vec<Vec<f64>>,
    means: Vec<f64>,
    /// Mean within-half variance W.
    within: f64,
    /// Between-half variance of the means, B / n.
    between: f64,
}

impl SplitChains {
    fn new(chains: &[Vec<f64>]) -> Self {
        let halves: Vec<Vec<f64>> = chains
            .iter()
            .flat_map(|c| {
                let h = c.len() / 2;
                [c[..h].to_vec(), c[c.len() - h..].to_vec()]
            })
            .collect();
        let means: Vec<f64> = halves.iter().map(|h| mean(h)).collect();
        let m = halves.len() as f64;
        let within = halves
            .iter()
            .zip(&means)
            .map(|(h, &mu)| h.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / (h.len() - 1) as f64)
            .sum::<f64>()
            / m;
        let grand = means.iter().sum::<f64>() / m;
        let between = means.iter().map(|mu| (mu - grand).powi(2)).sum::<f64>() / (m - 1.0);
        Self { halves, means, within, between }
    }

    fn n(&self) -> usize {
        self.halves[0].len()
    }

    /// Pooled posterior variance estimate `(n-1)/n W + B/n`.
    fn var_plus(&self) -> f64 {
        let n = self.n() as f64;
        (n - 1.0) / n * self.within + self.between
    }

    fn r_hat(&self) -> f64 {
        if self.within < 1e-30 {
            return f64::NAN;
        }
        (self.var_plus() / self.within).sqrt()
    }

    /// Autocorrelation at `lag`, combined across halves (Stan's estimator).
    fn rho(&self, lag: usize) -> f64 {
        let n = self.n();
        let acov: f64 = self
            .halves
            .iter()
            .zip(&self.means)
            .map(|(h, &mu)| (0..n - lag).map(|t| (h[t] - mu) * (h[t + lag] - mu)).sum::<f64>())
            .sum::<f64>()
            / (self.halves.len() * n) as f64;
        1.0 - (self.within - acov) / self.var_plus()
    }

    /// Effective sample size with Geyer's initial positive sequence.
    fn ess(&self) -> f64 {
        if self.within < 1e-30 {
            return f64::NAN;
        }
        let n = self.n();
        let draws = (self.halves.len() * n) as f64;
        let mut tau = -1.0;
        for t in (0..n.saturating_sub(1)).step_by(2) {
            let pair = self.rho(t) + self.rho(t + 1);
            if pair < 0.0 {
                break;
            }
            tau += 2.0 * pair;
        }
        draws / tau.max(1.0 / draws.log10().max(1.0))
    }
}

/// Split R-hat over `chains` (each split in two halves).
pub fn r_hat_chains(chains: &[Vec<f64>]) -> f64 {
    if !usable(chains) {
        return f64::NAN;
    }
    SplitChains::new(chains).r_hat()
}

/// Max of bulk (rank-normalized) and tail (folded) split R-hat.
pub fn r_hat_rank_normalized(chains: &[Vec<f64>]) -> f64 {
    if !usable(chains) {
        return f64::NAN;
    }
    let median = pooled_quantile(chains, 0.5);
    let folded: Vec<Vec<f64>> =
        chains.iter().map(|c| c.iter().map(|x| (x - median).abs()).collect()).collect();
    let bulk = r_hat_chains(&normal_scores(chains));
    let tail = r_hat_chains(&normal_scores(&folded));
    // f64::max ignores a NaN operand.
    bulk.max(tail)
}

/// Bulk ESS on rank-normalized draws.
pub fn ess_bulk_chains(chains: &[Vec<f64>]) -> f64 {
    if !usable(chains) {
        return f64::NAN;
    }
    SplitChains::new(&normal_scores(chains)).ess()
}

/// Tail ESS: the smaller ESS of the 5% and 95% quantile indicators.
pub fn ess_tail_chains(chains: &[Vec<f64>]) -> f64 {
    if !usable(chains) {
        return f64::NAN;
    }
    let indicator_ess = |cut: f64, below: bool| {
        let ind: Vec<Vec<f64>> = chains
            .iter()
            .map(|c| c.iter().map(|&x| if (x <= cut) == below { 1.0 } else { 0.0 }).collect())
            .collect();
        SplitChains::new(&ind).ess()
    };
    let lo = indicator_ess(pooled_quantile(chains, 0.05), true);
    let hi = indicator_ess(pooled_quantile(chains, 0.95), false);
    lo.min(hi)
}

/// Replace each draw by the normal quantile of its pooled fractional rank,
/// `Φ⁻¹((r - 3/8) / (S + 1/4))`, with tied draws sharing their average rank.
fn normal_scores(chains: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let mut order: Vec<(usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(ci, c)| (0..c.len()).map(move |di| (ci, di)))
        .collect();
    order.sort_unstable_by(|a, b| chains[a.0][a.1].total_cmp(&chains[b.0][b.1]));

    let total = order.len() as f64;
    let mut scores: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.0; c.len()]).collect();
    let mut start = 0;
    while start < order.len() {
        let (ci, di) = order[start];
        let value = chains[ci][di];
        let end = start
            + order[start..].iter().take_while(|&&(c, d)| chains[c][d] == value).count();
        // 1-based average rank of positions start..end
        let rank = (start + end + 1) as f64 / 2.0;
        let z = inv_normal_cdf((rank - 0.375) / (total + 0.25));
        for &(c, d) in &order[start..end] {
            scores[c][d] = z;
        }
        start = end;
    }
    scores
}

/// Inverse standard normal CDF (Acklam's rational approximation, relative
/// error below 1.2e-9).
fn inv_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838,
        -2.549732539343734,
        4.374664141464968,
        2.938163982698783,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996,
        3.754408661907416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }

    let tail = |q: f64| {
        let r = (-2.0 * q.ln()).sqrt();
        (((((C[0] * r + C[1]) * r + C[2]) * r + C[3]) * r + C[4]) * r + C[5])
            / ((((D[0] * r + D[1]) * r + D[2]) * r + D[3]) * r + 1.0)
    };

    if p < P_LOW {
        tail(p)
    } else if p > 1.0 - P_LOW {
        -tail(1.0 - p)
    } else {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    }
}
