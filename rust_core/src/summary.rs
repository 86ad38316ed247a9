//! Posterior summaries: pointwise mean and highest-density interval.

use ndarray::{Array2, ArrayView1};

use crate::chain::Chain;

/// Pointwise summary of the latent trajectory.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub prob: f64,
    pub mean: Vec<f64>,
    pub hdi_lower: Vec<f64>,
    pub hdi_upper: Vec<f64>,
}

impl Summary {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Fraction of `truth` values inside their interval.
    pub fn coverage(&self, truth: &[f64]) -> f64 {
        if truth.is_empty() {
            return f64::NAN;
        }
        let inside = truth
            .iter()
            .zip(self.hdi_lower.iter().zip(self.hdi_upper.iter()))
            .filter(|(x, (lo, hi))| *lo <= *x && *x <= *hi)
            .count();
        inside as f64 / truth.len() as f64
    }
}

/// Mean and HDI of a single marginal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentSummary {
    pub mean: f64,
    pub hdi_lower: f64,
    pub hdi_upper: f64,
}

/// Number of sorted samples an interval of mass `prob` must span: `ceil(prob * n)`.
///
/// Products within 1e-9 of an integer are not rounded up, so `5/6 * 6` gives 5.
fn window_len(prob: f64, n: usize) -> usize {
    let raw = prob * n as f64;
    let k = if (raw - raw.round()).abs() < 1e-9 { raw.round() } else { raw.ceil() };
    (k as usize).clamp(1, n)
}

/// Narrowest interval containing `prob` of the finite `samples`.
///
/// Scans windows of `ceil(prob * n)` consecutive sorted values in ascending
/// order and keeps the first one of minimal width. Returns `(NaN, NaN)` when
/// no finite sample is available.
pub fn hdi(samples: &[f64], prob: f64) -> (f64, f64) {
    let mut sorted: Vec<f64> = samples.iter().copied().filter(|x| x.is_finite()).collect();
    if sorted.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    sorted.sort_unstable_by(|a, b| a.total_cmp(b));
    hdi_sorted(&sorted, prob)
}

fn hdi_sorted(sorted: &[f64], prob: f64) -> (f64, f64) {
    let n = sorted.len();
    let k = window_len(prob, n);
    let mut best = 0;
    let mut best_width = f64::INFINITY;
    for start in 0..=(n - k) {
        let width = sorted[start + k - 1] - sorted[start];
        if width < best_width {
            best_width = width;
            best = start;
        }
    }
    (sorted[best], sorted[best + k - 1])
}

/// Mean and HDI of coordinate `index`, pooled across chains.
pub fn summarize_component(chains: &[Chain], index: usize, prob: f64) -> ComponentSummary {
    let pooled: Vec<f64> = chains
        .iter()
        .flat_map(|c| c.samples.iter().map(move |s| s.position[index]))
        .collect();
    let mean = if pooled.is_empty() {
        f64::NAN
    } else {
        pooled.iter().sum::<f64>() / pooled.len() as f64
    };
    let (hdi_lower, hdi_upper) = hdi(&pooled, prob);
    ComponentSummary { mean, hdi_lower, hdi_upper }
}

/// Summarize coordinates `0..n_time` (the latent path) pooled across chains.
pub fn summarize_latent(chains: &[Chain], n_time: usize, prob: f64) -> Summary {
    let mut summary = Summary {
        prob,
        mean: Vec::with_capacity(n_time),
        hdi_lower: Vec::with_capacity(n_time),
        hdi_upper: Vec::with_capacity(n_time),
    };
    for t in 0..n_time {
        let c = summarize_component(chains, t, prob);
        summary.mean.push(c.mean);
        summary.hdi_lower.push(c.hdi_lower);
        summary.hdi_upper.push(c.hdi_upper);
    }
    summary
}

/// Posterior mean of `mu[t, d] = latent[t] * loading[d]`, pooled across chains.
///
/// Unlike the latent path itself, `mu` is unaffected by the sign and scale
/// symmetry between latent and loading. All entries are NaN without draws.
pub fn summarize_mu(chains: &[Chain], n_time: usize, n_series: usize) -> Array2<f64> {
    let mut sum = Array2::<f64>::zeros((n_time, n_series));
    let mut count = 0usize;
    for draw in chains.iter().flat_map(|c| c.samples.iter()) {
        let latent = ArrayView1::from(&draw.position[..n_time]);
        let loading = ArrayView1::from(&draw.position[n_time..n_time + n_series]);
        for ((t, d), acc) in sum.indexed_iter_mut() {
            *acc += latent[t] * loading[d];
        }
        count += 1;
    }
    sum / count as f64
}
