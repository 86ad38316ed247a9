use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared progress and cancellation state for all chains of one run.
///
/// Chains only do relaxed atomic increments and read the cancel flag once
/// per iteration. A dedicated thread can render the counters to stderr,
/// independent of the sampling threads.
pub struct ProgressState {
    pub total_iters: usize,
    pub completed: AtomicUsize,
    pub divergences: AtomicUsize,
    pub leapfrog_steps: AtomicUsize,
    pub done: AtomicBool,
    cancelled: AtomicBool,
    pub start_time: Instant,
    pub num_chains: usize,
    pub num_draws: usize,
    pub num_tune: usize,
}

impl ProgressState {
    pub fn new(num_chains: usize, num_draws: usize, num_tune: usize) -> Self {
        Self {
            total_iters: num_chains * (num_tune + num_draws),
            completed: AtomicUsize::new(0),
            divergences: AtomicUsize::new(0),
            leapfrog_steps: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            start_time: Instant::now(),
            num_chains,
            num_draws,
            num_tune,
        }
    }

    pub fn record_iteration(&self, n_leapfrog: usize, diverged: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.leapfrog_steps.fetch_add(n_leapfrog, Ordering::Relaxed);
        if diverged {
            self.divergences.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Ask every chain to stop after its current iteration.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

/// Compact human-readable count: `999`, `25.0k`, `1.2M`.
fn fmt_si(n: f64) -> String {
    match n {
        n if n >= 1e6 => format!("{:.1}M", n / 1e6),
        n if n >= 1e3 => format!("{:.1}k", n / 1e3),
        n => format!("{:.0}", n),
    }
}

fn fmt_clock(secs: f64) -> String {
    if secs < 60.0 {
        return format!("{:.1}s", secs);
    }
    let whole = secs as u64;
    format!("{}:{:02}", whole / 60, whole % 60)
}

/// Run phase inferred from the iteration count pooled over all chains.
///
/// Chains advance at different speeds, so a single chain may already be
/// sampling while this still reports tuning, or the reverse.
fn phase(state: &ProgressState, completed: usize) -> &'static str {
    if state.is_cancelled() {
        "cancelled"
    } else if state.done.load(Ordering::Relaxed) {
        "done"
    } else if completed < state.num_chains * state.num_tune {
        "tuning"
    } else {
        "sampling"
    }
}

fn progress_line(state: &ProgressState) -> String {
    const BAR_WIDTH: usize = 30;

    let completed = state.completed.load(Ordering::Relaxed);
    let total = state.total_iters;
    let divergences = state.divergences.load(Ordering::Relaxed);
    let elapsed = state.start_time.elapsed().as_secs_f64();
    let frac = if total > 0 { completed.min(total) as f64 / total as f64 } else { 0.0 };

    let filled = (frac * BAR_WIDTH as f64) as usize;
    let bar = format!("{}{}", "━".repeat(filled), "╌".repeat(BAR_WIDTH - filled));
    let head = format!(
        "{} chains {:<9} {} {:>3}% │ {}/{} │ {} divergences",
        state.num_chains,
        phase(state, completed),
        bar,
        (frac * 100.0) as usize,
        fmt_si(completed as f64),
        fmt_si(total as f64),
        divergences,
    );

    if state.done.load(Ordering::Relaxed) {
        let grads = state.leapfrog_steps.load(Ordering::Relaxed);
        return format!("{} │ {} gradients │ {}", head, fmt_si(grads as f64), fmt_clock(elapsed));
    }
    let rate = if elapsed > 0.05 { completed as f64 / elapsed } else { 0.0 };
    let eta = if rate > 0.0 { total.saturating_sub(completed) as f64 / rate } else { 0.0 };
    format!("{} │ {} it/s │ {} < ~{}", head, fmt_si(rate), fmt_clock(elapsed), fmt_clock(eta))
}

fn render(state: &ProgressState) {
    let line = progress_line(state);
    let end = if state.done.load(Ordering::Relaxed) { "\n" } else { "" };
    let mut err = std::io::stderr().lock();
    let _ = write!(err, "\r{}\x1b[K{}", line, end);
    let _ = err.flush();
}

/// Spawn a background thread that renders the progress bar at ~10 Hz.
/// Returns a join handle; call `state.finish()` then `handle.join()` to
/// clean up after sampling.
pub fn spawn_progress_thread(state: Arc<ProgressState>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !state.done.load(Ordering::Relaxed) {
            render(&state);
            std::thread::sleep(Duration::from_millis(100));
        }
        render(&state);
    })
}
