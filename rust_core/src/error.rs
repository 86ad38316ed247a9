//! Error types for latentmc.
//!
//! Only configuration problems are fatal. Numerical trouble during sampling
//! is recorded as a divergence and reported through diagnostics.

use thiserror::Error;

/// A configuration value that cannot be used to start a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("number of time steps must be > 0")]
    EmptyTime,

    #[error("number of observed series must be > 0")]
    EmptySeries,

    #[error("chains must be >= 1")]
    NoChains,

    #[error("target_accept must lie in (0, 1), got {0}")]
    TargetAccept(f64),

    #[error("hdi_prob must lie in (0, 1], got {0}")]
    HdiProb(f64),

    #[error("{name} must be a finite value > 0, got {value}")]
    NonPositive { name: &'static str, value: f64 },

    #[error("init_jitter must be finite and >= 0, got {0}")]
    Jitter(f64),

    #[error("max_tree_depth must be >= 1")]
    TreeDepth,

    #[error("observation matrix contains a non-finite value at ({row}, {col})")]
    NonFiniteData { row: usize, col: usize },

    #[error("parameter vector has length {got}, model expects {expected}")]
    Dimension { expected: usize, got: usize },
}

/// Crate error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not find a starting point with finite log density for chain {0}")]
    InitialPoint(usize),

    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The log density or one of its gradient entries was not finite.
///
/// The sampler turns this into a divergent transition instead of failing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("log density or gradient is not finite")]
pub struct NonFiniteDensity;
