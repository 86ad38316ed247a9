pub mod adapt;
pub mod chain;
pub mod config;
pub mod diagnostics;
pub mod distributions;
pub mod error;
pub mod gradient;
pub mod hmc;
pub mod model;
pub mod nuts;
pub mod pipeline;
pub mod progress;
pub mod sampler;
pub mod simulate;
pub mod summary;

pub use config::{RunConfig, SamplerConfig};
pub use error::{ConfigError, Error, Result};
pub use model::{ModelParameters, ModelSpec};
pub use pipeline::{fit, run, FitOutput, RunOutput};
pub use sampler::{sample, SampleResult};
pub use simulate::{simulate, SimulatedData};
pub use summary::{hdi, Summary};

// Future: a dense mass matrix would help when latent and loading draws are
// strongly correlated; the adaptation window already collects the moments.
