use latentmc_core::chain::ChainStatus;
use latentmc_core::pipeline::{self, FitOutput};
use latentmc_core::progress::{spawn_progress_thread, ProgressState};
use latentmc_core::{simulate as simulate_data, Error, RunConfig};
use ndarray::{Array2, Array3};
use numpy::{IntoPyArray, PyArray1, PyReadonlyArray2};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyInt, PyList};
use std::sync::Arc;

fn to_py_err(err: Error) -> PyErr {
    match err {
        Error::Config(_) | Error::Json(_) => PyValueError::new_err(err.to_string()),
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

/// Run `f` without the GIL, optionally rendering a progress bar to stderr.
fn with_progress<T: Send>(
    py: Python<'_>,
    config: &RunConfig,
    progressbar: bool,
    f: impl FnOnce(Option<&ProgressState>) -> latentmc_core::Result<T> + Send,
) -> PyResult<T> {
    let result = py.allow_threads(|| {
        if progressbar {
            let state = Arc::new(ProgressState::new(config.chains, config.draws, config.tune));
            let handle = spawn_progress_thread(Arc::clone(&state));
            let out = f(Some(state.as_ref()));
            state.finish();
            let _ = handle.join();
            out
        } else {
            f(None)
        }
    });
    result.map_err(to_py_err)
}

#[pyclass]
struct FitResult {
    output: FitOutput,
    n_time: usize,
    n_series: usize,
}

#[pymethods]
impl FitResult {
    /// Posterior mean and HDI of the latent path and of obs_sigma, plus the
    /// posterior mean of `mu = latent * loading`.
    fn summary<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let latent = &self.output.latent;
        let dict = PyDict::new(py);
        dict.set_item("hdi_prob", latent.prob)?;
        dict.set_item("mean", PyArray1::from_vec(py, latent.mean.clone()))?;
        dict.set_item("hdi_lower", PyArray1::from_vec(py, latent.hdi_lower.clone()))?;
        dict.set_item("hdi_upper", PyArray1::from_vec(py, latent.hdi_upper.clone()))?;
        let sigma = &self.output.obs_sigma;
        dict.set_item("obs_sigma_mean", sigma.mean)?;
        dict.set_item("obs_sigma_hdi", (sigma.hdi_lower, sigma.hdi_upper))?;
        dict.set_item("mu_mean", self.output.mu.clone().into_pyarray(py))?;
        Ok(dict)
    }

    /// Draws per variable: `latent` and `loading` as chain × draw × dim,
    /// `obs_sigma` as chain × draw.
    fn get_samples_2d<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let chains = &self.output.samples.chains;
        let n_chains = chains.len();
        let n_draws = chains.iter().map(|c| c.len()).min().unwrap_or(0);
        let sigma_index = self.n_time + self.n_series;

        let mut latent = Array3::<f64>::zeros((n_chains, n_draws, self.n_time));
        let mut loading = Array3::<f64>::zeros((n_chains, n_draws, self.n_series));
        let mut obs_sigma = Array2::<f64>::zeros((n_chains, n_draws));
        for (ci, chain) in chains.iter().enumerate() {
            for (di, draw) in chain.samples.iter().take(n_draws).enumerate() {
                for t in 0..self.n_time {
                    latent[[ci, di, t]] = draw.position[t];
                }
                for d in 0..self.n_series {
                    loading[[ci, di, d]] = draw.position[self.n_time + d];
                }
                obs_sigma[[ci, di]] = draw.position[sigma_index];
            }
        }

        let dict = PyDict::new(py);
        dict.set_item("latent", latent.into_pyarray(py))?;
        dict.set_item("loading", loading.into_pyarray(py))?;
        dict.set_item("obs_sigma", obs_sigma.into_pyarray(py))?;
        Ok(dict)
    }

    fn diagnostics<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let report = &self.output.diagnostics;
        let dict = PyDict::new(py);
        dict.set_item("divergences", report.divergences())?;
        dict.set_item("max_r_hat", report.max_r_hat())?;

        let per_chain = PyList::empty(py);
        for c in &report.chains {
            let row = PyDict::new(py);
            row.set_item("chain", c.chain_id)?;
            row.set_item("draws", c.draws)?;
            row.set_item("divergences", c.divergences)?;
            row.set_item("step_size", c.step_size)?;
            row.set_item("accept_rate", c.accept_rate)?;
            row.set_item("mean_tree_depth", c.mean_tree_depth)?;
            row.set_item("depth_saturated", c.depth_saturated)?;
            row.set_item("step_size_reliable", c.status != ChainStatus::CancelledDuringTuning)?;
            per_chain.append(row)?;
        }
        dict.set_item("chains", per_chain)?;

        let params = PyDict::new(py);
        for p in &report.params {
            let row = PyDict::new(py);
            row.set_item("mean", p.mean)?;
            row.set_item("std", p.std)?;
            row.set_item("hdi", (p.hdi_lower, p.hdi_upper))?;
            row.set_item("ess_bulk", p.ess_bulk)?;
            row.set_item("ess_tail", p.ess_tail)?;
            row.set_item("r_hat", p.r_hat)?;
            params.set_item(p.name.as_str(), row)?;
        }
        dict.set_item("params", params)?;

        let warnings: Vec<String> = report.warnings.iter().map(|w| w.to_string()).collect();
        dict.set_item("warnings", PyList::new(py, warnings)?)?;
        Ok(dict)
    }

    fn table(&self) -> String {
        self.output.diagnostics.to_table()
    }

    fn __repr__(&self) -> String {
        let samples = &self.output.samples;
        let sigma = &self.output.obs_sigma;
        format!(
            "latentmc FitResult ({} chains × {} draws, T={}, D={})\n  obs_sigma: mean={:.4}, hdi=[{:.4}, {:.4}]\n  divergences: {}",
            samples.chains.len(),
            samples.num_draws,
            self.n_time,
            self.n_series,
            sigma.mean,
            sigma.hdi_lower,
            sigma.hdi_upper,
            samples.divergences(),
        )
    }
}

impl FitResult {
    fn new(output: FitOutput, n_time: usize, n_series: usize) -> Self {
        Self { output, n_time, n_series }
    }
}

#[pyfunction]
#[pyo3(signature = (T=80, D=25, sigma=0.6, seed=42))]
#[allow(non_snake_case)]
fn simulate<'py>(py: Python<'py>, T: usize, D: usize, sigma: f64, seed: u64) -> PyResult<Bound<'py, PyDict>> {
    let data = simulate_data(T, D, sigma, seed).map_err(|e| to_py_err(e.into()))?;
    let dict = PyDict::new(py);
    dict.set_item("t", PyArray1::from_vec(py, data.t))?;
    dict.set_item("latent_true", PyArray1::from_vec(py, data.latent_true))?;
    dict.set_item("loading", PyArray1::from_vec(py, data.loading))?;
    dict.set_item("Y", data.y.into_pyarray(py))?;
    Ok(dict)
}

#[pyfunction]
#[pyo3(signature = (Y, rw_sigma=0.25, draws=1000, tune=1000, chains=2, target_accept=0.9, seed=42, hdi_prob=0.94, threads=0, progressbar=false))]
#[allow(clippy::too_many_arguments, non_snake_case)]
fn fit(
    py: Python<'_>,
    Y: PyReadonlyArray2<'_, f64>,
    rw_sigma: f64,
    draws: usize,
    tune: usize,
    chains: usize,
    target_accept: f64,
    seed: u64,
    hdi_prob: f64,
    threads: usize,
    progressbar: bool,
) -> PyResult<FitResult> {
    let y = Y.as_array().to_owned();
    let (n_time, n_series) = y.dim();
    let config = RunConfig {
        n_time,
        n_series,
        rw_sigma,
        draws,
        tune,
        chains,
        target_accept,
        seed,
        hdi_prob,
        num_threads: threads,
        ..RunConfig::default()
    };
    let output = with_progress(py, &config, progressbar, |progress| {
        pipeline::fit(y, &config, progress)
    })?;
    Ok(FitResult::new(output, n_time, n_series))
}

/// Convert keyword arguments into the JSON object `RunConfig` deserializes from.
fn kwargs_to_json(kwargs: Option<&Bound<'_, PyDict>>) -> PyResult<(serde_json::Value, bool)> {
    let mut map = serde_json::Map::new();
    let mut progressbar = false;
    if let Some(kwargs) = kwargs {
        for (key, value) in kwargs.iter() {
            let key: String = key.extract()?;
            if key == "progressbar" {
                progressbar = value.extract()?;
                continue;
            }
            let json = if value.is_none() {
                serde_json::Value::Null
            } else if value.is_instance_of::<PyBool>() {
                serde_json::Value::Bool(value.extract()?)
            } else if value.is_instance_of::<PyInt>() {
                serde_json::Value::from(value.extract::<i64>()?)
            } else if value.is_instance_of::<PyFloat>() {
                serde_json::Value::from(value.extract::<f64>()?)
            } else {
                return Err(PyValueError::new_err(format!("unsupported value for '{}'", key)));
            };
            map.insert(key, json);
        }
    }
    Ok((serde_json::Value::Object(map), progressbar))
}

/// Simulate a dataset and fit it. Accepts any `RunConfig` field as a keyword.
#[pyfunction]
#[pyo3(signature = (**kwargs))]
fn run<'py>(
    py: Python<'py>,
    kwargs: Option<&Bound<'py, PyDict>>,
) -> PyResult<(Bound<'py, PyDict>, FitResult)> {
    let (json, progressbar) = kwargs_to_json(kwargs)?;
    let config: RunConfig =
        serde_json::from_value(json).map_err(|e| to_py_err(Error::Json(e)))?;
    config.validate().map_err(|e| to_py_err(e.into()))?;

    let out = with_progress(py, &config, progressbar, |progress| pipeline::run(&config, progress))?;

    let data = PyDict::new(py);
    data.set_item("t", PyArray1::from_vec(py, out.t))?;
    data.set_item("latent_true", PyArray1::from_vec(py, out.latent_true))?;
    data.set_item("loading", PyArray1::from_vec(py, out.loading_true))?;
    data.set_item("Y", out.y.into_pyarray(py))?;
    Ok((data, FitResult::new(out.fit, config.n_time, config.n_series)))
}

#[pymodule]
fn latentmc(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<FitResult>()?;
    m.add_function(wrap_pyfunction!(simulate, m)?)?;
    m.add_function(wrap_pyfunction!(fit, m)?)?;
    m.add_function(wrap_pyfunction!(run, m)?)?;
    Ok(())
}
