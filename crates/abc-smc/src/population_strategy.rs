//! Number of particles per generation.

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, RngHandle, Transition};
use serde_json::json;
use tracing::info;

use crate::config::PopulationConfig;
use crate::transition::mean_cv;

/// Decides how many particles the next generation accepts.
pub trait PopulationStrategy: Send + Sync {
    /// Target number of accepted particles.
    fn nr_particles(&self) -> usize;

    /// Simulations per proposed parameter.
    fn nr_samples_per_parameter(&self) -> usize;

    /// Adapts to freshly fitted transitions before generation `t`.
    ///
    /// `model_probabilities` is dense over all models; transitions of models
    /// with probability zero are not fitted and must be skipped.
    fn adapt(
        &mut self,
        _t: usize,
        _transitions: &[Box<dyn Transition>],
        _model_probabilities: &[f64],
        _rng: &mut RngHandle,
    ) -> Result<(), AbcError> {
        Ok(())
    }

    /// JSON description stored with the run.
    fn config(&self) -> serde_json::Value;
}

/// Builds the strategy described by `config`.
pub fn from_config(config: &PopulationConfig) -> Result<Box<dyn PopulationStrategy>, AbcError> {
    match *config {
        PopulationConfig::Constant {
            size,
            samples_per_parameter,
        } => Ok(Box::new(
            ConstantPopulationSize::new(size)?.with_samples_per_parameter(samples_per_parameter)?,
        )),
        PopulationConfig::Adaptive {
            start_size,
            mean_cv,
            min_size,
            max_size,
            n_bootstrap,
            samples_per_parameter,
        } => {
            let mut strategy = AdaptivePopulationSize::new(start_size)?
                .with_mean_cv(mean_cv)
                .with_bounds(min_size, max_size)
                .with_samples_per_parameter(samples_per_parameter)?;
            strategy.n_bootstrap = n_bootstrap.max(2);
            Ok(Box::new(strategy))
        }
    }
}

fn check_positive(what: &str, value: usize) -> Result<(), AbcError> {
    if value == 0 {
        return Err(AbcError::Config(
            ErrorInfo::new("zero-size", format!("{what} must be positive")).with_context(what, value),
        ));
    }
    Ok(())
}

/// Same size in every generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstantPopulationSize {
    nr_particles: usize,
    nr_samples_per_parameter: usize,
}

impl ConstantPopulationSize {
    /// `nr_particles` accepted particles per generation.
    pub fn new(nr_particles: usize) -> Result<Self, AbcError> {
        check_positive("nr_particles", nr_particles)?;
        Ok(Self {
            nr_particles,
            nr_samples_per_parameter: 1,
        })
    }

    /// Simulates every proposal `n` times.
    pub fn with_samples_per_parameter(mut self, n: usize) -> Result<Self, AbcError> {
        check_positive("samples_per_parameter", n)?;
        self.nr_samples_per_parameter = n;
        Ok(self)
    }
}

impl PopulationStrategy for ConstantPopulationSize {
    fn nr_particles(&self) -> usize {
        self.nr_particles
    }

    fn nr_samples_per_parameter(&self) -> usize {
        self.nr_samples_per_parameter
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "name": "ConstantPopulationSize",
            "nr_particles": self.nr_particles,
            "nr_samples_per_parameter": self.nr_samples_per_parameter,
        })
    }
}

/// Size chosen so that the bootstrap coefficient of variation of the
/// proposal density meets a target.
///
/// The coefficient of variation is estimated at several candidate sizes and
/// extrapolated with a power law `cv = a * n^b`.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptivePopulationSize {
    nr_particles: usize,
    nr_samples_per_parameter: usize,
    mean_cv: f64,
    min_population_size: usize,
    max_population_size: Option<usize>,
    n_bootstrap: usize,
}

impl AdaptivePopulationSize {
    /// Starts with `start_nr_particles` and targets a mean CV of 0.05.
    pub fn new(start_nr_particles: usize) -> Result<Self, AbcError> {
        check_positive("start_nr_particles", start_nr_particles)?;
        Ok(Self {
            nr_particles: start_nr_particles,
            nr_samples_per_parameter: 1,
            mean_cv: 0.05,
            min_population_size: 10,
            max_population_size: None,
            n_bootstrap: 10,
        })
    }

    /// Target mean coefficient of variation.
    pub fn with_mean_cv(mut self, mean_cv: f64) -> Self {
        self.mean_cv = mean_cv;
        self
    }

    /// Clamp range of adapted sizes.
    pub fn with_bounds(mut self, min: usize, max: Option<usize>) -> Self {
        self.min_population_size = min.max(1);
        self.max_population_size = max;
        self
    }

    /// Simulates every proposal `n` times.
    pub fn with_samples_per_parameter(mut self, n: usize) -> Result<Self, AbcError> {
        check_positive("samples_per_parameter", n)?;
        self.nr_samples_per_parameter = n;
        Ok(self)
    }

    fn cv_at(
        &self,
        size: usize,
        transitions: &[Box<dyn Transition>],
        model_probabilities: &[f64],
        rng: &mut RngHandle,
    ) -> Result<f64, AbcError> {
        let mut cv = 0.0;
        for (transition, &p) in transitions.iter().zip(model_probabilities) {
            if p <= 0.0 || transition.fitted_data().is_none() {
                continue;
            }
            let n_samples = ((size as f64 * p).round() as usize).max(1);
            cv += p * mean_cv(transition.as_ref(), n_samples, self.n_bootstrap, rng)?;
        }
        Ok(cv)
    }
}

/// Least-squares slope and intercept of `ys` against `xs`.
fn linear_fit(xs: &[f64], ys: &[f64]) -> Option<(f64, f64)> {
    let n = xs.len() as f64;
    if xs.len() < 2 {
        return None;
    }
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
    if sxx <= 0.0 {
        return None;
    }
    let sxy: f64 = xs.iter().zip(ys).map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let slope = sxy / sxx;
    Some((mean_y - slope * mean_x, slope))
}

impl PopulationStrategy for AdaptivePopulationSize {
    fn nr_particles(&self) -> usize {
        self.nr_particles
    }

    fn nr_samples_per_parameter(&self) -> usize {
        self.nr_samples_per_parameter
    }

    fn adapt(
        &mut self,
        t: usize,
        transitions: &[Box<dyn Transition>],
        model_probabilities: &[f64],
        rng: &mut RngHandle,
    ) -> Result<(), AbcError> {
        let n = self.nr_particles;
        let candidates = [n / 4, n / 2, n, 2 * n, 4 * n];
        let mut log_sizes = Vec::with_capacity(candidates.len());
        let mut log_cvs = Vec::with_capacity(candidates.len());
        for &size in candidates.iter().filter(|size| **size >= 2) {
            let cv = self.cv_at(size, transitions, model_probabilities, rng)?;
            if cv > 0.0 && cv.is_finite() {
                log_sizes.push((size as f64).ln());
                log_cvs.push(cv.ln());
            }
        }

        let adapted = match linear_fit(&log_sizes, &log_cvs) {
            Some((intercept, slope)) if slope < 0.0 => {
                ((self.mean_cv.ln() - intercept) / slope).exp()
            }
            _ => n as f64,
        };
        let mut size = if adapted.is_finite() {
            adapted.round().max(1.0) as usize
        } else {
            n
        };
        size = size.max(self.min_population_size);
        if let Some(max) = self.max_population_size {
            size = size.min(max);
        }
        info!(t, previous = n, nr_particles = size, "adapted population size");
        self.nr_particles = size;
        Ok(())
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "name": "AdaptivePopulationSize",
            "nr_particles": self.nr_particles,
            "mean_cv": self.mean_cv,
            "min_population_size": self.min_population_size,
            "max_population_size": self.max_population_size,
            "n_bootstrap": self.n_bootstrap,
            "nr_samples_per_parameter": self.nr_samples_per_parameter,
        })
    }
}
