//! Kernel density proposals fitted to the previous population.

use abc_core::errors::ErrorInfo;
use abc_core::{weighted_choice, AbcError, Parameter, RngHandle, Transition};
use nalgebra::{DMatrix, DVector};
use rand_distr::{Distribution, StandardNormal};

use crate::config::{Bandwidth, TransitionConfig};

const JITTER_ATTEMPTS: usize = 8;

/// Weighted Gaussian kernel density estimate over the parameters of one
/// model.
///
/// The kernel covariance is the weighted sample covariance multiplied by the
/// squared bandwidth factor and by `scaling`. Each diagonal entry is raised
/// to at least `(min_bandwidth * max(1, |mean|))^2`, so a fit on a single
/// particle still spreads around it.
#[derive(Debug, Clone)]
pub struct MultivariateNormalTransition {
    scaling: f64,
    bandwidth: Bandwidth,
    min_bandwidth: f64,
    keys: Vec<String>,
    particles: Vec<Parameter>,
    weights: Vec<f64>,
    points: Vec<DVector<f64>>,
    cholesky_factor: DMatrix<f64>,
    precision: DMatrix<f64>,
    log_normalizer: f64,
    fitted: bool,
}

impl Default for MultivariateNormalTransition {
    fn default() -> Self {
        Self::new(TransitionConfig::default())
    }
}

impl MultivariateNormalTransition {
    /// Unfitted kernel with the given scaling and bandwidth rule.
    pub fn new(config: TransitionConfig) -> Self {
        Self {
            scaling: config.scaling,
            bandwidth: config.bandwidth,
            min_bandwidth: config.min_bandwidth,
            keys: Vec::new(),
            particles: Vec::new(),
            weights: Vec::new(),
            points: Vec::new(),
            cholesky_factor: DMatrix::zeros(0, 0),
            precision: DMatrix::zeros(0, 0),
            log_normalizer: 0.0,
            fitted: false,
        }
    }

    /// Kernel covariance of the last fit.
    pub fn covariance(&self) -> DMatrix<f64> {
        &self.cholesky_factor * self.cholesky_factor.transpose()
    }

    fn bandwidth_factor(&self, effective_size: f64, dim: usize) -> f64 {
        let d = dim as f64;
        match self.bandwidth {
            Bandwidth::Silverman => (4.0 / (effective_size * (d + 2.0))).powf(1.0 / (d + 4.0)),
            Bandwidth::Scott => effective_size.powf(-1.0 / (d + 4.0)),
        }
    }

    fn not_fitted() -> AbcError {
        AbcError::Transition(ErrorInfo::new(
            "transition-not-fitted",
            "transition kernel used before fit",
        ))
    }

    fn vector_of(&self, parameter: &Parameter) -> Result<DVector<f64>, AbcError> {
        parameter
            .to_vector(&self.keys)
            .map(DVector::from_vec)
            .ok_or_else(|| {
                AbcError::Transition(
                    ErrorInfo::new("parameter-keys-mismatch", "parameter is missing a fitted key")
                        .with_context("expected", self.keys.join(",")),
                )
            })
    }
}

fn weighted_mean(points: &[DVector<f64>], weights: &[f64], dim: usize) -> DVector<f64> {
    let mut mean = DVector::zeros(dim);
    for (point, &w) in points.iter().zip(weights) {
        mean += point * w;
    }
    mean
}

fn weighted_covariance(points: &[DVector<f64>], weights: &[f64], dim: usize) -> DMatrix<f64> {
    let mean = weighted_mean(points, weights, dim);
    let mut cov = DMatrix::zeros(dim, dim);
    for (point, &w) in points.iter().zip(weights) {
        let centered = point - &mean;
        cov += &centered * centered.transpose() * w;
    }
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    if sum_sq < 1.0 {
        cov /= 1.0 - sum_sq;
    }
    cov
}

fn factorize(cov: DMatrix<f64>) -> Result<(DMatrix<f64>, DMatrix<f64>), AbcError> {
    let dim = cov.nrows();
    let scale = (cov.trace() / dim as f64).abs().max(1.0);
    let mut jitter = 0.0;
    for attempt in 0..JITTER_ATTEMPTS {
        let candidate = &cov + DMatrix::<f64>::identity(dim, dim) * jitter;
        if let Some(cholesky) = candidate.cholesky() {
            let precision = cholesky.inverse();
            return Ok((cholesky.l(), precision));
        }
        jitter = scale * 1e-10 * 100f64.powi(attempt as i32);
    }
    Err(AbcError::Transition(
        ErrorInfo::new("singular-covariance", "kernel covariance is not positive definite")
            .with_context("dimension", dim),
    ))
}

impl Transition for MultivariateNormalTransition {
    fn fit(&mut self, particles: &[Parameter], weights: &[f64]) -> Result<(), AbcError> {
        if particles.is_empty() || particles.len() != weights.len() {
            return Err(AbcError::Transition(
                ErrorInfo::new("invalid-fit-input", "fit needs one weight per particle and at least one particle")
                    .with_context("particles", particles.len())
                    .with_context("weights", weights.len()),
            ));
        }
        let total: f64 = weights.iter().sum();
        if !(total > 0.0) {
            return Err(AbcError::Transition(
                ErrorInfo::new("invalid-fit-weights", "fit weights must have positive sum")
                    .with_context("total", total),
            ));
        }
        let normalized: Vec<f64> = weights.iter().map(|w| w / total).collect();
        self.keys = particles[0].keys();
        let points = particles
            .iter()
            .map(|parameter| self.vector_of(parameter))
            .collect::<Result<Vec<_>, _>>()?;
        let dim = self.keys.len();

        if dim > 0 {
            let effective_size = 1.0 / normalized.iter().map(|w| w * w).sum::<f64>();
            let factor = self.bandwidth_factor(effective_size, dim);
            let mut cov =
                weighted_covariance(&points, &normalized, dim) * (factor * factor * self.scaling);
            let mean = weighted_mean(&points, &normalized, dim);
            for i in 0..dim {
                let floor = (self.min_bandwidth * mean[i].abs().max(1.0)).powi(2);
                if cov[(i, i)] < floor {
                    cov[(i, i)] = floor;
                }
            }
            let (l, precision) = factorize(cov)?;
            let log_det: f64 = 2.0 * l.diagonal().iter().map(|v| v.ln()).sum::<f64>();
            self.log_normalizer =
                -0.5 * (dim as f64 * (2.0 * std::f64::consts::PI).ln() + log_det);
            self.cholesky_factor = l;
            self.precision = precision;
        } else {
            self.cholesky_factor = DMatrix::zeros(0, 0);
            self.precision = DMatrix::zeros(0, 0);
            self.log_normalizer = 0.0;
        }

        self.particles = particles.to_vec();
        self.weights = normalized;
        self.points = points;
        self.fitted = true;
        Ok(())
    }

    fn rvs(&self, rng: &mut RngHandle) -> Result<Parameter, AbcError> {
        if !self.fitted {
            return Err(Self::not_fitted());
        }
        let idx = weighted_choice(&self.weights, rng).ok_or_else(Self::not_fitted)?;
        if self.keys.is_empty() {
            return Ok(self.particles[idx].clone());
        }
        let z = DVector::from_iterator(
            self.keys.len(),
            (0..self.keys.len()).map(|_| -> f64 { StandardNormal.sample(rng) }),
        );
        let perturbed = &self.points[idx] + &self.cholesky_factor * z;
        Ok(Parameter::from_vector(&self.keys, perturbed.as_slice()))
    }

    fn pdf(&self, parameter: &Parameter) -> Result<f64, AbcError> {
        if !self.fitted {
            return Err(Self::not_fitted());
        }
        if self.keys.is_empty() {
            return Ok(1.0);
        }
        let x = self.vector_of(parameter)?;
        let mut density = 0.0;
        for (point, &w) in self.points.iter().zip(&self.weights) {
            let diff = &x - point;
            let mahalanobis = (diff.transpose() * &self.precision * &diff)[(0, 0)];
            density += w * (self.log_normalizer - 0.5 * mahalanobis).exp();
        }
        Ok(density)
    }

    fn fitted_data(&self) -> Option<(&[Parameter], &[f64])> {
        if self.fitted {
            Some((&self.particles, &self.weights))
        } else {
            None
        }
    }

    fn clone_box(&self) -> Box<dyn Transition> {
        Box::new(self.clone())
    }
}

/// Weighted mean coefficient of variation of the proposal density.
///
/// Refits a copy of `transition` on `n_bootstrap` resamples of size
/// `n_samples` and measures how much the density at the fitted particles
/// varies across refits.
pub fn mean_cv(
    transition: &dyn Transition,
    n_samples: usize,
    n_bootstrap: usize,
    rng: &mut RngHandle,
) -> Result<f64, AbcError> {
    let (particles, weights) = transition.fitted_data().ok_or_else(|| {
        AbcError::Transition(ErrorInfo::new(
            "transition-not-fitted",
            "coefficient of variation needs a fitted transition",
        ))
    })?;
    if n_samples == 0 || n_bootstrap < 2 {
        return Err(AbcError::Transition(
            ErrorInfo::new("invalid-bootstrap", "bootstrap needs samples and at least two repetitions")
                .with_context("n_samples", n_samples)
                .with_context("n_bootstrap", n_bootstrap),
        ));
    }

    let uniform = vec![1.0 / n_samples as f64; n_samples];
    let mut densities = vec![vec![0.0; particles.len()]; n_bootstrap];
    for row in densities.iter_mut() {
        let mut resample = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            let idx = weighted_choice(weights, rng).ok_or_else(|| {
                AbcError::Transition(ErrorInfo::new("invalid-fit-weights", "fitted weights are all zero"))
            })?;
            resample.push(particles[idx].clone());
        }
        let mut copy = transition.clone_box();
        copy.fit(&resample, &uniform)?;
        for (slot, parameter) in row.iter_mut().zip(particles) {
            *slot = copy.pdf(parameter)?;
        }
    }

    let mut cv = 0.0;
    for (j, &w) in weights.iter().enumerate() {
        let values: Vec<f64> = densities.iter().map(|row| row[j]).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        if mean > 0.0 {
            let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            cv += w * var.sqrt() / mean;
        }
    }
    Ok(cv)
}
