//! Priors over parameters and models plus the model perturbation kernel.

use std::collections::BTreeMap;

use abc_core::errors::ErrorInfo;
use abc_core::{weighted_choice, AbcError, ModelIndex, Parameter, Prior, RngHandle};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// One-dimensional random variable used as a parameter prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RandomVariable {
    /// Continuous uniform on `[low, high)`.
    Uniform {
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
    },
    /// Gaussian with the given mean and standard deviation.
    Normal {
        /// Mean.
        mean: f64,
        /// Standard deviation, strictly positive.
        sd: f64,
    },
    /// Finite support with explicit probabilities.
    Discrete {
        /// Support points.
        values: Vec<f64>,
        /// Probabilities, same length as `values`.
        probs: Vec<f64>,
    },
}

impl RandomVariable {
    /// Uniform on `[low, high)`; errors on an empty interval.
    pub fn uniform(low: f64, high: f64) -> Result<Self, AbcError> {
        if !(high > low) {
            return Err(AbcError::Config(
                ErrorInfo::new("empty-uniform-support", "uniform prior needs low < high")
                    .with_context("low", low)
                    .with_context("high", high),
            ));
        }
        Ok(RandomVariable::Uniform { low, high })
    }

    /// Gaussian prior; errors unless `sd` is positive and finite.
    pub fn normal(mean: f64, sd: f64) -> Result<Self, AbcError> {
        if !(sd > 0.0) || !sd.is_finite() {
            return Err(AbcError::Config(
                ErrorInfo::new("invalid-standard-deviation", "normal prior needs sd > 0")
                    .with_context("sd", sd),
            ));
        }
        Ok(RandomVariable::Normal { mean, sd })
    }

    /// Discrete prior; probabilities are normalised.
    pub fn discrete(values: Vec<f64>, probs: Vec<f64>) -> Result<Self, AbcError> {
        let total: f64 = probs.iter().sum();
        if values.len() != probs.len() || values.is_empty() || !(total > 0.0) {
            return Err(AbcError::Config(
                ErrorInfo::new("invalid-discrete-prior", "discrete prior needs matching non-empty values and positive probabilities")
                    .with_context("values", values.len())
                    .with_context("probs", probs.len()),
            ));
        }
        let probs = probs.into_iter().map(|p| p / total).collect();
        Ok(RandomVariable::Discrete { values, probs })
    }

    /// Draws one value.
    pub fn rvs(&self, rng: &mut RngHandle) -> f64 {
        match self {
            RandomVariable::Uniform { low, high } => rng.gen_range(*low..*high),
            RandomVariable::Normal { mean, sd } => match Normal::new(*mean, *sd) {
                Ok(normal) => normal.sample(rng),
                Err(_) => *mean,
            },
            RandomVariable::Discrete { values, probs } => weighted_choice(probs, rng)
                .map(|idx| values[idx])
                .unwrap_or(f64::NAN),
        }
    }

    /// Density (or probability mass) at `x`.
    pub fn pdf(&self, x: f64) -> f64 {
        match self {
            RandomVariable::Uniform { low, high } => {
                if x >= *low && x <= *high {
                    1.0 / (high - low)
                } else {
                    0.0
                }
            }
            RandomVariable::Normal { mean, sd } => {
                let z = (x - mean) / sd;
                (-0.5 * z * z).exp() / (sd * (2.0 * std::f64::consts::PI).sqrt())
            }
            RandomVariable::Discrete { values, probs } => values
                .iter()
                .zip(probs)
                .filter(|(value, _)| **value == x)
                .map(|(_, p)| *p)
                .sum(),
        }
    }
}

/// Product prior over named, independent parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterPrior {
    components: BTreeMap<String, RandomVariable>,
}

impl ParameterPrior {
    /// Empty prior; yields the empty parameter with density one.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the prior of `name`.
    pub fn with(mut self, name: impl Into<String>, variable: RandomVariable) -> Self {
        self.components.insert(name.into(), variable);
        self
    }

    /// Parameter names in sorted order.
    pub fn keys(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }
}

impl Prior<Parameter> for ParameterPrior {
    fn sample(&self, rng: &mut RngHandle) -> Parameter {
        self.components
            .iter()
            .map(|(name, variable)| (name.clone(), variable.rvs(rng)))
            .collect()
    }

    fn density(&self, value: &Parameter) -> f64 {
        let mut density = 1.0;
        for (name, variable) in &self.components {
            match value.value(name) {
                Some(x) => density *= variable.pdf(x),
                None => return 0.0,
            }
        }
        density
    }
}

/// Prior over model indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ModelPrior {
    /// Every model equally likely.
    Uniform {
        /// Number of models.
        nr_models: usize,
    },
    /// Explicit probabilities per model.
    Weighted {
        /// Normalised probabilities.
        probs: Vec<f64>,
    },
}

impl ModelPrior {
    /// Uniform prior over `nr_models` models.
    pub fn uniform(nr_models: usize) -> Self {
        ModelPrior::Uniform { nr_models }
    }

    /// Weighted prior; probabilities are normalised.
    pub fn weighted(probs: Vec<f64>) -> Result<Self, AbcError> {
        let total: f64 = probs.iter().sum();
        if probs.is_empty() || !(total > 0.0) || probs.iter().any(|p| *p < 0.0) {
            return Err(AbcError::Config(
                ErrorInfo::new("invalid-model-prior", "model probabilities must be non-negative with positive sum")
                    .with_context("models", probs.len()),
            ));
        }
        Ok(ModelPrior::Weighted {
            probs: probs.into_iter().map(|p| p / total).collect(),
        })
    }

    /// Number of models covered.
    pub fn nr_models(&self) -> usize {
        match self {
            ModelPrior::Uniform { nr_models } => *nr_models,
            ModelPrior::Weighted { probs } => probs.len(),
        }
    }
}

impl Prior<ModelIndex> for ModelPrior {
    fn sample(&self, rng: &mut RngHandle) -> ModelIndex {
        match self {
            ModelPrior::Uniform { nr_models } => {
                if *nr_models <= 1 {
                    0
                } else {
                    rng.gen_range(0..*nr_models)
                }
            }
            ModelPrior::Weighted { probs } => weighted_choice(probs, rng).unwrap_or(0),
        }
    }

    fn density(&self, value: &ModelIndex) -> f64 {
        match self {
            ModelPrior::Uniform { nr_models } => {
                if *value < *nr_models {
                    1.0 / *nr_models as f64
                } else {
                    0.0
                }
            }
            ModelPrior::Weighted { probs } => probs.get(*value).copied().unwrap_or(0.0),
        }
    }
}

/// Kernel moving between models: stay with a fixed probability, otherwise
/// jump uniformly to one of the other models.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPerturbationKernel {
    nr_models: usize,
    probability_to_stay: f64,
}

impl ModelPerturbationKernel {
    /// Builds a kernel over `nr_models` models.
    pub fn new(nr_models: usize, probability_to_stay: f64) -> Result<Self, AbcError> {
        if !(0.0..=1.0).contains(&probability_to_stay) {
            return Err(AbcError::Config(
                ErrorInfo::new("invalid-stay-probability", "probability_to_stay must lie in [0, 1]")
                    .with_context("probability_to_stay", probability_to_stay),
            ));
        }
        Ok(Self {
            nr_models,
            probability_to_stay,
        })
    }

    /// Number of models.
    pub fn nr_models(&self) -> usize {
        self.nr_models
    }

    /// Draws the perturbed model starting from `m`.
    pub fn rvs(&self, m: ModelIndex, rng: &mut RngHandle) -> ModelIndex {
        if self.nr_models <= 1 {
            return m;
        }
        if rng.uniform() < self.probability_to_stay {
            return m;
        }
        let jump = rng.gen_range(0..self.nr_models - 1);
        if jump >= m {
            jump + 1
        } else {
            jump
        }
    }

    /// Probability of moving from `from` to `to`.
    pub fn pmf(&self, to: ModelIndex, from: ModelIndex) -> f64 {
        if self.nr_models <= 1 {
            return if to == from { 1.0 } else { 0.0 };
        }
        if to == from {
            self.probability_to_stay
        } else {
            (1.0 - self.probability_to_stay) / (self.nr_models - 1) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perturbation_pmf_is_a_distribution() {
        let kernel = ModelPerturbationKernel::new(4, 0.7).unwrap();
        for from in 0..4 {
            let total: f64 = (0..4).map(|to| kernel.pmf(to, from)).sum();
            assert!((total - 1.0).abs() < 1e-12);
        }
        let single = ModelPerturbationKernel::new(1, 0.7).unwrap();
        assert_eq!(single.pmf(0, 0), 1.0);
    }

    #[test]
    fn uniform_prior_density_vanishes_outside_support() {
        let prior = ParameterPrior::new()
            .with("x", RandomVariable::uniform(0.0, 5.0).unwrap())
            .with("y", RandomVariable::uniform(1.0, 8.0).unwrap());
        let inside: Parameter = [("x", 1.0), ("y", 2.0)].into_iter().collect();
        let outside: Parameter = [("x", -1.0), ("y", 2.0)].into_iter().collect();
        assert!((prior.density(&inside) - 1.0 / 35.0).abs() < 1e-12);
        assert_eq!(prior.density(&outside), 0.0);
        let mut rng = RngHandle::from_seed(3);
        for _ in 0..100 {
            assert!(prior.density(&prior.sample(&mut rng)) > 0.0);
        }
    }

    #[test]
    fn perturbed_model_never_leaves_range() {
        let kernel = ModelPerturbationKernel::new(3, 0.2).unwrap();
        let mut rng = RngHandle::from_seed(9);
        for _ in 0..200 {
            assert!(kernel.rvs(1, &mut rng) < 3);
        }
    }
}
