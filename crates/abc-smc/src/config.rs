use std::fs;
use std::path::Path;

use abc_core::errors::ErrorInfo;
use abc_core::AbcError;
use serde::{Deserialize, Serialize};

/// YAML-configurable settings governing an ABC-SMC run.
///
/// Distances, epsilons and acceptors are trait objects and are wired through
/// [`crate::AbcSmcBuilder`]; this struct carries the scalar knobs around
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Population size policy.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Stopping criteria passed to [`crate::AbcSmc::run_with`].
    #[serde(default)]
    pub stopping: StoppingConfig,
    /// Execution engine settings.
    #[serde(default)]
    pub sampler: SamplerConfig,
    /// Master seed and substream policy.
    #[serde(default)]
    pub seed_policy: SeedPolicy,
    /// Model perturbation kernel settings.
    #[serde(default)]
    pub model_perturbation: ModelPerturbationConfig,
    /// Default transition kernel settings.
    #[serde(default)]
    pub transition: TransitionConfig,
    /// Maximum number of summary statistics an adaptive distance sees per update.
    #[serde(default = "default_distance_update_cap")]
    pub max_number_particles_for_distance_update: usize,
}

fn default_distance_update_cap() -> usize {
    1000
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            population: PopulationConfig::default(),
            stopping: StoppingConfig::default(),
            sampler: SamplerConfig::default(),
            seed_policy: SeedPolicy::default(),
            model_perturbation: ModelPerturbationConfig::default(),
            transition: TransitionConfig::default(),
            max_number_particles_for_distance_update: default_distance_update_cap(),
        }
    }
}

impl RunConfig {
    /// Parses a configuration from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, AbcError> {
        serde_yaml::from_str(text)
            .map_err(|err| AbcError::Config(ErrorInfo::new("config-parse", err.to_string())))
    }

    /// Loads a configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, AbcError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            AbcError::Config(
                ErrorInfo::new("config-read", err.to_string())
                    .with_context("path", path.display()),
            )
        })?;
        Self::from_yaml_str(&contents).map_err(|err| match err {
            AbcError::Config(info) => AbcError::Config(info.with_context("path", path.display())),
            other => other,
        })
    }

    /// Serializes the configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, AbcError> {
        serde_yaml::to_string(self)
            .map_err(|err| AbcError::Serde(ErrorInfo::new("config-serialize", err.to_string())))
    }
}

/// Supported population size policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PopulationConfig {
    /// Same number of particles in every generation.
    Constant {
        /// Accepted particles per generation.
        #[serde(default = "default_population_size")]
        size: usize,
        /// Simulations per proposed parameter.
        #[serde(default = "default_samples_per_parameter")]
        samples_per_parameter: usize,
    },
    /// Size chosen from the bootstrap variability of the transition kernels.
    Adaptive {
        /// Size of the first generation.
        #[serde(default = "default_population_size")]
        start_size: usize,
        /// Target mean coefficient of variation of the proposal density.
        #[serde(default = "default_mean_cv")]
        mean_cv: f64,
        /// Lower bound on the population size.
        #[serde(default = "default_min_population")]
        min_size: usize,
        /// Upper bound on the population size.
        #[serde(default)]
        max_size: Option<usize>,
        /// Bootstrap repetitions per coefficient of variation estimate.
        #[serde(default = "default_n_bootstrap")]
        n_bootstrap: usize,
        /// Simulations per proposed parameter.
        #[serde(default = "default_samples_per_parameter")]
        samples_per_parameter: usize,
    },
}

fn default_population_size() -> usize {
    100
}

fn default_samples_per_parameter() -> usize {
    1
}

fn default_mean_cv() -> f64 {
    0.05
}

fn default_min_population() -> usize {
    10
}

fn default_n_bootstrap() -> usize {
    10
}

impl Default for PopulationConfig {
    fn default() -> Self {
        PopulationConfig::Constant {
            size: default_population_size(),
            samples_per_parameter: default_samples_per_parameter(),
        }
    }
}

/// Criteria checked after each generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoppingConfig {
    /// Stop once the threshold (or temperature) is at or below this value.
    #[serde(default)]
    pub minimum_epsilon: f64,
    /// Maximum number of generations sampled by one call to `run`.
    #[serde(default)]
    pub max_nr_populations: Option<usize>,
    /// Stop once the acceptance rate drops below this value.
    #[serde(default)]
    pub min_acceptance_rate: f64,
    /// Stop as soon as fewer than two models are alive.
    #[serde(default)]
    pub stop_if_only_single_model_alive: bool,
}

impl Default for StoppingConfig {
    fn default() -> Self {
        Self {
            minimum_epsilon: 0.0,
            max_nr_populations: None,
            min_acceptance_rate: 0.0,
            stop_if_only_single_model_alive: false,
        }
    }
}

/// Execution engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Worker threads; 0 or 1 selects the serial sampler.
    #[serde(default)]
    pub threads: usize,
    /// Evaluations scheduled per parallel batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Optional cap on evaluations per generation.
    #[serde(default)]
    pub max_evaluations: Option<usize>,
}

fn default_batch_size() -> usize {
    64
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            batch_size: default_batch_size(),
            max_evaluations: None,
        }
    }
}

/// Deterministic seeding configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPolicy {
    /// Master seed used for the run.
    #[serde(default = "default_master_seed")]
    pub master_seed: u64,
    /// Optional label recorded in the run metadata.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_master_seed() -> u64 {
    0x0ABC_5EED_0ABC_5EED_u64
}

impl Default for SeedPolicy {
    fn default() -> Self {
        Self {
            master_seed: default_master_seed(),
            label: None,
        }
    }
}

/// Model perturbation kernel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPerturbationConfig {
    /// Probability of keeping the source model.
    #[serde(default = "default_probability_to_stay")]
    pub probability_to_stay: f64,
}

fn default_probability_to_stay() -> f64 {
    0.7
}

impl Default for ModelPerturbationConfig {
    fn default() -> Self {
        Self {
            probability_to_stay: default_probability_to_stay(),
        }
    }
}

/// Bandwidth selectors for kernel density transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Bandwidth {
    /// Silverman's rule of thumb.
    Silverman,
    /// Scott's rule of thumb.
    Scott,
}

impl Default for Bandwidth {
    fn default() -> Self {
        Bandwidth::Silverman
    }
}

/// Default transition kernel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionConfig {
    /// Multiplier applied to the fitted covariance.
    #[serde(default = "default_scaling")]
    pub scaling: f64,
    /// Bandwidth selector.
    #[serde(default)]
    pub bandwidth: Bandwidth,
    /// Smallest kernel standard deviation per coordinate, relative to
    /// `max(1, |weighted mean|)`. Keeps single-particle and coincident fits
    /// from collapsing to a point mass.
    #[serde(default = "default_min_bandwidth")]
    pub min_bandwidth: f64,
}

fn default_scaling() -> f64 {
    1.0
}

fn default_min_bandwidth() -> f64 {
    0.05
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            scaling: default_scaling(),
            bandwidth: Bandwidth::default(),
            min_bandwidth: default_min_bandwidth(),
        }
    }
}
