//! Capability contracts consumed by the orchestrator.
//!
//! Simulators, priors, transition kernels, execution engines and history
//! stores are external collaborators; the core only talks to them through
//! these traits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::AbcError;
use crate::parameter::{ModelIndex, Parameter, SumStats};
use crate::population::{ModelProbabilities, Particle, Population, Sample};
use crate::rng::RngHandle;

/// A stochastic simulator together with its summary statistic reducer.
pub trait Model: Send + Sync {
    /// Raw simulator output.
    type Output;

    /// Name recorded in the history.
    fn name(&self) -> &str;

    /// Simulates raw output for `parameter`.
    fn simulate(&self, parameter: &Parameter, rng: &mut RngHandle)
        -> Result<Self::Output, AbcError>;

    /// Reduces raw output to summary statistics.
    fn summary_statistics(&self, raw: Self::Output) -> Result<SumStats, AbcError>;
}

/// Object-safe view of a [`Model`] with the raw output type erased.
///
/// Every [`Model`] implements it, so heterogeneous models can share one
/// `Vec<Box<dyn DynModel>>`.
pub trait DynModel: Send + Sync {
    /// Name recorded in the history.
    fn name(&self) -> &str;

    /// Simulates and reduces in one step.
    fn simulate_sum_stats(
        &self,
        parameter: &Parameter,
        rng: &mut RngHandle,
    ) -> Result<SumStats, AbcError>;
}

impl<M: Model> DynModel for M {
    fn name(&self) -> &str {
        Model::name(self)
    }

    fn simulate_sum_stats(
        &self,
        parameter: &Parameter,
        rng: &mut RngHandle,
    ) -> Result<SumStats, AbcError> {
        let raw = self.simulate(parameter, rng)?;
        self.summary_statistics(raw)
    }
}

/// Sampling and density evaluation over values of type `T`.
pub trait Prior<T>: Send + Sync {
    /// Draws a value.
    fn sample(&self, rng: &mut RngHandle) -> T;

    /// Density (or mass) at `value`; never negative.
    fn density(&self, value: &T) -> f64;
}

/// Per-model proposal density fitted from a weighted population.
///
/// Fitting happens strictly between generations; sampling and density
/// evaluation take `&self` and may run concurrently.
pub trait Transition: Send + Sync {
    /// Fits the kernel to weighted particles.
    fn fit(&mut self, particles: &[Parameter], weights: &[f64]) -> Result<(), AbcError>;

    /// Draws a perturbed parameter.
    fn rvs(&self, rng: &mut RngHandle) -> Result<Parameter, AbcError>;

    /// Proposal density at `parameter`.
    fn pdf(&self, parameter: &Parameter) -> Result<f64, AbcError>;

    /// Particles and weights of the last fit, if any.
    fn fitted_data(&self) -> Option<(&[Parameter], &[f64])>;

    /// Independent copy used for throwaway refits (bootstrapping).
    fn clone_box(&self) -> Box<dyn Transition>;
}

/// Which evaluations a sampler keeps in its [`Sample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Retention {
    /// Keep rejected evaluations as well.
    All,
    /// Keep accepted evaluations only.
    AcceptedOnly,
}

/// Self-contained proposal, simulation and acceptance step.
pub type SimulateOne<'a> = dyn Fn(&mut RngHandle) -> Result<Particle, AbcError> + Sync + 'a;

/// Execution engine running the per-generation closure until enough
/// particles are accepted.
pub trait Sampler: Send {
    /// Runs `simulate_one` until `n` particles are accepted.
    ///
    /// Evaluation `i` must use the RNG substream `i` of `seed` so that
    /// results do not depend on scheduling.
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        simulate_one: &SimulateOne<'_>,
        seed: u64,
        retention: Retention,
    ) -> Result<Sample, AbcError>;

    /// Evaluations performed by the last call.
    fn nr_evaluations(&self) -> usize;
}

/// Marker under which evaluation counts are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SampleMarker {
    /// Prior sample drawn to calibrate distance, epsilon and acceptor.
    Calibration,
    /// A regular generation.
    Generation(usize),
}

/// Metadata stored when a run is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Observed summary statistics.
    pub observed_sum_stats: SumStats,
    /// Ground truth model, if the data were synthetic.
    #[serde(default)]
    pub ground_truth_model: Option<ModelIndex>,
    /// Ground truth parameter, if the data were synthetic.
    #[serde(default)]
    pub ground_truth_parameter: Option<Parameter>,
    /// Names of the models in index order.
    #[serde(default)]
    pub model_names: Vec<String>,
    /// Free-form meta information.
    #[serde(default)]
    pub meta_info: BTreeMap<String, String>,
    /// JSON description of the configured components.
    #[serde(default)]
    pub configuration: BTreeMap<String, serde_json::Value>,
}

/// Per-generation bookkeeping kept next to the population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    /// Generation index.
    pub t: usize,
    /// Threshold or temperature used for the generation.
    #[serde(with = "crate::floats::lenient")]
    pub epsilon: f64,
    /// Evaluations needed to fill the generation.
    pub nr_evaluations: usize,
    /// Accepted particles.
    pub population_size: usize,
}

/// Append-only store of populations and run metadata.
pub trait History: Send {
    /// Identifier of the run.
    fn id(&self) -> u64;

    /// Records the metadata of a fresh run.
    fn store_initial_data(&mut self, metadata: RunMetadata) -> Result<(), AbcError>;

    /// Observed summary statistics recorded at creation.
    fn observed_sum_stats(&self) -> Result<SumStats, AbcError>;

    /// Last stored generation, `None` for an empty run.
    fn max_t(&self) -> Option<usize>;

    /// Number of stored populations.
    fn n_populations(&self) -> usize;

    /// Appends the population of generation `t`.
    fn append_population(
        &mut self,
        t: usize,
        epsilon: f64,
        population: &Population,
        nr_evaluations: usize,
        model_names: &[String],
    ) -> Result<(), AbcError>;

    /// Population of generation `t`, or the latest one when `t` is `None`.
    fn get_population(&self, t: Option<usize>) -> Result<Population, AbcError>;

    /// Model probabilities of generation `t`.
    fn get_model_probabilities(&self, t: usize) -> Result<ModelProbabilities, AbcError> {
        Ok(self.get_population(Some(t))?.model_probabilities())
    }

    /// Parameters and within-model weights of model `m` at generation `t`.
    fn get_distribution(
        &self,
        m: ModelIndex,
        t: usize,
    ) -> Result<(Vec<Parameter>, Vec<f64>), AbcError> {
        Ok(self.get_population(Some(t))?.distribution(m))
    }

    /// Models alive at generation `t`.
    fn alive_models(&self, t: usize) -> Result<Vec<ModelIndex>, AbcError> {
        Ok(self.get_model_probabilities(t)?.alive())
    }

    /// Number of models alive in the latest generation.
    fn nr_of_models_alive(&self) -> Result<usize, AbcError> {
        match self.max_t() {
            Some(t) => Ok(self.alive_models(t)?.len()),
            None => Ok(0),
        }
    }

    /// Records an evaluation count under `marker`.
    fn update_nr_samples(&mut self, marker: SampleMarker, count: usize) -> Result<(), AbcError>;

    /// Total number of simulations including calibration.
    fn total_nr_simulations(&self) -> usize;

    /// Bookkeeping of every stored generation in order.
    fn generations(&self) -> Vec<GenerationSummary>;

    /// Marks the start of a (possibly resumed) run.
    fn start(&mut self) -> Result<(), AbcError>;

    /// Marks the end of a run.
    fn done(&mut self) -> Result<(), AbcError>;
}
