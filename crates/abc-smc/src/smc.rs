//! The ABC-SMC orchestrator: calibration, the generation loop and the
//! stopping rules.

use std::collections::BTreeMap;

use abc_core::errors::ErrorInfo;
use abc_core::{
    AbcError, DynModel, History, Model, ModelIndex, ModelProbabilities, Parameter, Particle,
    Population, Prior, Retention, RngHandle, RunMetadata, SampleMarker, Sampler, SumStats,
    Transition, WeightedDistance,
};
use tracing::info;

use crate::acceptor::{Acceptor, UniformAcceptor};
use crate::config::{RunConfig, StoppingConfig};
use crate::determinism::{adaptation_seed, calibration_seed, generation_seed};
use crate::distance::{Distance, PNormDistance};
use crate::epsilon::{Epsilon, EpsilonContext, GenerationStats, QuantileEpsilon};
use crate::history::{RunHistory, StorageTarget};
use crate::population_strategy::{self, PopulationStrategy};
use crate::proposal::{unknown_model, ProposalContext};
use crate::random_variables::{ModelPerturbationKernel, ModelPrior};
use crate::sampler;
use crate::transition::MultivariateNormalTransition;

/// Optional ground truth and free-form information recorded with a new run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroundTruth {
    /// Model that generated the observed data.
    pub model: Option<ModelIndex>,
    /// Parameter that generated the observed data.
    pub parameter: Option<Parameter>,
    /// Additional information stored verbatim.
    pub meta_info: BTreeMap<String, String>,
}

fn no_run() -> AbcError {
    AbcError::Config(
        ErrorInfo::new("no-active-run", "call new or load before run")
            .with_hint("AbcSmc::new creates a run, AbcSmc::load reopens one"),
    )
}

fn mismatch(what: &str, expected: usize, found: usize) -> AbcError {
    AbcError::Config(
        ErrorInfo::new("component-count-mismatch", format!("one {what} per model is required"))
            .with_context("models", expected)
            .with_context(what, found),
    )
}

/// Assembles an [`AbcSmc`] and checks that its components fit together.
pub struct AbcSmcBuilder {
    config: RunConfig,
    models: Vec<Box<dyn DynModel>>,
    parameter_priors: Vec<Box<dyn Prior<Parameter>>>,
    model_prior: Option<ModelPrior>,
    transitions: Option<Vec<Box<dyn Transition>>>,
    distance: Option<Box<dyn Distance>>,
    eps: Option<Box<dyn Epsilon>>,
    acceptor: Option<Box<dyn Acceptor>>,
    population_strategy: Option<Box<dyn PopulationStrategy>>,
    sampler: Option<Box<dyn Sampler>>,
}

impl AbcSmcBuilder {
    /// Starts from `config`; every component not set explicitly is derived
    /// from it.
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            models: Vec::new(),
            parameter_priors: Vec::new(),
            model_prior: None,
            transitions: None,
            distance: None,
            eps: None,
            acceptor: None,
            population_strategy: None,
            sampler: None,
        }
    }

    /// Adds a model.
    pub fn model<M: Model + 'static>(mut self, model: M) -> Self {
        self.models.push(Box::new(model));
        self
    }

    /// Adds the parameter prior of the next model.
    pub fn parameter_prior(mut self, prior: impl Prior<Parameter> + 'static) -> Self {
        self.parameter_priors.push(Box::new(prior));
        self
    }

    /// Prior over model indices; uniform by default. Must cover exactly the
    /// registered models.
    pub fn model_prior(mut self, prior: ModelPrior) -> Self {
        self.model_prior = Some(prior);
        self
    }

    /// One transition kernel per model; Gaussian kernel density estimates by default.
    pub fn transitions(mut self, transitions: Vec<Box<dyn Transition>>) -> Self {
        self.transitions = Some(transitions);
        self
    }

    /// Distance or stochastic kernel; Euclidean distance by default.
    pub fn distance(mut self, distance: impl Distance + 'static) -> Self {
        self.distance = Some(Box::new(distance));
        self
    }

    /// Threshold scheduler; weighted median by default.
    pub fn epsilon(mut self, eps: impl Epsilon + 'static) -> Self {
        self.eps = Some(Box::new(eps));
        self
    }

    /// Acceptor; current-time uniform acceptance by default.
    pub fn acceptor(mut self, acceptor: impl Acceptor + 'static) -> Self {
        self.acceptor = Some(Box::new(acceptor));
        self
    }

    /// Population size strategy; taken from the configuration by default.
    pub fn population_strategy(mut self, strategy: impl PopulationStrategy + 'static) -> Self {
        self.population_strategy = Some(Box::new(strategy));
        self
    }

    /// Execution engine; taken from the configuration by default.
    pub fn sampler(mut self, sampler: impl Sampler + 'static) -> Self {
        self.sampler = Some(Box::new(sampler));
        self
    }

    /// Validates the components and builds the orchestrator.
    pub fn build(self) -> Result<AbcSmc, AbcError> {
        let nr_models = self.models.len();
        if nr_models == 0 {
            return Err(AbcError::Config(ErrorInfo::new(
                "no-models",
                "at least one model is required",
            )));
        }
        if self.parameter_priors.len() != nr_models {
            return Err(mismatch("parameter_priors", nr_models, self.parameter_priors.len()));
        }
        let transitions = match self.transitions {
            Some(transitions) => transitions,
            None => (0..nr_models)
                .map(|_| {
                    Box::new(MultivariateNormalTransition::new(self.config.transition.clone()))
                        as Box<dyn Transition>
                })
                .collect(),
        };
        if transitions.len() != nr_models {
            return Err(mismatch("transitions", nr_models, transitions.len()));
        }

        let distance = match self.distance {
            Some(distance) => distance,
            None => Box::new(PNormDistance::new(2.0)?),
        };
        let eps = self
            .eps
            .unwrap_or_else(|| Box::new(QuantileEpsilon::median()));
        let acceptor = self
            .acceptor
            .unwrap_or_else(|| Box::new(UniformAcceptor::current_time()));
        if (acceptor.requires_kernel() || eps.requires_kernel()) && distance.as_kernel().is_none() {
            return Err(AbcError::Config(
                ErrorInfo::new(
                    "kernel-required",
                    "stochastic acceptor and temperature need a stochastic kernel",
                )
                .with_context("acceptor", acceptor.requires_kernel())
                .with_context("epsilon", eps.requires_kernel()),
            ));
        }

        let population_strategy = match self.population_strategy {
            Some(strategy) => strategy,
            None => population_strategy::from_config(&self.config.population)?,
        };
        let sampler = match self.sampler {
            Some(sampler) => sampler,
            None => sampler::from_config(&self.config.sampler)?,
        };
        let model_prior = self
            .model_prior
            .unwrap_or_else(|| ModelPrior::uniform(nr_models));
        if model_prior.nr_models() != nr_models {
            return Err(AbcError::Config(
                ErrorInfo::new(
                    "model-prior-mismatch",
                    "model prior must cover exactly the registered models",
                )
                .with_context("nr_models", nr_models)
                .with_context("model_prior", model_prior.nr_models()),
            ));
        }
        let model_prior: Box<dyn Prior<ModelIndex>> = Box::new(model_prior);
        let model_perturbation = ModelPerturbationKernel::new(
            nr_models,
            self.config.model_perturbation.probability_to_stay,
        )?;

        Ok(AbcSmc {
            models: self.models,
            parameter_priors: self.parameter_priors,
            model_prior,
            model_perturbation,
            transitions,
            distance,
            eps,
            acceptor,
            population_strategy,
            sampler,
            history: None,
            x_0: SumStats::new(),
            calibration: None,
            initialized: false,
            config: self.config,
        })
    }
}

/// Lazily drawn prior sample used to calibrate distance, epsilon and
/// acceptor.
struct Calibration<'a> {
    cache: &'a mut Option<Population>,
    weighted: Option<Vec<WeightedDistance>>,
    models: &'a [Box<dyn DynModel>],
    parameter_priors: &'a [Box<dyn Prior<Parameter>>],
    model_prior: &'a dyn Prior<ModelIndex>,
    sampler: &'a mut dyn Sampler,
    history: &'a mut dyn History,
    seed: u64,
    nr_particles: usize,
}

impl Calibration<'_> {
    fn population(&mut self) -> Result<&Population, AbcError> {
        if self.cache.is_none() {
            let population = if self.history.max_t().is_some() {
                self.history.get_population(None)?
            } else {
                self.sample_from_prior()?
            };
            *self.cache = Some(population);
        }
        self.cache.as_ref().ok_or_else(no_run)
    }

    fn sample_from_prior(&mut self) -> Result<Population, AbcError> {
        let models = self.models;
        let parameter_priors = self.parameter_priors;
        let model_prior = self.model_prior;
        let simulate_one = |rng: &mut RngHandle| -> Result<Particle, AbcError> {
            let m = model_prior.sample(rng);
            let (model, prior) = models
                .get(m)
                .zip(parameter_priors.get(m))
                .ok_or_else(|| unknown_model(m, models.len()))?;
            let parameter = prior.sample(rng);
            let sum_stats = model.simulate_sum_stats(&parameter, rng)?;
            Ok(Particle::from_prior(m, parameter, sum_stats))
        };
        let sample = self.sampler.sample_until_n_accepted(
            self.nr_particles,
            &simulate_one,
            self.seed,
            Retention::AcceptedOnly,
        )?;
        info!(
            nr_particles = self.nr_particles,
            nr_evaluations = sample.nr_evaluations,
            "calibration sample drawn"
        );
        self.history
            .update_nr_samples(SampleMarker::Calibration, sample.nr_evaluations)?;
        sample.accepted_population()
    }

    fn sum_stats(&mut self) -> Result<Vec<SumStats>, AbcError> {
        Ok(self.population()?.accepted_sum_stats())
    }

    fn weighted_distances(
        &mut self,
        distance: &dyn Distance,
        x_0: &SumStats,
        t: usize,
    ) -> Result<Vec<WeightedDistance>, AbcError> {
        if let Some(rows) = &self.weighted {
            return Ok(rows.clone());
        }
        let mut population = self.population()?.clone();
        population.update_distances(|sum_stats, parameter| {
            distance.evaluate(sum_stats, x_0, t, parameter)
        })?;
        let rows = population.weighted_distances();
        self.weighted = Some(rows.clone());
        Ok(rows)
    }
}

/// Approximate Bayesian computation by sequential Monte Carlo.
///
/// Distance, epsilon, acceptor and transitions are mutated only between
/// generations; during sampling they are shared read-only through a
/// [`ProposalContext`].
pub struct AbcSmc {
    models: Vec<Box<dyn DynModel>>,
    parameter_priors: Vec<Box<dyn Prior<Parameter>>>,
    model_prior: Box<dyn Prior<ModelIndex>>,
    model_perturbation: ModelPerturbationKernel,
    transitions: Vec<Box<dyn Transition>>,
    distance: Box<dyn Distance>,
    eps: Box<dyn Epsilon>,
    acceptor: Box<dyn Acceptor>,
    population_strategy: Box<dyn PopulationStrategy>,
    sampler: Box<dyn Sampler>,
    history: Option<Box<dyn History>>,
    x_0: SumStats,
    calibration: Option<Population>,
    initialized: bool,
    config: RunConfig,
}

impl AbcSmc {
    /// Builder starting from `config`.
    pub fn builder(config: RunConfig) -> AbcSmcBuilder {
        AbcSmcBuilder::new(config)
    }

    /// Starts a new run observing `observed_sum_stats`; returns its id.
    pub fn new(
        &mut self,
        target: &StorageTarget,
        observed_sum_stats: SumStats,
        ground_truth: GroundTruth,
    ) -> Result<u64, AbcError> {
        let mut configuration = BTreeMap::new();
        configuration.insert("distance".to_string(), self.distance.config());
        configuration.insert("epsilon".to_string(), self.eps.config());
        configuration.insert("acceptor".to_string(), self.acceptor.describe());
        configuration.insert(
            "population_strategy".to_string(),
            self.population_strategy.config(),
        );
        let run_config = serde_json::to_value(&self.config).map_err(|err| {
            AbcError::Serde(ErrorInfo::new("config-serialize", err.to_string()))
        })?;
        configuration.insert("run".to_string(), run_config);

        let mut meta_info = ground_truth.meta_info;
        if let Some(label) = &self.config.seed_policy.label {
            meta_info.insert("seed_label".to_string(), label.clone());
        }
        let metadata = RunMetadata {
            observed_sum_stats: observed_sum_stats.clone(),
            ground_truth_model: ground_truth.model,
            ground_truth_parameter: ground_truth.parameter,
            model_names: self.model_names(),
            meta_info,
            configuration,
        };
        let history = RunHistory::create(target, metadata)?;
        let id = history.id();
        info!(id, "created run");
        self.attach(Box::new(history), observed_sum_stats);
        Ok(id)
    }

    /// Reopens run `id` for continuation, optionally replacing the observed
    /// statistics; returns the id.
    pub fn load(
        &mut self,
        target: &StorageTarget,
        id: u64,
        observed_sum_stats: Option<SumStats>,
    ) -> Result<u64, AbcError> {
        let mut history = RunHistory::load(target, id)?;
        if let Some(observed) = observed_sum_stats {
            history.set_observed_sum_stats(observed)?;
        }
        let observed = history.observed_sum_stats()?;
        info!(id, max_t = ?history.max_t(), "loaded run");
        self.attach(Box::new(history), observed);
        Ok(id)
    }

    /// Uses a caller supplied history store instead of [`RunHistory`].
    pub fn with_history(&mut self, history: Box<dyn History>) -> Result<(), AbcError> {
        let observed = history.observed_sum_stats()?;
        self.attach(history, observed);
        Ok(())
    }

    fn attach(&mut self, history: Box<dyn History>, observed: SumStats) {
        self.history = Some(history);
        self.x_0 = observed;
        self.calibration = None;
        self.initialized = false;
    }

    /// Names of the models in index order.
    pub fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|model| model.name().to_string()).collect()
    }

    /// Observed summary statistics of the active run.
    pub fn observed_sum_stats(&self) -> &SumStats {
        &self.x_0
    }

    /// History of the active run.
    pub fn history(&self) -> Option<&dyn History> {
        self.history.as_deref()
    }

    /// Threshold or temperature scheduler.
    pub fn epsilon(&self) -> &dyn Epsilon {
        self.eps.as_ref()
    }

    /// Distance or stochastic kernel.
    pub fn distance(&self) -> &dyn Distance {
        self.distance.as_ref()
    }

    /// Acceptor.
    pub fn acceptor(&self) -> &dyn Acceptor {
        self.acceptor.as_ref()
    }

    /// Runs generations until a stopping rule fires, using the configured
    /// `stop_if_only_single_model_alive`.
    pub fn run(
        &mut self,
        minimum_epsilon: f64,
        max_nr_populations: Option<usize>,
        min_acceptance_rate: f64,
    ) -> Result<&dyn History, AbcError> {
        let stopping = StoppingConfig {
            minimum_epsilon,
            max_nr_populations,
            min_acceptance_rate,
            stop_if_only_single_model_alive: self.config.stopping.stop_if_only_single_model_alive,
        };
        self.run_with(&stopping)
    }

    /// Runs generations until a rule of `stopping` fires.
    ///
    /// Calling it again continues at the generation after the last stored one.
    pub fn run_with(&mut self, stopping: &StoppingConfig) -> Result<&dyn History, AbcError> {
        let t0 = {
            let history = self.history.as_deref_mut().ok_or_else(no_run)?;
            history.start()?;
            history.max_t().map_or(0, |t| t + 1)
        };
        if !self.initialized {
            self.initialize_components(t0, stopping.max_nr_populations)?;
            self.initialized = true;
        }

        let end = stopping.max_nr_populations.map(|n| t0 + n);
        let mut t = t0;
        while end.map_or(true, |end| t < end) {
            let stop = self.run_generation(t, stopping)?;
            t += 1;
            if stop {
                break;
            }
        }

        let history = self.history.as_deref_mut().ok_or_else(no_run)?;
        history.done()?;
        info!(
            id = history.id(),
            generations = history.n_populations(),
            total_simulations = history.total_nr_simulations(),
            "run finished"
        );
        Ok(&*history)
    }

    fn initialize_components(
        &mut self,
        t0: usize,
        max_nr_populations: Option<usize>,
    ) -> Result<(), AbcError> {
        let AbcSmc {
            models,
            parameter_priors,
            model_prior,
            distance,
            eps,
            acceptor,
            population_strategy,
            sampler,
            history,
            x_0,
            calibration,
            config,
            ..
        } = self;
        let history = history.as_deref_mut().ok_or_else(no_run)?;
        let x_0: &SumStats = x_0;
        let mut source = Calibration {
            cache: calibration,
            weighted: None,
            models: models.as_slice(),
            parameter_priors: parameter_priors.as_slice(),
            model_prior: &**model_prior,
            sampler: &mut **sampler,
            history,
            seed: calibration_seed(config.seed_policy.master_seed),
            nr_particles: population_strategy.nr_particles(),
        };

        distance.initialize(t0, &mut || source.sum_stats(), x_0)?;
        let distance: &dyn Distance = &**distance;
        acceptor.initialize(
            t0,
            &mut || source.weighted_distances(distance, x_0, t0),
            distance,
            x_0,
        )?;
        let context = EpsilonContext {
            max_nr_populations,
            acceptor_config: acceptor.config(t0),
        };
        eps.initialize(
            t0,
            &mut || source.weighted_distances(distance, x_0, t0),
            &context,
        )?;
        Ok(())
    }

    /// Samples generation `t` and prepares generation `t + 1`; returns
    /// whether a stopping rule fired.
    fn run_generation(&mut self, t: usize, stopping: &StoppingConfig) -> Result<bool, AbcError> {
        let model_names = self.model_names();
        let AbcSmc {
            models,
            parameter_priors,
            model_prior,
            model_perturbation,
            transitions,
            distance,
            eps,
            acceptor,
            population_strategy,
            sampler,
            history,
            x_0,
            config,
            ..
        } = self;
        let history = history.as_deref_mut().ok_or_else(no_run)?;
        let x_0: &SumStats = x_0;
        let master_seed = config.seed_policy.master_seed;

        let current_eps = eps.value(t)?;
        info!(t, epsilon = current_eps, "starting generation");

        let model_probabilities = if t == 0 {
            ModelProbabilities::default()
        } else {
            let probabilities = history.get_model_probabilities(t - 1)?;
            for m in probabilities.alive() {
                let (parameters, weights) = history.get_distribution(m, t - 1)?;
                let nr_models = transitions.len();
                transitions
                    .get_mut(m)
                    .ok_or_else(|| unknown_model(m, nr_models))?
                    .fit(&parameters, &weights)?;
            }
            let mut rng = RngHandle::from_seed(adaptation_seed(master_seed, t));
            population_strategy.adapt(
                t,
                transitions,
                &probabilities.to_dense(models.len()),
                &mut rng,
            )?;
            probabilities
        };

        let context = ProposalContext {
            models: models.as_slice(),
            parameter_priors: parameter_priors.as_slice(),
            model_prior: &**model_prior,
            model_perturbation,
            transitions: transitions.as_slice(),
            distance: &**distance,
            eps: &**eps,
            acceptor: &**acceptor,
            x_0,
            t,
            model_probabilities,
            nr_samples_per_parameter: population_strategy.nr_samples_per_parameter(),
        };
        let simulate_one = |rng: &mut RngHandle| context.simulate_one(rng);
        let sample = sampler.sample_until_n_accepted(
            population_strategy.nr_particles(),
            &simulate_one,
            generation_seed(master_seed, t),
            Retention::All,
        )?;
        let records = context.weighted_records(&sample.particles)?;

        let mut population = sample.accepted_population()?;
        history.append_population(
            t,
            current_eps,
            &population,
            sample.nr_evaluations,
            &model_names,
        )?;
        let acceptance_rate = population.len() as f64 / sample.nr_evaluations.max(1) as f64;
        info!(
            t,
            acceptance_rate,
            nr_evaluations = sample.nr_evaluations,
            nr_particles = population.len(),
            "generation done"
        );

        let sum_stats = sample.first_n_sum_stats(config.max_number_particles_for_distance_update);
        if distance.update(t + 1, &sum_stats)? {
            let distance: &dyn Distance = &**distance;
            population.update_distances(|stats, parameter| {
                distance.evaluate(stats, x_0, t + 1, parameter)
            })?;
        }
        let weighted_distances = population.weighted_distances();
        acceptor.update(t + 1, &weighted_distances, &**distance, acceptance_rate)?;
        eps.update(
            t + 1,
            &weighted_distances,
            &GenerationStats {
                acceptance_rate,
                acceptor_config: acceptor.config(t + 1),
                records: &records,
            },
        )?;

        if current_eps <= stopping.minimum_epsilon {
            info!(t, epsilon = current_eps, "minimum epsilon reached");
            return Ok(true);
        }
        if stopping.stop_if_only_single_model_alive && history.nr_of_models_alive()? <= 1 {
            info!(t, "only one model alive");
            return Ok(true);
        }
        if acceptance_rate < stopping.min_acceptance_rate {
            info!(t, acceptance_rate, "acceptance rate below minimum");
            return Ok(true);
        }
        Ok(false)
    }
}
