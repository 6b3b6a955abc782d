//! The self-contained proposal, simulation and acceptance step handed to
//! the sampler.
//!
//! A [`ProposalContext`] only borrows the calibrated components immutably,
//! so they cannot change while a generation is being sampled.

use abc_core::errors::ErrorInfo;
use abc_core::{
    weighted_choice, AbcError, DynModel, ModelIndex, ModelProbabilities, Parameter, Particle,
    Prior, RngHandle, SumStats, Transition,
};
use tracing::warn;

use crate::acceptor::Acceptor;
use crate::distance::Distance;
use crate::epsilon::Epsilon;
use crate::random_variables::ModelPerturbationKernel;

/// Read-only snapshot of everything one evaluation needs.
pub struct ProposalContext<'a> {
    pub(crate) models: &'a [Box<dyn DynModel>],
    pub(crate) parameter_priors: &'a [Box<dyn Prior<Parameter>>],
    pub(crate) model_prior: &'a dyn Prior<ModelIndex>,
    pub(crate) model_perturbation: &'a ModelPerturbationKernel,
    pub(crate) transitions: &'a [Box<dyn Transition>],
    pub(crate) distance: &'a dyn Distance,
    pub(crate) eps: &'a dyn Epsilon,
    pub(crate) acceptor: &'a dyn Acceptor,
    pub(crate) x_0: &'a SumStats,
    pub(crate) t: usize,
    pub(crate) model_probabilities: ModelProbabilities,
    pub(crate) nr_samples_per_parameter: usize,
}

/// Error for a model index with no registered model behind it.
pub(crate) fn unknown_model(m: ModelIndex, nr_models: usize) -> AbcError {
    AbcError::Config(
        ErrorInfo::new("unknown-model", "model index has no registered model")
            .with_context("m", m)
            .with_context("nr_models", nr_models),
    )
}

fn component<T>(items: &[T], m: ModelIndex) -> Result<&T, AbcError> {
    items.get(m).ok_or_else(|| unknown_model(m, items.len()))
}

struct Evaluation {
    accepted_sum_stats: Vec<SumStats>,
    accepted_distances: Vec<f64>,
    accepted_weights: Vec<f64>,
    rejected_sum_stats: Vec<SumStats>,
    rejected_distances: Vec<f64>,
}

impl<'a> ProposalContext<'a> {
    /// Draws a model and parameter with positive prior density.
    ///
    /// Loops until such a proposal is found; degenerate priors make this
    /// loop forever.
    pub fn generate_valid_proposal(
        &self,
        rng: &mut RngHandle,
    ) -> Result<(ModelIndex, Parameter), AbcError> {
        if self.t == 0 {
            let m = self.model_prior.sample(rng);
            let parameter = component(self.parameter_priors, m)?.sample(rng);
            return Ok((m, parameter));
        }

        let alive = self.model_probabilities.alive();
        if alive.is_empty() {
            return Err(AbcError::Population(ErrorInfo::new(
                "no-alive-model",
                "previous population left no model alive",
            )));
        }
        let weights: Vec<f64> = alive.iter().map(|m| self.model_probabilities.get(*m)).collect();
        loop {
            let m = if alive.len() > 1 {
                let source = match weighted_choice(&weights, rng) {
                    Some(idx) => alive[idx],
                    None => continue,
                };
                let perturbed = self.model_perturbation.rvs(source, rng);
                if !self.model_probabilities.is_alive(perturbed) {
                    continue;
                }
                perturbed
            } else {
                alive[0]
            };
            let parameter = component(self.transitions, m)?.rvs(rng)?;
            let prior = component(self.parameter_priors, m)?;
            if self.model_prior.density(&m) * prior.density(&parameter) > 0.0 {
                return Ok((m, parameter));
            }
        }
    }

    fn evaluate(
        &self,
        m: ModelIndex,
        parameter: &Parameter,
        rng: &mut RngHandle,
    ) -> Result<Evaluation, AbcError> {
        let mut evaluation = Evaluation {
            accepted_sum_stats: Vec::new(),
            accepted_distances: Vec::new(),
            accepted_weights: Vec::new(),
            rejected_sum_stats: Vec::new(),
            rejected_distances: Vec::new(),
        };
        let model = component(self.models, m)?;
        for _ in 0..self.nr_samples_per_parameter {
            let sum_stats = model.simulate_sum_stats(parameter, rng)?;
            let result = self.acceptor.accept(
                self.distance,
                self.eps,
                &sum_stats,
                self.x_0,
                self.t,
                parameter,
                rng,
            )?;
            if result.accept {
                evaluation.accepted_sum_stats.push(sum_stats);
                evaluation.accepted_distances.push(result.distance);
                evaluation.accepted_weights.push(result.weight);
            } else {
                evaluation.rejected_sum_stats.push(sum_stats);
                evaluation.rejected_distances.push(result.distance);
            }
        }
        Ok(evaluation)
    }

    /// Prior over proposal density at `(m, parameter)`, `None` when the
    /// proposal density vanishes. Equals one in generation 0, where the
    /// proposal is the prior.
    pub fn importance_ratio(
        &self,
        m: ModelIndex,
        parameter: &Parameter,
    ) -> Result<Option<f64>, AbcError> {
        if self.t == 0 {
            return Ok(Some(1.0));
        }
        let normalization = self.proposal_density(m, parameter)?;
        if !(normalization > 0.0) {
            return Ok(None);
        }
        let prior =
            self.model_prior.density(&m) * component(self.parameter_priors, m)?.density(parameter);
        Ok(Some(prior / normalization))
    }

    fn proposal_density(&self, m: ModelIndex, parameter: &Parameter) -> Result<f64, AbcError> {
        let model_factor: f64 = self
            .model_probabilities
            .iter()
            .map(|(source, p)| p * self.model_perturbation.pmf(m, source))
            .sum();
        let particle_factor = component(self.transitions, m)?.pdf(parameter)?;
        Ok(model_factor * particle_factor)
    }

    /// Importance weight of an accepted proposal, `None` when the proposal
    /// density normalisation vanishes.
    pub fn weight(
        &self,
        m: ModelIndex,
        parameter: &Parameter,
        n_accepted: usize,
        acceptor_weights: &[f64],
    ) -> Result<Option<f64>, AbcError> {
        let fraction = n_accepted as f64 / self.nr_samples_per_parameter as f64;
        if self.t == 0 {
            return Ok(Some(fraction));
        }
        let ratio = match self.importance_ratio(m, parameter)? {
            Some(ratio) => ratio,
            None => {
                warn!(t = self.t, m, "proposal density vanishes, rejecting particle");
                return Ok(None);
            }
        };
        let acceptor_factor: f64 = acceptor_weights.iter().product();
        Ok(Some(ratio * fraction * acceptor_factor))
    }

    /// Kernel values of every evaluation in `particles`, each paired with
    /// the importance ratio of the proposal that produced it.
    pub fn weighted_records(&self, particles: &[Particle]) -> Result<Vec<(f64, f64)>, AbcError> {
        let mut records = Vec::new();
        for particle in particles {
            let ratio = self
                .importance_ratio(particle.m, &particle.parameter)?
                .unwrap_or(0.0);
            records.extend(
                particle
                    .accepted_distances
                    .iter()
                    .chain(&particle.rejected_distances)
                    .map(|&value| (value, ratio)),
            );
        }
        Ok(records)
    }

    /// Proposes, simulates and weighs one particle.
    pub fn simulate_one(&self, rng: &mut RngHandle) -> Result<Particle, AbcError> {
        let (m, parameter) = self.generate_valid_proposal(rng)?;
        let mut evaluation = self.evaluate(m, &parameter, rng)?;
        let n_accepted = evaluation.accepted_distances.len();

        let weight = if n_accepted > 0 {
            self.weight(m, &parameter, n_accepted, &evaluation.accepted_weights)?
                .filter(|w| *w > 0.0)
        } else {
            None
        };

        let accepted = weight.is_some();
        if !accepted {
            evaluation
                .rejected_sum_stats
                .append(&mut evaluation.accepted_sum_stats);
            evaluation
                .rejected_distances
                .append(&mut evaluation.accepted_distances);
        }

        Ok(Particle {
            m,
            parameter,
            weight: weight.unwrap_or(0.0),
            accepted_sum_stats: evaluation.accepted_sum_stats,
            accepted_distances: evaluation.accepted_distances,
            rejected_sum_stats: evaluation.rejected_sum_stats,
            rejected_distances: evaluation.rejected_distances,
            accepted,
        })
    }
}
