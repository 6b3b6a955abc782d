//! Particles, populations and the sample returned by an execution engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{AbcError, ErrorInfo};
use crate::parameter::{ModelIndex, Parameter, SumStats};

/// Outcome of one proposal, possibly simulated several times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Model the parameter belongs to.
    pub m: ModelIndex,
    /// Proposed parameter.
    pub parameter: Parameter,
    /// Unnormalised importance weight.
    #[serde(with = "crate::floats::lenient")]
    pub weight: f64,
    /// Summary statistics of the accepted simulations.
    pub accepted_sum_stats: Vec<SumStats>,
    /// Distances (or kernel values) of the accepted simulations.
    #[serde(with = "crate::floats::lenient_vec")]
    pub accepted_distances: Vec<f64>,
    /// Summary statistics of the rejected simulations.
    pub rejected_sum_stats: Vec<SumStats>,
    /// Distances (or kernel values) of the rejected simulations.
    #[serde(with = "crate::floats::lenient_vec")]
    pub rejected_distances: Vec<f64>,
    /// Whether at least one simulation was accepted.
    pub accepted: bool,
}

impl Particle {
    /// Particle drawn from the prior during calibration.
    ///
    /// Its distance is unknown until the distance function is initialised,
    /// so it is recorded as infinite.
    pub fn from_prior(m: ModelIndex, parameter: Parameter, sum_stats: SumStats) -> Self {
        Self {
            m,
            parameter,
            weight: 1.0,
            accepted_sum_stats: vec![sum_stats],
            accepted_distances: vec![f64::INFINITY],
            rejected_sum_stats: Vec::new(),
            rejected_distances: Vec::new(),
            accepted: true,
        }
    }
}

/// Distance of one accepted simulation together with its normalised weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedDistance {
    /// Distance or kernel value.
    #[serde(with = "crate::floats::lenient")]
    pub distance: f64,
    /// Weight normalised over the whole population.
    pub weight: f64,
    /// Model of the particle the distance belongs to.
    pub m: ModelIndex,
}

/// Probability of every alive model in a population; sums to one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelProbabilities(BTreeMap<ModelIndex, f64>);

impl ModelProbabilities {
    /// Wraps an already normalised mapping.
    pub fn new(map: BTreeMap<ModelIndex, f64>) -> Self {
        Self(map)
    }

    /// Probability of `m`, zero when the model is extinct.
    pub fn get(&self, m: ModelIndex) -> f64 {
        self.0.get(&m).copied().unwrap_or(0.0)
    }

    /// Models with positive probability in ascending order.
    pub fn alive(&self) -> Vec<ModelIndex> {
        self.0
            .iter()
            .filter(|(_, p)| **p > 0.0)
            .map(|(m, _)| *m)
            .collect()
    }

    /// Whether `m` has positive probability.
    pub fn is_alive(&self, m: ModelIndex) -> bool {
        self.get(m) > 0.0
    }

    /// Iterates `(model, probability)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ModelIndex, f64)> + '_ {
        self.0.iter().map(|(m, p)| (*m, *p))
    }

    /// Dense vector of probabilities over `nr_models` models.
    pub fn to_dense(&self, nr_models: usize) -> Vec<f64> {
        (0..nr_models).map(|m| self.get(m)).collect()
    }

    /// Number of models tracked.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no model is tracked.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The accepted particles of one generation.
///
/// Particles keep their raw weights; normalisation happens in the derived
/// views. A non-empty population always holds at least one accepted
/// particle with positive total weight.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Population {
    particles: Vec<Particle>,
}

impl Population {
    /// Builds a population, enforcing the acceptance invariant.
    pub fn new(particles: Vec<Particle>) -> Result<Self, AbcError> {
        if !particles.is_empty() {
            if !particles.iter().any(|particle| particle.accepted) {
                return Err(AbcError::Population(
                    ErrorInfo::new(
                        "no-accepted-particle",
                        "a non-empty population needs at least one accepted particle",
                    )
                    .with_context("particles", particles.len()),
                ));
            }
            let total: f64 = particles.iter().map(|particle| particle.weight).sum();
            if !(total > 0.0) || !total.is_finite() {
                return Err(AbcError::Population(
                    ErrorInfo::new("invalid-total-weight", "population weights must sum to a positive finite value")
                        .with_context("total", total),
                ));
            }
        }
        Ok(Self { particles })
    }

    /// Particles in insertion order.
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.particles.len()
    }

    /// Whether the population is empty.
    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    fn model_totals(&self) -> BTreeMap<ModelIndex, f64> {
        let mut totals = BTreeMap::new();
        for particle in &self.particles {
            *totals.entry(particle.m).or_insert(0.0) += particle.weight;
        }
        totals
    }

    /// Probability of each model: summed weights normalised to one.
    pub fn model_probabilities(&self) -> ModelProbabilities {
        let totals = self.model_totals();
        let grand_total: f64 = totals.values().sum();
        if !(grand_total > 0.0) {
            return ModelProbabilities::default();
        }
        ModelProbabilities::new(
            totals
                .into_iter()
                .map(|(m, total)| (m, total / grand_total))
                .collect(),
        )
    }

    /// Every accepted summary statistic in particle order.
    pub fn accepted_sum_stats(&self) -> Vec<SumStats> {
        self.particles
            .iter()
            .flat_map(|particle| particle.accepted_sum_stats.iter().cloned())
            .collect()
    }

    /// Accepted distances with weights normalised over the population.
    ///
    /// A particle's weight is split evenly among its accepted distances.
    pub fn weighted_distances(&self) -> Vec<WeightedDistance> {
        let total: f64 = self.particles.iter().map(|particle| particle.weight).sum();
        let mut rows = Vec::new();
        if !(total > 0.0) {
            return rows;
        }
        for particle in &self.particles {
            let count = particle.accepted_distances.len();
            if count == 0 {
                continue;
            }
            let share = particle.weight / total / count as f64;
            for &distance in &particle.accepted_distances {
                rows.push(WeightedDistance {
                    distance,
                    weight: share,
                    m: particle.m,
                });
            }
        }
        rows
    }

    /// Parameters of model `m` and their weights normalised within that model.
    pub fn distribution(&self, m: ModelIndex) -> (Vec<Parameter>, Vec<f64>) {
        let members: Vec<&Particle> = self.particles.iter().filter(|p| p.m == m).collect();
        let total: f64 = members.iter().map(|p| p.weight).sum();
        let parameters = members.iter().map(|p| p.parameter.clone()).collect();
        let weights = members
            .iter()
            .map(|p| if total > 0.0 { p.weight / total } else { 0.0 })
            .collect();
        (parameters, weights)
    }

    /// Recomputes accepted distances, e.g. after the metric was recalibrated.
    pub fn update_distances<F>(&mut self, mut distance: F) -> Result<(), AbcError>
    where
        F: FnMut(&SumStats, &Parameter) -> Result<f64, AbcError>,
    {
        for particle in &mut self.particles {
            let mut updated = Vec::with_capacity(particle.accepted_sum_stats.len());
            for sum_stats in &particle.accepted_sum_stats {
                updated.push(distance(sum_stats, &particle.parameter)?);
            }
            particle.accepted_distances = updated;
        }
        Ok(())
    }
}

/// Raw result of sampling one generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    /// Particles in evaluation order (rejected ones included when retained).
    pub particles: Vec<Particle>,
    /// Number of proposal evaluations performed.
    pub nr_evaluations: usize,
}

impl Sample {
    /// Number of accepted particles.
    pub fn n_accepted(&self) -> usize {
        self.particles.iter().filter(|p| p.accepted).count()
    }

    /// Accepted particles assembled into a population.
    pub fn accepted_population(&self) -> Result<Population, AbcError> {
        Population::new(
            self.particles
                .iter()
                .filter(|particle| particle.accepted)
                .cloned()
                .collect(),
        )
    }

    /// Up to `n` accepted summary statistics in evaluation order.
    pub fn first_n_sum_stats(&self, n: usize) -> Vec<SumStats> {
        self.particles
            .iter()
            .filter(|particle| particle.accepted)
            .flat_map(|particle| particle.accepted_sum_stats.iter().cloned())
            .take(n)
            .collect()
    }
}
