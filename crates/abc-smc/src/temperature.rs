//! Temperature scheduling for stochastic acceptance.
//!
//! Each generation a set of schemes proposes a temperature; the proposals
//! are aggregated and the result is clamped so that temperatures never
//! increase and never drop below one. The final generation of a bounded run
//! always uses temperature one, where acceptance reduces to the plain
//! density ratio.

use std::collections::BTreeMap;

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, WeightedDistance};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::acceptor::AcceptorConfig;
use crate::distance::KernelScale;
use crate::epsilon::{Epsilon, EpsilonContext, GenerationStats, WeightedDistanceSource};

const BISECTION_LOWER: f64 = -100.0;
const BISECTION_STEPS: usize = 100;

/// Everything a scheme may look at when proposing a temperature.
#[derive(Debug, Clone, Copy)]
pub struct SchemeInput<'a> {
    /// Generation the temperature is proposed for.
    pub t: usize,
    /// Last generation of the run, if bounded.
    pub max_t: Option<usize>,
    /// Temperature of the previous generation.
    pub prev_temperature: Option<f64>,
    /// Kernel values with the importance weights of their proposals.
    pub records: &'a [(f64, f64)],
    /// Acceptor normalisation in effect for generation `t`.
    pub acceptor_config: Option<AcceptorConfig>,
    /// Acceptance rate of the previous generation.
    pub acceptance_rate: f64,
}

/// A pure rule proposing the next temperature.
pub trait TemperatureScheme: Send + Sync {
    /// Proposed temperature; may be infinite when the scheme has no opinion.
    fn propose(&self, input: &SchemeInput<'_>) -> Result<f64, AbcError>;

    /// Name used in logs and run metadata.
    fn name(&self) -> &'static str;
}

/// Picks the temperature at which the expected acceptance rate of the last
/// kernel values hits a target.
///
/// Solves for `b = ln(1 / T)` by bisection on `[-100, 0]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceRateScheme {
    /// Targeted acceptance rate.
    pub target_rate: f64,
}

impl Default for AcceptanceRateScheme {
    fn default() -> Self {
        Self { target_rate: 0.3 }
    }
}

fn expected_rate(records: &[(f64, f64)], config: AcceptorConfig, b: f64) -> f64 {
    let beta = b.exp();
    let total: f64 = records.iter().map(|(_, w)| w).sum();
    if !(total > 0.0) {
        return 0.0;
    }
    records
        .iter()
        .map(|&(pd, w)| {
            let acceptance = match config.kernel_scale {
                KernelScale::Lin => {
                    if config.pdf_norm > 0.0 {
                        (pd / config.pdf_norm).max(0.0).powf(beta)
                    } else {
                        0.0
                    }
                }
                KernelScale::Log => ((pd - config.pdf_norm) * beta).exp(),
            };
            w / total * acceptance.min(1.0)
        })
        .sum()
}

impl TemperatureScheme for AcceptanceRateScheme {
    fn propose(&self, input: &SchemeInput<'_>) -> Result<f64, AbcError> {
        let config = input.acceptor_config.ok_or_else(|| {
            AbcError::Config(ErrorInfo::new(
                "missing-acceptor-config",
                "acceptance rate scheme needs a stochastic acceptor",
            ))
        })?;
        if input.records.is_empty() {
            return Ok(f64::INFINITY);
        }
        if expected_rate(input.records, config, 0.0) >= self.target_rate {
            return Ok(1.0);
        }
        let mut low = BISECTION_LOWER;
        let mut high = 0.0;
        if expected_rate(input.records, config, low) < self.target_rate {
            return Ok((-low).exp());
        }
        for _ in 0..BISECTION_STEPS {
            let mid = 0.5 * (low + high);
            if expected_rate(input.records, config, mid) >= self.target_rate {
                low = mid;
            } else {
                high = mid;
            }
        }
        Ok((-low).exp())
    }

    fn name(&self) -> &'static str {
        "acceptance-rate"
    }
}

fn generations_to_go(input: &SchemeInput<'_>, scheme: &str) -> Result<f64, AbcError> {
    let max_t = input.max_t.ok_or_else(|| {
        AbcError::Config(
            ErrorInfo::new("unbounded-decay", "fixed-iteration decay needs a generation bound")
                .with_context("scheme", scheme),
        )
    })?;
    Ok((max_t + 1).saturating_sub(input.t) as f64)
}

/// Exponential decay reaching one exactly at the final generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpDecayFixedIterScheme;

impl TemperatureScheme for ExpDecayFixedIterScheme {
    fn propose(&self, input: &SchemeInput<'_>) -> Result<f64, AbcError> {
        let t_to_go = generations_to_go(input, self.name())?;
        match input.prev_temperature {
            None => Ok(f64::INFINITY),
            Some(_) if t_to_go <= 1.0 => Ok(1.0),
            Some(prev) => Ok(prev.powf((t_to_go - 1.0) / t_to_go)),
        }
    }

    fn name(&self) -> &'static str {
        "exp-decay-fixed-iter"
    }
}

/// Multiplies the previous temperature by a fixed ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpDecayFixedRatioScheme {
    /// Decay ratio in `(0, 1)`.
    pub alpha: f64,
}

impl Default for ExpDecayFixedRatioScheme {
    fn default() -> Self {
        Self { alpha: 0.5 }
    }
}

impl TemperatureScheme for ExpDecayFixedRatioScheme {
    fn propose(&self, input: &SchemeInput<'_>) -> Result<f64, AbcError> {
        Ok(input
            .prev_temperature
            .map(|prev| self.alpha * prev)
            .unwrap_or(f64::INFINITY))
    }

    fn name(&self) -> &'static str {
        "exp-decay-fixed-ratio"
    }
}

/// Polynomial decay of `T - 1` reaching zero at the final generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolynomialDecayFixedIterScheme {
    /// Exponent of the decay.
    pub exponent: f64,
}

impl Default for PolynomialDecayFixedIterScheme {
    fn default() -> Self {
        Self { exponent: 3.0 }
    }
}

impl TemperatureScheme for PolynomialDecayFixedIterScheme {
    fn propose(&self, input: &SchemeInput<'_>) -> Result<f64, AbcError> {
        let t_to_go = generations_to_go(input, self.name())?;
        match input.prev_temperature {
            None => Ok(f64::INFINITY),
            Some(_) if t_to_go <= 1.0 => Ok(1.0),
            Some(prev) => {
                Ok((prev - 1.0) * ((t_to_go - 1.0) / t_to_go).powf(self.exponent) + 1.0)
            }
        }
    }

    fn name(&self) -> &'static str {
        "polynomial-decay-fixed-iter"
    }
}

/// How scheme proposals are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Aggregation {
    /// Smallest proposal.
    #[default]
    Min,
    /// Largest finite proposal.
    Max,
    /// Mean of the finite proposals.
    Mean,
}

impl Aggregation {
    fn apply(self, proposals: &[f64]) -> f64 {
        let finite: Vec<f64> = proposals.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return f64::INFINITY;
        }
        match self {
            Aggregation::Min => finite.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => finite.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Mean => finite.iter().sum::<f64>() / finite.len() as f64,
        }
    }
}

/// Temperature scheduler for use with a stochastic acceptor.
pub struct Temperature {
    schemes: Vec<Box<dyn TemperatureScheme>>,
    aggregation: Aggregation,
    initial_temperature: Option<f64>,
    max_t: Option<usize>,
    temperatures: BTreeMap<usize, f64>,
}

impl Default for Temperature {
    fn default() -> Self {
        Self::new()
    }
}

impl Temperature {
    /// Scheduler with the default scheme set, chosen at initialisation.
    pub fn new() -> Self {
        Self {
            schemes: Vec::new(),
            aggregation: Aggregation::Min,
            initial_temperature: None,
            max_t: None,
            temperatures: BTreeMap::new(),
        }
    }

    /// Adds a scheme; any explicit scheme disables the default set.
    pub fn with_scheme(mut self, scheme: impl TemperatureScheme + 'static) -> Self {
        self.schemes.push(Box::new(scheme));
        self
    }

    /// Combination rule for the proposals.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Temperature of the first generation, used instead of the schemes.
    pub fn with_initial_temperature(mut self, temperature: f64) -> Self {
        self.initial_temperature = Some(temperature);
        self
    }

    /// Final generation index, once initialised with a bound.
    pub fn max_t(&self) -> Option<usize> {
        self.max_t
    }

    /// Recorded temperatures by generation.
    pub fn temperatures(&self) -> &BTreeMap<usize, f64> {
        &self.temperatures
    }

    fn compute(
        &mut self,
        t: usize,
        records: &[(f64, f64)],
        acceptor_config: Option<AcceptorConfig>,
        acceptance_rate: f64,
    ) -> Result<(), AbcError> {
        let prev_temperature = self.temperatures.values().next_back().copied();

        let temperature = if self.max_t.map_or(false, |max_t| t >= max_t) {
            1.0
        } else if let (None, Some(initial)) = (prev_temperature, self.initial_temperature) {
            initial
        } else {
            let input = SchemeInput {
                t,
                max_t: self.max_t,
                prev_temperature,
                records,
                acceptor_config,
                acceptance_rate,
            };
            let mut proposals = Vec::with_capacity(self.schemes.len());
            for scheme in &self.schemes {
                let proposal = scheme.propose(&input)?;
                debug!(t, scheme = scheme.name(), proposal, "temperature proposal");
                proposals.push(proposal);
            }
            let mut value = self.aggregation.apply(&proposals);
            if let Some(prev) = prev_temperature {
                value = value.min(prev);
            }
            value.max(1.0)
        };

        if !temperature.is_finite() {
            return Err(AbcError::Config(
                ErrorInfo::new("non-finite-temperature", "no scheme produced a finite temperature")
                    .with_context("t", t)
                    .with_hint("configure an initial temperature or an acceptance rate scheme"),
            ));
        }
        info!(t, temperature, "temperature");
        self.temperatures.insert(t, temperature);
        Ok(())
    }
}

impl Epsilon for Temperature {
    /// Fixes the final generation `t + max_nr_populations - 1` and, unless
    /// schemes were given explicitly, picks the default scheme set.
    ///
    /// Without a generation bound there is no final generation to force to
    /// one. The default set then pairs the acceptance rate scheme with
    /// [`ExpDecayFixedRatioScheme`], so the temperature halves each
    /// generation and the clamp holds it at one once it gets there. Explicit
    /// fixed-iteration schemes fail with `unbounded-decay` in that case.
    fn initialize(
        &mut self,
        t: usize,
        get_weighted_distances: &mut WeightedDistanceSource<'_>,
        context: &EpsilonContext,
    ) -> Result<(), AbcError> {
        self.max_t = context
            .max_nr_populations
            .map(|max| t + max.saturating_sub(1));
        if self.schemes.is_empty() {
            self.schemes.push(Box::new(AcceptanceRateScheme::default()));
            if self.max_t.is_some() {
                self.schemes.push(Box::new(ExpDecayFixedIterScheme));
            } else {
                self.schemes.push(Box::new(ExpDecayFixedRatioScheme::default()));
            }
        }
        let needs_records = self.initial_temperature.is_none()
            && !self.max_t.map_or(false, |max_t| t >= max_t);
        let records: Vec<(f64, f64)> = if needs_records {
            get_weighted_distances()?
                .into_iter()
                .map(|row: WeightedDistance| (row.distance, row.weight))
                .collect()
        } else {
            Vec::new()
        };
        self.compute(t, &records, context.acceptor_config, 1.0)
    }

    fn update(
        &mut self,
        t: usize,
        _weighted_distances: &[WeightedDistance],
        stats: &GenerationStats<'_>,
    ) -> Result<(), AbcError> {
        self.compute(t, stats.records, stats.acceptor_config, stats.acceptance_rate)
    }

    fn value(&self, t: usize) -> Result<f64, AbcError> {
        self.temperatures
            .get(&t)
            .copied()
            .ok_or_else(|| AbcError::missing_generation("temperature", t))
    }

    fn requires_kernel(&self) -> bool {
        true
    }

    fn config(&self) -> serde_json::Value {
        let schemes: Vec<&str> = self.schemes.iter().map(|s| s.name()).collect();
        json!({
            "name": "Temperature",
            "schemes": schemes,
            "aggregation": self.aggregation,
            "initial_temperature": self.initial_temperature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lin(pdf_norm: f64) -> Option<AcceptorConfig> {
        Some(AcceptorConfig {
            pdf_norm,
            kernel_scale: KernelScale::Lin,
        })
    }

    #[test]
    fn acceptance_rate_scheme_hits_target() {
        let records: Vec<(f64, f64)> = (1..=100).map(|i| (i as f64 / 1000.0, 1.0)).collect();
        let input = SchemeInput {
            t: 1,
            max_t: None,
            prev_temperature: None,
            records: &records,
            acceptor_config: lin(1.0),
            acceptance_rate: 1.0,
        };
        let scheme = AcceptanceRateScheme::default();
        let temperature = scheme.propose(&input).unwrap();
        let rate = expected_rate(&records, lin(1.0).unwrap(), -temperature.ln());
        assert!(temperature > 1.0);
        assert!((rate - 0.3).abs() < 1e-6);
    }

    #[test]
    fn acceptance_rate_scheme_respects_record_weights() {
        fn propose(records: &[(f64, f64)]) -> f64 {
            let input = SchemeInput {
                t: 1,
                max_t: None,
                prev_temperature: None,
                records,
                acceptor_config: lin(1.0),
                acceptance_rate: 1.0,
            };
            AcceptanceRateScheme::default().propose(&input).unwrap()
        }
        let uniform = propose(&[(0.01, 1.0), (1.0, 1.0)]);
        let discounted = propose(&[(0.01, 1.0), (1.0, 0.0)]);
        let alone = propose(&[(0.01, 1.0)]);
        assert_eq!(uniform, 1.0);
        assert!(discounted > 1.0);
        assert_eq!(discounted, alone);
    }

    #[test]
    fn fixed_iter_decay_reaches_one() {
        let input = SchemeInput {
            t: 4,
            max_t: Some(4),
            prev_temperature: Some(50.0),
            records: &[],
            acceptor_config: None,
            acceptance_rate: 0.5,
        };
        assert_eq!(ExpDecayFixedIterScheme.propose(&input).unwrap(), 1.0);
        let earlier = SchemeInput { t: 3, ..input };
        let value = ExpDecayFixedIterScheme.propose(&earlier).unwrap();
        assert!((value - 50f64.sqrt()).abs() < 1e-9);
        let unbounded = SchemeInput { max_t: None, ..input };
        assert!(ExpDecayFixedIterScheme.propose(&unbounded).is_err());
    }

    #[test]
    fn unbounded_run_decays_to_one_and_stays() {
        let config = Some(AcceptorConfig {
            pdf_norm: 0.0,
            kernel_scale: KernelScale::Log,
        });
        let rows: Vec<WeightedDistance> = (0..20)
            .map(|i| WeightedDistance {
                distance: -(i as f64) / 4.0,
                weight: 1.0,
                m: 0,
            })
            .collect();
        let records: Vec<(f64, f64)> = rows.iter().map(|row| (row.distance, row.weight)).collect();
        let mut temperature = Temperature::new();
        temperature
            .initialize(
                0,
                &mut || Ok(rows.clone()),
                &EpsilonContext {
                    max_nr_populations: None,
                    acceptor_config: config,
                },
            )
            .unwrap();
        assert_eq!(temperature.max_t(), None);
        let stats = GenerationStats {
            acceptance_rate: 0.3,
            acceptor_config: config,
            records: &records,
        };
        for t in 1..80 {
            temperature.update(t, &rows, &stats).unwrap();
        }
        let values: Vec<f64> = temperature.temperatures().values().copied().collect();
        assert!(values.windows(2).all(|pair| pair[1] <= pair[0]));
        assert_eq!(values[values.len() - 1], 1.0);
        assert_eq!(values[values.len() - 2], 1.0);
    }

    #[test]
    fn fixed_iteration_scheme_needs_a_bound() {
        let mut temperature = Temperature::new()
            .with_scheme(ExpDecayFixedIterScheme)
            .with_initial_temperature(10.0);
        let context = EpsilonContext {
            max_nr_populations: None,
            acceptor_config: lin(1.0),
        };
        temperature
            .initialize(0, &mut || Ok(Vec::new()), &context)
            .unwrap();
        let stats = GenerationStats {
            acceptance_rate: 0.5,
            acceptor_config: lin(1.0),
            records: &[],
        };
        let err = temperature.update(1, &[], &stats).unwrap_err();
        assert_eq!(err.info().code, "unbounded-decay");
    }

    #[test]
    fn initial_temperature_is_used_verbatim() {
        let mut temperature = Temperature::new().with_initial_temperature(0.5);
        let context = EpsilonContext {
            max_nr_populations: Some(5),
            acceptor_config: lin(1.0),
        };
        temperature
            .initialize(0, &mut || Ok(Vec::new()), &context)
            .unwrap();
        assert_eq!(temperature.value(0).unwrap(), 0.5);
        assert_eq!(temperature.max_t(), Some(4));
    }
}
