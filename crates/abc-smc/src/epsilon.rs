//! Generation-indexed acceptance thresholds.

use std::collections::BTreeMap;

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, WeightedDistance};
use serde_json::json;
use tracing::debug;

use crate::acceptor::AcceptorConfig;

/// Accessor yielding weighted distances on demand.
pub type WeightedDistanceSource<'a> =
    dyn FnMut() -> Result<Vec<WeightedDistance>, AbcError> + 'a;

/// Static information handed to [`Epsilon::initialize`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpsilonContext {
    /// Generations the current run may sample, if bounded.
    pub max_nr_populations: Option<usize>,
    /// Acceptor state for the generation being initialised.
    pub acceptor_config: Option<AcceptorConfig>,
}

/// Statistics of the generation that just completed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationStats<'a> {
    /// Accepted particles over evaluations.
    pub acceptance_rate: f64,
    /// Acceptor state for the generation being prepared.
    pub acceptor_config: Option<AcceptorConfig>,
    /// Every distance evaluated in the generation, accepted or rejected,
    /// paired with the prior over proposal density of its particle.
    pub records: &'a [(f64, f64)],
}

/// Scheduler producing the threshold (or temperature) of each generation.
pub trait Epsilon: Send + Sync {
    /// Computes the value of the first generation `t`.
    fn initialize(
        &mut self,
        _t: usize,
        _get_weighted_distances: &mut WeightedDistanceSource<'_>,
        _context: &EpsilonContext,
    ) -> Result<(), AbcError> {
        Ok(())
    }

    /// Computes the value of generation `t` from the generation `t - 1`.
    fn update(
        &mut self,
        _t: usize,
        _weighted_distances: &[WeightedDistance],
        _stats: &GenerationStats<'_>,
    ) -> Result<(), AbcError> {
        Ok(())
    }

    /// Recorded value of generation `t`; a lookup error if never computed.
    fn value(&self, t: usize) -> Result<f64, AbcError>;

    /// Whether the scheduler only makes sense with a stochastic kernel.
    fn requires_kernel(&self) -> bool {
        false
    }

    /// JSON description stored with the run.
    fn config(&self) -> serde_json::Value;
}

/// Same threshold in every generation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantEpsilon {
    value: f64,
}

impl ConstantEpsilon {
    /// Threshold fixed at `value`.
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl Epsilon for ConstantEpsilon {
    fn value(&self, _t: usize) -> Result<f64, AbcError> {
        Ok(self.value)
    }

    fn config(&self) -> serde_json::Value {
        json!({ "name": "ConstantEpsilon", "value": self.value })
    }
}

/// Explicit threshold per generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ListEpsilon {
    values: Vec<f64>,
}

impl ListEpsilon {
    /// Generation `t` uses `values[t]`.
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl Epsilon for ListEpsilon {
    fn value(&self, t: usize) -> Result<f64, AbcError> {
        self.values
            .get(t)
            .copied()
            .ok_or_else(|| AbcError::missing_generation("list epsilon", t))
    }

    fn config(&self) -> serde_json::Value {
        json!({ "name": "ListEpsilon", "values": self.values })
    }
}

/// Weighted `alpha`-quantile of the weighted distances, linearly
/// interpolated between the centres of the cumulative weight steps.
pub fn weighted_quantile(rows: &[WeightedDistance], alpha: f64) -> Result<f64, AbcError> {
    let mut points: Vec<(f64, f64)> = rows
        .iter()
        .filter(|row| row.weight > 0.0 && !row.distance.is_nan())
        .map(|row| (row.distance, row.weight))
        .collect();
    let total: f64 = points.iter().map(|(_, w)| w).sum();
    if points.is_empty() || !(total > 0.0) {
        return Err(AbcError::Population(ErrorInfo::new(
            "empty-weighted-distances",
            "quantile needs at least one positively weighted distance",
        )));
    }
    points.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut cumulative = 0.0;
    let positions: Vec<f64> = points
        .iter()
        .map(|(_, w)| {
            let w = w / total;
            cumulative += w;
            cumulative - 0.5 * w
        })
        .collect();

    if alpha <= positions[0] {
        return Ok(points[0].0);
    }
    let last = points.len() - 1;
    if alpha >= positions[last] {
        return Ok(points[last].0);
    }
    for i in 1..points.len() {
        if alpha <= positions[i] {
            let span = positions[i] - positions[i - 1];
            let frac = if span > 0.0 { (alpha - positions[i - 1]) / span } else { 1.0 };
            return Ok(points[i - 1].0 + frac * (points[i].0 - points[i - 1].0));
        }
    }
    Ok(points[last].0)
}

/// Threshold set to a weighted quantile of the previous generation's
/// distances.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantileEpsilon {
    initial_epsilon: Option<f64>,
    alpha: f64,
    quantile_multiplier: f64,
    values: BTreeMap<usize, f64>,
}

impl QuantileEpsilon {
    /// Quantile `alpha` of the distances; the first value comes from the
    /// calibration sample unless `initial_epsilon` is given.
    pub fn new(initial_epsilon: Option<f64>, alpha: f64) -> Result<Self, AbcError> {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(AbcError::Config(
                ErrorInfo::new("invalid-alpha", "quantile alpha must lie in (0, 1]")
                    .with_context("alpha", alpha),
            ));
        }
        Ok(Self {
            initial_epsilon,
            alpha,
            quantile_multiplier: 1.0,
            values: BTreeMap::new(),
        })
    }

    /// Median of the distances.
    pub fn median() -> Self {
        Self {
            initial_epsilon: None,
            alpha: 0.5,
            quantile_multiplier: 1.0,
            values: BTreeMap::new(),
        }
    }

    /// Scales every computed quantile.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.quantile_multiplier = multiplier;
        self
    }

    fn record(&mut self, t: usize, rows: &[WeightedDistance]) -> Result<(), AbcError> {
        let quantile = weighted_quantile(rows, self.alpha)?;
        let value = self.quantile_multiplier * quantile;
        debug!(t, epsilon = value, "quantile epsilon");
        self.values.insert(t, value);
        Ok(())
    }
}

impl Epsilon for QuantileEpsilon {
    fn initialize(
        &mut self,
        t: usize,
        get_weighted_distances: &mut WeightedDistanceSource<'_>,
        _context: &EpsilonContext,
    ) -> Result<(), AbcError> {
        match self.initial_epsilon {
            Some(value) => {
                self.values.insert(t, value);
                Ok(())
            }
            None => {
                let rows = get_weighted_distances()?;
                self.record(t, &rows)
            }
        }
    }

    fn update(
        &mut self,
        t: usize,
        weighted_distances: &[WeightedDistance],
        _stats: &GenerationStats<'_>,
    ) -> Result<(), AbcError> {
        self.record(t, weighted_distances)
    }

    fn value(&self, t: usize) -> Result<f64, AbcError> {
        self.values
            .get(&t)
            .copied()
            .ok_or_else(|| AbcError::missing_generation("quantile epsilon", t))
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "name": "QuantileEpsilon",
            "initial_epsilon": self.initial_epsilon,
            "alpha": self.alpha,
            "quantile_multiplier": self.quantile_multiplier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(distances: &[f64]) -> Vec<WeightedDistance> {
        let w = 1.0 / distances.len() as f64;
        distances
            .iter()
            .map(|&distance| WeightedDistance { distance, weight: w, m: 0 })
            .collect()
    }

    #[test]
    fn median_of_uniform_weights() {
        let odd = weighted_quantile(&rows(&[3.0, 1.0, 2.0]), 0.5).unwrap();
        assert!((odd - 2.0).abs() < 1e-9);
        let even = weighted_quantile(&rows(&[1.0, 2.0, 3.0, 4.0]), 0.5).unwrap();
        assert!((even - 2.5).abs() < 1e-12);
    }

    #[test]
    fn quantile_respects_weights() {
        let skewed = vec![
            WeightedDistance { distance: 1.0, weight: 0.9, m: 0 },
            WeightedDistance { distance: 10.0, weight: 0.1, m: 0 },
        ];
        assert!(weighted_quantile(&skewed, 0.5).unwrap() < 2.0);
    }

    #[test]
    fn uncomputed_generation_is_a_lookup_error() {
        let mut eps = QuantileEpsilon::median();
        eps.initialize(0, &mut || Ok(rows(&[1.0, 2.0, 3.0])), &EpsilonContext::default())
            .unwrap();
        assert!((eps.value(0).unwrap() - 2.0).abs() < 1e-9);
        assert!(eps.value(1).unwrap_err().is_lookup());
        assert!(ListEpsilon::new(vec![1.0]).value(4).unwrap_err().is_lookup());
    }

    #[test]
    fn fixed_initial_value_skips_calibration() {
        let mut eps = QuantileEpsilon::new(Some(7.5), 0.3).unwrap();
        let mut called = false;
        eps.initialize(
            2,
            &mut || {
                called = true;
                Ok(Vec::new())
            },
            &EpsilonContext::default(),
        )
        .unwrap();
        assert!(!called);
        assert_eq!(eps.value(2).unwrap(), 7.5);
    }
}
