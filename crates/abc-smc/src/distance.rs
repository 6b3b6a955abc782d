//! Distances between simulated and observed summary statistics, and the
//! density-valued stochastic kernels used with probabilistic acceptance.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, Parameter, SumStats};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Accessor yielding calibration summary statistics on demand.
pub type SumStatsSource<'a> = dyn FnMut() -> Result<Vec<SumStats>, AbcError> + 'a;

/// Closure signature shared by [`FunctionDistance`] and [`FunctionKernel`].
pub type DistanceFn =
    dyn Fn(&SumStats, &SumStats, usize, &Parameter) -> Result<f64, AbcError> + Send + Sync;

/// Comparison of simulated statistics `x` with observed statistics `x_0`.
///
/// `initialize` and `update` are no-ops unless the implementation adapts
/// over generations.
pub trait Distance: Send + Sync {
    /// Calibrates from a prior sample before the first generation.
    fn initialize(
        &mut self,
        _t: usize,
        _get_sum_stats: &mut SumStatsSource<'_>,
        _x_0: &SumStats,
    ) -> Result<(), AbcError> {
        Ok(())
    }

    /// Adapts to the statistics of the generation that just completed.
    ///
    /// Returns whether the metric changed for generation `t`.
    fn update(&mut self, _t: usize, _sum_stats: &[SumStats]) -> Result<bool, AbcError> {
        Ok(false)
    }

    /// Distance (or kernel value) at generation `t`.
    fn evaluate(
        &self,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        parameter: &Parameter,
    ) -> Result<f64, AbcError>;

    /// The stochastic kernel view, when this is one.
    fn as_kernel(&self) -> Option<&dyn StochasticKernel> {
        None
    }

    /// JSON description stored with the run.
    fn config(&self) -> serde_json::Value;
}

/// Scale of the value returned by a stochastic kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelScale {
    /// Plain density.
    Lin,
    /// Log density.
    Log,
}

impl FromStr for KernelScale {
    type Err = AbcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lin" | "RET_SCALE_LIN" => Ok(KernelScale::Lin),
            "log" | "RET_SCALE_LOG" => Ok(KernelScale::Log),
            other => Err(AbcError::Config(
                ErrorInfo::new("unsupported-kernel-scale", "kernel scale must be lin or log")
                    .with_context("scale", other),
            )),
        }
    }
}

impl fmt::Display for KernelScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelScale::Lin => write!(f, "lin"),
            KernelScale::Log => write!(f, "log"),
        }
    }
}

/// Density-valued comparison; larger values mean closer agreement.
pub trait StochasticKernel: Distance {
    /// Scale of the returned values.
    fn ret_scale(&self) -> KernelScale;

    /// Maximum attainable value on the kernel's scale, if known.
    fn pdf_max(&self) -> Option<f64>;

    /// Summary statistic keys in evaluation order.
    fn keys(&self) -> &[String];
}

fn missing_statistic(key: &str) -> AbcError {
    AbcError::Distance(
        ErrorInfo::new("missing-sum-stat", "simulated statistics lack an observed key")
            .with_context("key", key),
    )
}

fn p_norm(terms: impl Iterator<Item = f64>, p: f64) -> f64 {
    if p.is_infinite() {
        terms.fold(0.0, f64::max)
    } else {
        terms.map(|v| v.powf(p)).sum::<f64>().powf(1.0 / p)
    }
}

fn check_p(p: f64) -> Result<(), AbcError> {
    if p >= 1.0 {
        Ok(())
    } else {
        Err(AbcError::Config(
            ErrorInfo::new("invalid-p", "p-norm needs p >= 1").with_context("p", p),
        ))
    }
}

/// Weighted p-norm over the observed keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PNormDistance {
    p: f64,
    weights: Option<BTreeMap<String, f64>>,
}

impl PNormDistance {
    /// Unweighted p-norm; `p` may be infinite.
    pub fn new(p: f64) -> Result<Self, AbcError> {
        check_p(p)?;
        Ok(Self { p, weights: None })
    }

    /// Fixed per-key weights; keys without an entry weigh one.
    pub fn with_weights(mut self, weights: BTreeMap<String, f64>) -> Self {
        self.weights = Some(weights);
        self
    }
}

impl Distance for PNormDistance {
    fn evaluate(
        &self,
        x: &SumStats,
        x_0: &SumStats,
        _t: usize,
        _parameter: &Parameter,
    ) -> Result<f64, AbcError> {
        let mut terms = Vec::with_capacity(x_0.len());
        for (key, observed) in x_0 {
            let simulated = x.get(key).ok_or_else(|| missing_statistic(key))?;
            let weight = self
                .weights
                .as_ref()
                .and_then(|w| w.get(key).copied())
                .unwrap_or(1.0);
            terms.push((weight * (simulated - observed)).abs());
        }
        Ok(p_norm(terms.into_iter(), self.p))
    }

    fn config(&self) -> serde_json::Value {
        json!({ "name": "PNormDistance", "p": self.p, "weights": self.weights })
    }
}

/// Per-statistic scale estimators for [`AdaptivePNormDistance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScaleFunction {
    /// Median absolute deviation from the median.
    MedianAbsoluteDeviation,
    /// Standard deviation.
    StandardDeviation,
    /// Mean absolute deviation from the observed value.
    MeanAbsoluteDeviationToObservation,
    /// Root mean square deviation from the observed value.
    RootMeanSquareDeviationToObservation,
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

impl ScaleFunction {
    /// Scale of `values` relative to the observed value `observed`.
    pub fn scale(self, values: &[f64], observed: f64) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let n = values.len() as f64;
        match self {
            ScaleFunction::MedianAbsoluteDeviation => {
                let mut sorted = values.to_vec();
                let center = median(&mut sorted);
                let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
                median(&mut deviations)
            }
            ScaleFunction::StandardDeviation => {
                let mean = values.iter().sum::<f64>() / n;
                (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
            }
            ScaleFunction::MeanAbsoluteDeviationToObservation => {
                values.iter().map(|v| (v - observed).abs()).sum::<f64>() / n
            }
            ScaleFunction::RootMeanSquareDeviationToObservation => {
                (values.iter().map(|v| (v - observed).powi(2)).sum::<f64>() / n).sqrt()
            }
        }
    }
}

/// P-norm whose per-statistic weights are recomputed every generation as
/// the inverse scale of the current population's statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptivePNormDistance {
    p: f64,
    scale_function: ScaleFunction,
    normalize_weights: bool,
    max_weight_ratio: Option<f64>,
    x_0: SumStats,
    weights: BTreeMap<usize, BTreeMap<String, f64>>,
}

impl AdaptivePNormDistance {
    /// Adaptive distance with the given norm and scale estimator.
    pub fn new(p: f64, scale_function: ScaleFunction) -> Result<Self, AbcError> {
        check_p(p)?;
        Ok(Self {
            p,
            scale_function,
            normalize_weights: true,
            max_weight_ratio: None,
            x_0: SumStats::new(),
            weights: BTreeMap::new(),
        })
    }

    /// Whether weights are rescaled to mean one (default on).
    pub fn with_normalized_weights(mut self, normalize: bool) -> Self {
        self.normalize_weights = normalize;
        self
    }

    /// Caps every weight at `ratio` times the smallest non-zero weight.
    pub fn with_max_weight_ratio(mut self, ratio: f64) -> Self {
        self.max_weight_ratio = Some(ratio);
        self
    }

    /// Weights in effect at generation `t`.
    pub fn weights(&self, t: usize) -> Option<&BTreeMap<String, f64>> {
        self.weights.get(&t)
    }

    fn fit_weights(&mut self, t: usize, sum_stats: &[SumStats]) {
        let mut weights = BTreeMap::new();
        for (key, observed) in &self.x_0 {
            let values: Vec<f64> = sum_stats.iter().filter_map(|s| s.get(key).copied()).collect();
            let scale = self.scale_function.scale(&values, *observed);
            let weight = if scale > 0.0 && scale.is_finite() { 1.0 / scale } else { 0.0 };
            weights.insert(key.clone(), weight);
        }

        if let Some(ratio) = self.max_weight_ratio {
            let min_positive = weights
                .values()
                .copied()
                .filter(|w| *w > 0.0)
                .fold(f64::INFINITY, f64::min);
            if min_positive.is_finite() {
                let cap = min_positive * ratio;
                for w in weights.values_mut() {
                    *w = w.min(cap);
                }
            }
        }

        if self.normalize_weights && !weights.is_empty() {
            let mean = weights.values().sum::<f64>() / weights.len() as f64;
            if mean > 0.0 {
                for w in weights.values_mut() {
                    *w /= mean;
                }
            }
        }

        debug!(t, ?weights, "adaptive distance weights");
        self.weights.insert(t, weights);
    }
}

impl Distance for AdaptivePNormDistance {
    fn initialize(
        &mut self,
        t: usize,
        get_sum_stats: &mut SumStatsSource<'_>,
        x_0: &SumStats,
    ) -> Result<(), AbcError> {
        self.x_0 = x_0.clone();
        let sum_stats = get_sum_stats()?;
        self.fit_weights(t, &sum_stats);
        Ok(())
    }

    fn update(&mut self, t: usize, sum_stats: &[SumStats]) -> Result<bool, AbcError> {
        self.fit_weights(t, sum_stats);
        Ok(true)
    }

    fn evaluate(
        &self,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        _parameter: &Parameter,
    ) -> Result<f64, AbcError> {
        let weights = self
            .weights
            .get(&t)
            .ok_or_else(|| AbcError::missing_generation("adaptive distance weights", t))?;
        let mut terms = Vec::with_capacity(x_0.len());
        for (key, observed) in x_0 {
            let simulated = x.get(key).ok_or_else(|| missing_statistic(key))?;
            let weight = weights.get(key).copied().unwrap_or(0.0);
            terms.push((weight * (simulated - observed)).abs());
        }
        Ok(p_norm(terms.into_iter(), self.p))
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "name": "AdaptivePNormDistance",
            "p": self.p,
            "scale_function": self.scale_function,
            "normalize_weights": self.normalize_weights,
            "max_weight_ratio": self.max_weight_ratio,
        })
    }
}

/// Distance given by a closure.
pub struct FunctionDistance {
    name: String,
    function: Box<DistanceFn>,
}

impl FunctionDistance {
    /// Wraps `function` under a descriptive name.
    pub fn new<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&SumStats, &SumStats, usize, &Parameter) -> Result<f64, AbcError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            function: Box::new(function),
        }
    }
}

impl Distance for FunctionDistance {
    fn evaluate(
        &self,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        parameter: &Parameter,
    ) -> Result<f64, AbcError> {
        (self.function)(x, x_0, t, parameter)
    }

    fn config(&self) -> serde_json::Value {
        json!({ "name": self.name })
    }
}

/// Noise variance of a [`NormalKernel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variance {
    /// Same variance for every key.
    Scalar(f64),
    /// Variance per key.
    PerKey(BTreeMap<String, f64>),
}

/// Independent Gaussian noise model around the observed statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalKernel {
    variance: Variance,
    ret_scale: KernelScale,
    keys: Vec<String>,
    pdf_max: Option<f64>,
}

impl NormalKernel {
    /// Gaussian kernel; all variances must be positive.
    pub fn new(variance: Variance, ret_scale: KernelScale) -> Result<Self, AbcError> {
        let valid = match &variance {
            Variance::Scalar(v) => *v > 0.0,
            Variance::PerKey(map) => !map.is_empty() && map.values().all(|v| *v > 0.0),
        };
        if !valid {
            return Err(AbcError::Config(ErrorInfo::new(
                "invalid-variance",
                "normal kernel variances must be positive",
            )));
        }
        Ok(Self {
            variance,
            ret_scale,
            keys: Vec::new(),
            pdf_max: None,
        })
    }

    /// Fixes the statistic order instead of taking it from the observation.
    pub fn with_keys(mut self, keys: Vec<String>) -> Self {
        self.keys = keys;
        self
    }

    /// Overrides the maximum density, given on the kernel's scale.
    pub fn with_pdf_max(mut self, pdf_max: f64) -> Self {
        self.pdf_max = Some(pdf_max);
        self
    }

    fn variance_of(&self, key: &str) -> Result<f64, AbcError> {
        match &self.variance {
            Variance::Scalar(v) => Ok(*v),
            Variance::PerKey(map) => map.get(key).copied().ok_or_else(|| {
                AbcError::Distance(
                    ErrorInfo::new("missing-variance", "no variance configured for statistic")
                        .with_context("key", key),
                )
            }),
        }
    }

    fn log_density<'k>(
        &self,
        keys: impl Iterator<Item = &'k String>,
        x: &SumStats,
        x_0: &SumStats,
    ) -> Result<f64, AbcError> {
        let mut log_pd = 0.0;
        for key in keys {
            let observed = x_0.get(key).ok_or_else(|| missing_statistic(key))?;
            let simulated = x.get(key).ok_or_else(|| missing_statistic(key))?;
            let var = self.variance_of(key)?;
            log_pd += -0.5 * (2.0 * std::f64::consts::PI * var).ln()
                - 0.5 * (simulated - observed).powi(2) / var;
        }
        Ok(log_pd)
    }

    fn on_scale(&self, log_pd: f64) -> f64 {
        match self.ret_scale {
            KernelScale::Lin => log_pd.exp(),
            KernelScale::Log => log_pd,
        }
    }
}

impl Distance for NormalKernel {
    fn initialize(
        &mut self,
        _t: usize,
        _get_sum_stats: &mut SumStatsSource<'_>,
        x_0: &SumStats,
    ) -> Result<(), AbcError> {
        if self.keys.is_empty() {
            self.keys = x_0.keys().cloned().collect();
        }
        if self.pdf_max.is_none() {
            let log_max = self.log_density(self.keys.iter(), x_0, x_0)?;
            self.pdf_max = Some(self.on_scale(log_max));
        }
        Ok(())
    }

    fn evaluate(
        &self,
        x: &SumStats,
        x_0: &SumStats,
        _t: usize,
        _parameter: &Parameter,
    ) -> Result<f64, AbcError> {
        let log_pd = if self.keys.is_empty() {
            self.log_density(x_0.keys(), x, x_0)?
        } else {
            self.log_density(self.keys.iter(), x, x_0)?
        };
        Ok(self.on_scale(log_pd))
    }

    fn as_kernel(&self) -> Option<&dyn StochasticKernel> {
        Some(self)
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "name": "NormalKernel",
            "variance": self.variance,
            "ret_scale": self.ret_scale,
            "pdf_max": self.pdf_max,
        })
    }
}

impl StochasticKernel for NormalKernel {
    fn ret_scale(&self) -> KernelScale {
        self.ret_scale
    }

    fn pdf_max(&self) -> Option<f64> {
        self.pdf_max
    }

    fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// Stochastic kernel given by a closure.
///
/// Without an explicit `pdf_max` the maximum is taken as the closure's value
/// at the observed point.
pub struct FunctionKernel {
    function: Box<DistanceFn>,
    ret_scale: KernelScale,
    keys: Vec<String>,
    pdf_max: Option<f64>,
}

impl FunctionKernel {
    /// Wraps a density-valued closure on the given scale.
    pub fn new<F>(ret_scale: KernelScale, function: F) -> Self
    where
        F: Fn(&SumStats, &SumStats, usize, &Parameter) -> Result<f64, AbcError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            function: Box::new(function),
            ret_scale,
            keys: Vec::new(),
            pdf_max: None,
        }
    }

    /// Declares the maximum density on the kernel's scale.
    pub fn with_pdf_max(mut self, pdf_max: f64) -> Self {
        self.pdf_max = Some(pdf_max);
        self
    }
}

impl Distance for FunctionKernel {
    fn initialize(
        &mut self,
        t: usize,
        _get_sum_stats: &mut SumStatsSource<'_>,
        x_0: &SumStats,
    ) -> Result<(), AbcError> {
        if self.keys.is_empty() {
            self.keys = x_0.keys().cloned().collect();
        }
        if self.pdf_max.is_none() {
            self.pdf_max = Some((self.function)(x_0, x_0, t, &Parameter::new())?);
        }
        Ok(())
    }

    fn evaluate(
        &self,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        parameter: &Parameter,
    ) -> Result<f64, AbcError> {
        (self.function)(x, x_0, t, parameter)
    }

    fn as_kernel(&self) -> Option<&dyn StochasticKernel> {
        Some(self)
    }

    fn config(&self) -> serde_json::Value {
        json!({
            "name": "FunctionKernel",
            "ret_scale": self.ret_scale,
            "pdf_max": self.pdf_max,
        })
    }
}

impl StochasticKernel for FunctionKernel {
    fn ret_scale(&self) -> KernelScale {
        self.ret_scale
    }

    fn pdf_max(&self) -> Option<f64> {
        self.pdf_max
    }

    fn keys(&self) -> &[String] {
        &self.keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(pairs: &[(&str, f64)]) -> SumStats {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn p_norms_match_hand_computation() {
        let x = stats(&[("a", 3.0), ("b", 4.0)]);
        let x_0 = stats(&[("a", 0.0), ("b", 0.0)]);
        let par = Parameter::new();
        let l1 = PNormDistance::new(1.0).unwrap();
        let l2 = PNormDistance::new(2.0).unwrap();
        let linf = PNormDistance::new(f64::INFINITY).unwrap();
        assert_eq!(l1.evaluate(&x, &x_0, 0, &par).unwrap(), 7.0);
        assert!((l2.evaluate(&x, &x_0, 0, &par).unwrap() - 5.0).abs() < 1e-12);
        assert_eq!(linf.evaluate(&x, &x_0, 0, &par).unwrap(), 4.0);
        assert!(PNormDistance::new(0.5).is_err());
    }

    #[test]
    fn missing_statistic_is_a_distance_error() {
        let distance = PNormDistance::new(2.0).unwrap();
        let err = distance
            .evaluate(&stats(&[("a", 1.0)]), &stats(&[("b", 1.0)]), 0, &Parameter::new())
            .unwrap_err();
        assert!(matches!(err, AbcError::Distance(_)));
    }

    #[test]
    fn adaptive_weights_follow_inverse_scale() {
        let mut distance =
            AdaptivePNormDistance::new(1.0, ScaleFunction::StandardDeviation).unwrap()
                .with_normalized_weights(false);
        let x_0 = stats(&[("a", 0.0), ("b", 0.0)]);
        let sample: Vec<SumStats> = (0..10)
            .map(|i| stats(&[("a", i as f64), ("b", 10.0 * i as f64)]))
            .collect();
        distance
            .initialize(0, &mut || Ok(sample.clone()), &x_0)
            .unwrap();
        let weights = distance.weights(0).unwrap();
        assert!((weights["a"] / weights["b"] - 10.0).abs() < 1e-9);
        let err = distance
            .evaluate(&x_0, &x_0, 3, &Parameter::new())
            .unwrap_err();
        assert!(err.is_lookup());
        assert!(distance.update(1, &sample).unwrap());
        assert!(distance.weights(1).is_some());
    }

    #[test]
    fn constant_statistic_gets_zero_weight() {
        let scale = ScaleFunction::MedianAbsoluteDeviation.scale(&[2.0, 2.0, 2.0], 1.0);
        assert_eq!(scale, 0.0);
    }

    #[test]
    fn normal_kernel_peaks_at_observation() {
        let mut kernel = NormalKernel::new(Variance::Scalar(0.5), KernelScale::Log).unwrap();
        let x_0 = stats(&[("y", 1.0)]);
        kernel.initialize(0, &mut || Ok(Vec::new()), &x_0).unwrap();
        let at_peak = kernel.evaluate(&x_0, &x_0, 0, &Parameter::new()).unwrap();
        let away = kernel
            .evaluate(&stats(&[("y", 2.0)]), &x_0, 0, &Parameter::new())
            .unwrap();
        assert!((kernel.pdf_max().unwrap() - at_peak).abs() < 1e-12);
        assert!(away < at_peak);
        assert_eq!(kernel.keys(), &["y".to_string()]);
    }

    #[test]
    fn scale_tags_parse() {
        assert_eq!("RET_SCALE_LIN".parse::<KernelScale>().unwrap(), KernelScale::Lin);
        assert_eq!("log".parse::<KernelScale>().unwrap(), KernelScale::Log);
        assert!(matches!("cubic".parse::<KernelScale>(), Err(AbcError::Config(_))));
    }
}
