//! Acceptance decisions turning a distance (or kernel value) and the
//! scheduler value into accept/reject plus an importance weight.

use std::collections::BTreeMap;

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, Parameter, RngHandle, SumStats, WeightedDistance};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::distance::{Distance, KernelScale, StochasticKernel};
use crate::epsilon::{Epsilon, WeightedDistanceSource};

/// Acceptor state a scheduler may depend on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcceptorConfig {
    /// Normalisation constant on the kernel's scale.
    pub pdf_norm: f64,
    /// Scale of the kernel values.
    pub kernel_scale: KernelScale,
}

/// Outcome of one acceptance step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptorResult {
    /// Distance or kernel value at the current generation.
    pub distance: f64,
    /// Whether the simulation is accepted.
    pub accept: bool,
    /// Importance weight contribution.
    pub weight: f64,
}

/// Acceptance rule; `initialize` and `update` default to no-ops.
pub trait Acceptor: Send + Sync {
    /// Calibrates before generation `t`.
    fn initialize(
        &mut self,
        _t: usize,
        _get_weighted_distances: &mut WeightedDistanceSource<'_>,
        _distance: &dyn Distance,
        _x_0: &SumStats,
    ) -> Result<(), AbcError> {
        Ok(())
    }

    /// Prepares generation `t` from the generation that just completed.
    fn update(
        &mut self,
        _t: usize,
        _weighted_distances: &[WeightedDistance],
        _distance: &dyn Distance,
        _acceptance_rate: f64,
    ) -> Result<(), AbcError> {
        Ok(())
    }

    /// Decides on the simulated statistics `x`.
    #[allow(clippy::too_many_arguments)]
    fn accept(
        &self,
        distance: &dyn Distance,
        eps: &dyn Epsilon,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        parameter: &Parameter,
        rng: &mut RngHandle,
    ) -> Result<AcceptorResult, AbcError>;

    /// State exposed to the scheduler for generation `t`.
    fn config(&self, _t: usize) -> Option<AcceptorConfig> {
        None
    }

    /// Whether the acceptor needs a stochastic kernel.
    fn requires_kernel(&self) -> bool {
        false
    }

    /// JSON description stored with the run.
    fn describe(&self) -> serde_json::Value;
}

/// Threshold acceptance with unit weights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniformAcceptor {
    use_complete_history: bool,
}

impl UniformAcceptor {
    /// Compares against the current generation only.
    pub fn current_time() -> Self {
        Self {
            use_complete_history: false,
        }
    }

    /// Additionally requires acceptance under every earlier generation's
    /// distance and threshold, which nests the acceptance regions when the
    /// distance adapts.
    pub fn complete_history() -> Self {
        Self {
            use_complete_history: true,
        }
    }
}

impl Acceptor for UniformAcceptor {
    fn accept(
        &self,
        distance: &dyn Distance,
        eps: &dyn Epsilon,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        parameter: &Parameter,
        _rng: &mut RngHandle,
    ) -> Result<AcceptorResult, AbcError> {
        let d = distance.evaluate(x, x_0, t, parameter)?;
        let mut accept = d <= eps.value(t)?;
        if accept && self.use_complete_history {
            for t_prev in 0..t {
                let outcome = distance
                    .evaluate(x, x_0, t_prev, parameter)
                    .and_then(|d_prev| eps.value(t_prev).map(|e| d_prev <= e));
                match outcome {
                    Ok(true) => {}
                    Ok(false) => {
                        accept = false;
                        break;
                    }
                    // generations this run never computed are skipped
                    Err(err) if err.is_lookup() => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(AcceptorResult {
            distance: d,
            accept,
            weight: 1.0,
        })
    }

    fn describe(&self) -> serde_json::Value {
        json!({ "name": "UniformAcceptor", "use_complete_history": self.use_complete_history })
    }
}

/// Strategy computing the per-generation normalisation constant of a
/// [`StochasticAcceptor`].
pub trait PdfNorm: Send + Sync {
    /// Normalisation for the next generation.
    fn compute(
        &self,
        kernel_pdf_max: Option<f64>,
        get_weighted_distances: &mut WeightedDistanceSource<'_>,
        prev_pdf_norm: Option<f64>,
    ) -> Result<f64, AbcError>;

    /// Name stored with the run.
    fn name(&self) -> &'static str;
}

/// Largest kernel value seen so far, never below the previous constant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaxFoundPdfNorm;

impl PdfNorm for MaxFoundPdfNorm {
    fn compute(
        &self,
        kernel_pdf_max: Option<f64>,
        get_weighted_distances: &mut WeightedDistanceSource<'_>,
        prev_pdf_norm: Option<f64>,
    ) -> Result<f64, AbcError> {
        let found = get_weighted_distances()?
            .into_iter()
            .map(|row| row.distance)
            .filter(|d| !d.is_nan())
            .chain(prev_pdf_norm)
            .fold(None, |acc: Option<f64>, d| Some(acc.map_or(d, |a| a.max(d))));
        found.or(kernel_pdf_max).ok_or_else(|| {
            AbcError::Config(ErrorInfo::new(
                "undetermined-pdf-norm",
                "no kernel values and no pdf_max to normalise with",
            ))
        })
    }

    fn name(&self) -> &'static str {
        "max-found"
    }
}

/// The kernel's declared maximum density.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelPdfNorm;

impl PdfNorm for KernelPdfNorm {
    fn compute(
        &self,
        kernel_pdf_max: Option<f64>,
        _get_weighted_distances: &mut WeightedDistanceSource<'_>,
        _prev_pdf_norm: Option<f64>,
    ) -> Result<f64, AbcError> {
        kernel_pdf_max.ok_or_else(|| {
            AbcError::Config(ErrorInfo::new(
                "missing-pdf-max",
                "kernel normalisation needs a kernel with pdf_max",
            ))
        })
    }

    fn name(&self) -> &'static str {
        "kernel"
    }
}

/// Probabilistic acceptance: accept iff `(pd / c)^(1/T) >= u` with `u`
/// uniform on `[0, 1)`, `c` the generation's normalisation constant and `T`
/// the temperature.
pub struct StochasticAcceptor {
    pdf_norm_method: Box<dyn PdfNorm>,
    pdf_norms: BTreeMap<usize, f64>,
    kernel_scale: Option<KernelScale>,
}

impl Default for StochasticAcceptor {
    fn default() -> Self {
        Self::new(MaxFoundPdfNorm)
    }
}

impl StochasticAcceptor {
    /// Acceptor normalising with `method`.
    pub fn new(method: impl PdfNorm + 'static) -> Self {
        Self {
            pdf_norm_method: Box::new(method),
            pdf_norms: BTreeMap::new(),
            kernel_scale: None,
        }
    }

    /// Normalisation constants by generation.
    pub fn pdf_norms(&self) -> &BTreeMap<usize, f64> {
        &self.pdf_norms
    }

    fn kernel_of(distance: &dyn Distance) -> Result<&dyn StochasticKernel, AbcError> {
        distance.as_kernel().ok_or_else(|| {
            AbcError::Config(ErrorInfo::new(
                "kernel-required",
                "stochastic acceptor needs a stochastic kernel",
            ))
        })
    }

    fn refresh(
        &mut self,
        t: usize,
        get_weighted_distances: &mut WeightedDistanceSource<'_>,
        kernel: &dyn StochasticKernel,
    ) -> Result<(), AbcError> {
        let prev = self.pdf_norms.values().copied().reduce(f64::max);
        let pdf_norm = self
            .pdf_norm_method
            .compute(kernel.pdf_max(), get_weighted_distances, prev)?;
        debug!(t, pdf_norm, "pdf normalisation");
        self.pdf_norms.insert(t, pdf_norm);
        Ok(())
    }
}

impl Acceptor for StochasticAcceptor {
    fn initialize(
        &mut self,
        t: usize,
        get_weighted_distances: &mut WeightedDistanceSource<'_>,
        distance: &dyn Distance,
        _x_0: &SumStats,
    ) -> Result<(), AbcError> {
        let kernel = Self::kernel_of(distance)?;
        self.kernel_scale = Some(kernel.ret_scale());
        self.refresh(t, get_weighted_distances, kernel)
    }

    fn update(
        &mut self,
        t: usize,
        weighted_distances: &[WeightedDistance],
        distance: &dyn Distance,
        _acceptance_rate: f64,
    ) -> Result<(), AbcError> {
        let kernel = Self::kernel_of(distance)?;
        self.refresh(t, &mut || Ok(weighted_distances.to_vec()), kernel)
    }

    fn accept(
        &self,
        distance: &dyn Distance,
        eps: &dyn Epsilon,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        parameter: &Parameter,
        rng: &mut RngHandle,
    ) -> Result<AcceptorResult, AbcError> {
        let kernel = Self::kernel_of(distance)?;
        let temperature = eps.value(t)?;
        let pd = distance.evaluate(x, x_0, t, parameter)?;
        let pdf_norm = self
            .pdf_norms
            .get(&t)
            .copied()
            .ok_or_else(|| AbcError::missing_generation("pdf normalisation", t))?;

        let rescaled = match kernel.ret_scale() {
            KernelScale::Lin => pd / pdf_norm,
            KernelScale::Log => (pd - pdf_norm).exp(),
        };
        let acceptance_probability = rescaled.powf(1.0 / temperature);
        let accept = acceptance_probability >= rng.uniform();
        let weight = if acceptance_probability == 0.0 {
            0.0
        } else {
            acceptance_probability / acceptance_probability.min(1.0)
        };

        if pd > pdf_norm {
            debug!(t, pd, pdf_norm, weight, "kernel value exceeds normalisation");
        }

        Ok(AcceptorResult {
            distance: pd,
            accept,
            weight,
        })
    }

    fn config(&self, t: usize) -> Option<AcceptorConfig> {
        let pdf_norm = self.pdf_norms.get(&t).copied()?;
        Some(AcceptorConfig {
            pdf_norm,
            kernel_scale: self.kernel_scale?,
        })
    }

    fn requires_kernel(&self) -> bool {
        true
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "name": "StochasticAcceptor",
            "pdf_norm_method": self.pdf_norm_method.name(),
        })
    }
}

/// Closure signature wrapped by [`FunctionAcceptor`].
pub type AcceptFn = dyn Fn(
        &dyn Distance,
        &dyn Epsilon,
        &SumStats,
        &SumStats,
        usize,
        &Parameter,
        &mut RngHandle,
    ) -> Result<AcceptorResult, AbcError>
    + Send
    + Sync;

/// Acceptor given by a closure with the signature of [`Acceptor::accept`].
pub struct FunctionAcceptor {
    function: Box<AcceptFn>,
}

impl FunctionAcceptor {
    /// Wraps `function`.
    pub fn new<F>(function: F) -> Self
    where
        F: Fn(
                &dyn Distance,
                &dyn Epsilon,
                &SumStats,
                &SumStats,
                usize,
                &Parameter,
                &mut RngHandle,
            ) -> Result<AcceptorResult, AbcError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            function: Box::new(function),
        }
    }
}

impl Acceptor for FunctionAcceptor {
    fn accept(
        &self,
        distance: &dyn Distance,
        eps: &dyn Epsilon,
        x: &SumStats,
        x_0: &SumStats,
        t: usize,
        parameter: &Parameter,
        rng: &mut RngHandle,
    ) -> Result<AcceptorResult, AbcError> {
        (self.function)(distance, eps, x, x_0, t, parameter, rng)
    }

    fn describe(&self) -> serde_json::Value {
        json!({ "name": "FunctionAcceptor" })
    }
}
