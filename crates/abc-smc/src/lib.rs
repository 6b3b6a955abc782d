#![deny(missing_docs)]
#![doc = include_str!("../docs/abc-smc-api.md")]

//! Approximate Bayesian computation by sequential Monte Carlo.

/// Acceptance rules, including the stochastic acceptor.
pub mod acceptor;
/// YAML configuration schema and defaults.
pub mod config;
/// Deterministic seed derivation helpers.
pub mod determinism;
/// Distances and stochastic kernels.
pub mod distance;
/// Threshold schedulers.
pub mod epsilon;
/// Run history persistence.
pub mod history;
/// Closure-backed simulators.
pub mod model;
/// Population size strategies.
pub mod population_strategy;
/// Per-evaluation proposal, simulation and weighting.
pub mod proposal;
/// Priors and the model perturbation kernel.
pub mod random_variables;
/// Serial and multi-threaded execution engines.
pub mod sampler;
/// The orchestrator and its `run` entry points.
pub mod smc;
/// Temperature schedules for stochastic acceptance.
pub mod temperature;
/// Kernel density transitions.
pub mod transition;

pub use acceptor::{
    Acceptor, AcceptorConfig, AcceptorResult, FunctionAcceptor, KernelPdfNorm, MaxFoundPdfNorm,
    StochasticAcceptor, UniformAcceptor,
};
pub use config::{
    Bandwidth, ModelPerturbationConfig, PopulationConfig, RunConfig, SamplerConfig, SeedPolicy,
    StoppingConfig, TransitionConfig,
};
pub use distance::{
    AdaptivePNormDistance, Distance, FunctionDistance, FunctionKernel, KernelScale, NormalKernel,
    PNormDistance, ScaleFunction, StochasticKernel, Variance,
};
pub use epsilon::{ConstantEpsilon, Epsilon, ListEpsilon, QuantileEpsilon};
pub use history::{RunHistory, StorageTarget};
pub use model::FunctionModel;
pub use population_strategy::{AdaptivePopulationSize, ConstantPopulationSize, PopulationStrategy};
pub use random_variables::{ModelPerturbationKernel, ModelPrior, ParameterPrior, RandomVariable};
pub use sampler::{MulticoreSampler, SingleCoreSampler};
pub use smc::{AbcSmc, AbcSmcBuilder, GroundTruth};
pub use temperature::{Aggregation, Temperature};
pub use transition::MultivariateNormalTransition;
