#![deny(missing_docs)]
#![doc = "Core data model and capability contracts for the ABC-SMC engine."]

pub mod capabilities;
pub mod errors;
pub mod floats;
mod parameter;
pub mod population;
pub mod rng;

pub use capabilities::{
    DynModel, GenerationSummary, History, Model, Prior, Retention, RunMetadata, SampleMarker,
    Sampler, SimulateOne, Transition,
};
pub use errors::{AbcError, ErrorInfo};
pub use parameter::{ModelIndex, Parameter, SumStats};
pub use population::{ModelProbabilities, Particle, Population, Sample, WeightedDistance};
pub use rng::{derive_substream_seed, weighted_choice, RngHandle};
