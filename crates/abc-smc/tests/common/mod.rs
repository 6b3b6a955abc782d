#![allow(dead_code)]

use abc_core::{AbcError, Sampler, SumStats};
use abc_smc::{
    AbcSmc, ConstantPopulationSize, FunctionModel, ParameterPrior, RandomVariable, RunConfig,
};
use rand::Rng;
use rand_distr::StandardNormal;

pub fn stats(pairs: &[(&str, f64)]) -> SumStats {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// `y ~ N(a, b^2)` reported as its single draw.
pub fn gaussian_model() -> FunctionModel {
    FunctionModel::new("gaussian", |parameter, rng| {
        let a = parameter.value("a").unwrap_or(0.0);
        let b = parameter.value("b").unwrap_or(1.0);
        let z: f64 = rng.sample(StandardNormal);
        Ok::<_, AbcError>(stats(&[("y", a + b * z)]))
    })
}

pub fn gaussian_prior() -> ParameterPrior {
    ParameterPrior::new()
        .with("a", RandomVariable::uniform(0.0, 5.0).unwrap())
        .with("b", RandomVariable::uniform(1.0, 8.0).unwrap())
}

pub fn gaussian_abc(seed: u64, sampler: impl Sampler + 'static) -> AbcSmc {
    let mut config = RunConfig::default();
    config.seed_policy.master_seed = seed;
    AbcSmc::builder(config)
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .population_strategy(ConstantPopulationSize::new(20).unwrap())
        .sampler(sampler)
        .build()
        .unwrap()
}
