mod common;

use abc_core::{AbcError, History};
use abc_smc::{
    AbcSmc, ConstantPopulationSize, FunctionModel, GroundTruth, ListEpsilon, ParameterPrior,
    RandomVariable, RunConfig, StorageTarget,
};
use common::{gaussian_model, gaussian_prior, stats};

/// Model whose output never comes close to the observation.
fn distant_model() -> FunctionModel {
    FunctionModel::new("distant", |parameter, _rng| {
        let c = parameter.value("c").unwrap_or(0.0);
        Ok::<_, AbcError>(stats(&[("y", 1.0e6 + c)]))
    })
}

fn two_model_abc(stop_single: bool) -> AbcSmc {
    let mut config = RunConfig::default();
    config.seed_policy.master_seed = 77;
    config.stopping.stop_if_only_single_model_alive = stop_single;
    AbcSmc::builder(config)
        .model(gaussian_model())
        .model(distant_model())
        .parameter_prior(gaussian_prior())
        .parameter_prior(
            ParameterPrior::new().with("c", RandomVariable::uniform(0.0, 1.0).unwrap()),
        )
        .epsilon(ListEpsilon::new(vec![10.0, 8.0, 6.0]))
        .population_strategy(ConstantPopulationSize::new(15).unwrap())
        .build()
        .unwrap()
}

#[test]
fn distant_model_dies_in_the_first_generation() {
    let mut abc = two_model_abc(false);
    abc.new(
        &StorageTarget::Memory,
        stats(&[("y", 2.5)]),
        GroundTruth::default(),
    )
    .unwrap();
    let history = abc.run(0.0, Some(3), 0.0).unwrap();
    assert_eq!(history.n_populations(), 3);
    for t in 0..3 {
        let probabilities = history.get_model_probabilities(t).unwrap();
        assert_eq!(probabilities.alive(), vec![0]);
        assert!((probabilities.get(0) - 1.0).abs() < 1e-12);
    }
    assert_eq!(history.nr_of_models_alive().unwrap(), 1);
}

#[test]
fn single_surviving_model_stops_the_run() {
    let mut abc = two_model_abc(true);
    abc.new(
        &StorageTarget::Memory,
        stats(&[("y", 2.5)]),
        GroundTruth::default(),
    )
    .unwrap();
    let history = abc.run(0.0, Some(3), 0.0).unwrap();
    assert_eq!(history.n_populations(), 1);
}

#[test]
fn model_names_follow_registration_order() {
    let abc = two_model_abc(false);
    assert_eq!(
        abc.model_names(),
        vec!["gaussian".to_string(), "distant".to_string()]
    );
}
