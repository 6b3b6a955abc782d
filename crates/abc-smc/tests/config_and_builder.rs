mod common;

use std::fs;

use abc_core::History;
use abc_smc::{
    AbcSmc, Bandwidth, ConstantEpsilon, FunctionKernel, KernelScale, PNormDistance,
    PopulationConfig, RunConfig, StochasticAcceptor, StorageTarget, Temperature,
};
use abc_smc::{ConstantPopulationSize, GroundTruth, ListEpsilon, ModelPrior, SingleCoreSampler};
use common::{gaussian_abc, gaussian_model, gaussian_prior, stats};
use tempfile::tempdir;

const YAML: &str = r#"
population:
  type: adaptive
  start_size: 50
  max_size: 400
sampler:
  threads: 4
  batch_size: 16
seed_policy:
  master_seed: 1234
  label: nightly
stopping:
  max_nr_populations: 8
  minimum_epsilon: 0.1
transition:
  bandwidth: scott
"#;

#[test]
fn yaml_fills_in_defaults() {
    let config = RunConfig::from_yaml_str(YAML).unwrap();
    match config.population {
        PopulationConfig::Adaptive {
            start_size,
            mean_cv,
            min_size,
            max_size,
            n_bootstrap,
            samples_per_parameter,
        } => {
            assert_eq!(start_size, 50);
            assert_eq!(mean_cv, 0.05);
            assert_eq!(min_size, 10);
            assert_eq!(max_size, Some(400));
            assert_eq!(n_bootstrap, 10);
            assert_eq!(samples_per_parameter, 1);
        }
        other => panic!("unexpected population config {other:?}"),
    }
    assert_eq!(config.sampler.threads, 4);
    assert_eq!(config.sampler.batch_size, 16);
    assert_eq!(config.seed_policy.master_seed, 1234);
    assert_eq!(config.seed_policy.label.as_deref(), Some("nightly"));
    assert_eq!(config.stopping.max_nr_populations, Some(8));
    assert!(!config.stopping.stop_if_only_single_model_alive);
    assert_eq!(config.transition.bandwidth, Bandwidth::Scott);
    assert_eq!(config.transition.scaling, 1.0);
    assert_eq!(config.transition.min_bandwidth, 0.05);
    assert_eq!(config.model_perturbation.probability_to_stay, 0.7);
    assert_eq!(config.max_number_particles_for_distance_update, 1000);
}

#[test]
fn yaml_round_trips_through_a_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("run.yaml");
    let config = RunConfig::from_yaml_str(YAML).unwrap();
    fs::write(&path, config.to_yaml_string().unwrap()).unwrap();
    assert_eq!(RunConfig::load(&path).unwrap(), config);
}

#[test]
fn unknown_population_type_is_a_parse_error() {
    let err = RunConfig::from_yaml_str("population:\n  type: elastic\n").unwrap_err();
    assert_eq!(err.info().code, "config-parse");
}

#[test]
fn missing_config_file_reports_path() {
    let dir = tempdir().unwrap();
    let err = RunConfig::load(&dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.info().code, "config-read");
    assert!(err.info().context.contains_key("path"));
}

#[test]
fn kernel_scale_names_parse() {
    assert_eq!("lin".parse::<KernelScale>().unwrap(), KernelScale::Lin);
    assert_eq!("RET_SCALE_LOG".parse::<KernelScale>().unwrap(), KernelScale::Log);
    let err = "cubic".parse::<KernelScale>().unwrap_err();
    assert_eq!(err.info().code, "unsupported-kernel-scale");
}

#[test]
fn builder_requires_a_model() {
    let err = AbcSmc::builder(RunConfig::default()).build().err().unwrap();
    assert_eq!(err.info().code, "no-models");
}

#[test]
fn builder_checks_prior_count() {
    let err = AbcSmc::builder(RunConfig::default())
        .model(gaussian_model())
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .build()
        .err()
        .unwrap();
    assert_eq!(err.info().code, "component-count-mismatch");
}

#[test]
fn model_prior_must_cover_the_registered_models() {
    let err = AbcSmc::builder(RunConfig::default())
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .model_prior(ModelPrior::weighted(vec![0.5, 0.5]).unwrap())
        .epsilon(ListEpsilon::new(vec![10.0]))
        .build()
        .err()
        .unwrap();
    assert_eq!(err.info().code, "model-prior-mismatch");
    assert_eq!(err.info().context["nr_models"], "1");
    assert_eq!(err.info().context["model_prior"], "2");
}

#[test]
fn matching_model_prior_runs() {
    let mut abc = AbcSmc::builder(RunConfig::default())
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .model_prior(ModelPrior::weighted(vec![0.2, 0.8]).unwrap())
        .epsilon(ListEpsilon::new(vec![10.0]))
        .population_strategy(ConstantPopulationSize::new(20).unwrap())
        .sampler(SingleCoreSampler::new())
        .build()
        .unwrap();
    abc.new(
        &StorageTarget::Memory,
        stats(&[("y", 1.0)]),
        GroundTruth::default(),
    )
    .unwrap();
    let history = abc.run(0.0, Some(1), 0.0).unwrap();
    assert_eq!(history.n_populations(), 1);
}

#[test]
fn stochastic_acceptor_needs_a_kernel() {
    let err = AbcSmc::builder(RunConfig::default())
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .distance(PNormDistance::new(2.0).unwrap())
        .acceptor(StochasticAcceptor::default())
        .epsilon(ConstantEpsilon::new(1.0))
        .build()
        .err()
        .unwrap();
    assert_eq!(err.info().code, "kernel-required");
}

#[test]
fn temperature_needs_a_kernel() {
    let err = AbcSmc::builder(RunConfig::default())
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .epsilon(Temperature::new())
        .build()
        .err()
        .unwrap();
    assert_eq!(err.info().code, "kernel-required");
}

#[test]
fn kernel_setup_builds() {
    let kernel = FunctionKernel::new(KernelScale::Log, |x, x_0, _, _| {
        let d = x["y"] - x_0["y"];
        Ok(-0.5 * d * d)
    });
    assert!(AbcSmc::builder(RunConfig::default())
        .model(gaussian_model())
        .parameter_prior(gaussian_prior())
        .distance(kernel)
        .acceptor(StochasticAcceptor::default())
        .epsilon(Temperature::new())
        .build()
        .is_ok());
}

#[test]
fn run_without_a_run_is_rejected() {
    let mut abc = gaussian_abc(1, SingleCoreSampler::new());
    let err = abc.run(0.0, Some(1), 0.0).err().unwrap();
    assert_eq!(err.info().code, "no-active-run");
    abc.new(
        &StorageTarget::Memory,
        stats(&[("y", 1.0)]),
        GroundTruth::default(),
    )
    .unwrap();
    assert!(abc.run(0.0, Some(1), 0.0).is_ok());
}
