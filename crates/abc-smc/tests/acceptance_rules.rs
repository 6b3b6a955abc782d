mod common;

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, Parameter, RngHandle, SumStats, WeightedDistance};
use abc_smc::acceptor::AcceptorConfig;
use abc_smc::epsilon::{EpsilonContext, GenerationStats};
use abc_smc::{
    Acceptor, ConstantEpsilon, Distance, Epsilon, FunctionDistance, FunctionKernel, KernelPdfNorm,
    KernelScale, ListEpsilon, PNormDistance, StochasticAcceptor, Temperature, UniformAcceptor,
};
use common::stats;
use proptest::prelude::*;

fn no_rows() -> Result<Vec<WeightedDistance>, AbcError> {
    Ok(Vec::new())
}

fn rows(values: &[f64]) -> Vec<WeightedDistance> {
    values
        .iter()
        .map(|&distance| WeightedDistance { distance, weight: 1.0, m: 0 })
        .collect()
}

/// Distance shrinking with the generation index, so later thresholds admit
/// points earlier ones rejected.
fn shrinking_distance() -> FunctionDistance {
    FunctionDistance::new("shrinking", |x: &SumStats, x_0: &SumStats, t, _: &Parameter| {
        Ok((x["y"] - x_0["y"]).abs() / (t as f64 + 1.0))
    })
}

fn linear_kernel(pdf_max: f64) -> FunctionKernel {
    FunctionKernel::new(KernelScale::Lin, |x: &SumStats, _: &SumStats, _, _: &Parameter| {
        Ok(x["pd"])
    })
    .with_pdf_max(pdf_max)
}

fn stochastic_acceptor(kernel: &FunctionKernel) -> StochasticAcceptor {
    let mut acceptor = StochasticAcceptor::new(KernelPdfNorm);
    acceptor
        .initialize(0, &mut no_rows, kernel, &stats(&[("pd", 1.0)]))
        .unwrap();
    acceptor
}

proptest! {
    #[test]
    fn current_time_accepts_iff_within_threshold(y in -10.0f64..10.0, eps in 0.0f64..5.0) {
        let distance = PNormDistance::new(1.0).unwrap();
        let threshold = ConstantEpsilon::new(eps);
        let acceptor = UniformAcceptor::current_time();
        let x_0 = stats(&[("y", 0.0)]);
        let x = stats(&[("y", y)]);
        let mut rng = RngHandle::from_seed(0);
        let result = acceptor
            .accept(&distance, &threshold, &x, &x_0, 0, &Parameter::new(), &mut rng)
            .unwrap();
        prop_assert_eq!(result.accept, y.abs() <= eps);
        prop_assert_eq!(result.weight, 1.0);
    }

    #[test]
    fn complete_history_implies_current_time(y in -10.0f64..10.0) {
        let distance = shrinking_distance();
        let eps = ListEpsilon::new(vec![3.0, 2.0, 1.5]);
        let x_0 = stats(&[("y", 0.0)]);
        let x = stats(&[("y", y)]);
        let mut rng = RngHandle::from_seed(1);
        let complete = UniformAcceptor::complete_history()
            .accept(&distance, &eps, &x, &x_0, 2, &Parameter::new(), &mut rng)
            .unwrap();
        let current = UniformAcceptor::current_time()
            .accept(&distance, &eps, &x, &x_0, 2, &Parameter::new(), &mut rng)
            .unwrap();
        prop_assert!(!complete.accept || current.accept);
    }

    #[test]
    fn stochastic_weight_vanishes_only_with_zero_probability(pd in 0.0f64..3.0) {
        let kernel = linear_kernel(1.0);
        let acceptor = stochastic_acceptor(&kernel);
        let temperature = ConstantEpsilon::new(1.0);
        let mut rng = RngHandle::from_seed(2);
        let result = acceptor
            .accept(
                &kernel,
                &temperature,
                &stats(&[("pd", pd)]),
                &stats(&[("pd", 1.0)]),
                0,
                &Parameter::new(),
                &mut rng,
            )
            .unwrap();
        if pd == 0.0 {
            prop_assert_eq!(result.weight, 0.0);
        } else {
            prop_assert!(result.weight >= 1.0);
        }
        if pd >= 1.0 {
            prop_assert!(result.accept);
        }
    }

    #[test]
    fn temperatures_never_increase_and_end_at_one(
        log_densities in proptest::collection::vec(-30.0f64..0.0, 5..40),
        generations in 2usize..6,
    ) {
        let config = Some(AcceptorConfig { pdf_norm: 0.0, kernel_scale: KernelScale::Log });
        let weighted = rows(&log_densities);
        let records: Vec<(f64, f64)> = log_densities.iter().map(|&pd| (pd, 1.0)).collect();
        let mut temperature = Temperature::new();
        temperature
            .initialize(
                0,
                &mut || Ok(weighted.clone()),
                &EpsilonContext { max_nr_populations: Some(generations), acceptor_config: config },
            )
            .unwrap();
        for t in 1..generations {
            temperature
                .update(
                    t,
                    &weighted,
                    &GenerationStats { acceptance_rate: 0.2, acceptor_config: config, records: &records },
                )
                .unwrap();
        }
        let values: Vec<f64> = (0..generations).map(|t| temperature.value(t).unwrap()).collect();
        prop_assert!(values.iter().all(|v| *v >= 1.0));
        prop_assert!(values.windows(2).all(|pair| pair[1] <= pair[0]));
        prop_assert_eq!(values[generations - 1], 1.0);
    }
}

#[test]
fn complete_history_rejects_what_an_earlier_threshold_excluded() {
    let distance = shrinking_distance();
    let eps = ListEpsilon::new(vec![3.0, 2.0, 1.5]);
    let x_0 = stats(&[("y", 0.0)]);
    let x = stats(&[("y", 4.0)]);
    let mut rng = RngHandle::from_seed(3);
    let current = UniformAcceptor::current_time()
        .accept(&distance, &eps, &x, &x_0, 2, &Parameter::new(), &mut rng)
        .unwrap();
    let complete = UniformAcceptor::complete_history()
        .accept(&distance, &eps, &x, &x_0, 2, &Parameter::new(), &mut rng)
        .unwrap();
    assert!(current.accept);
    assert!(!complete.accept);
}

#[test]
fn complete_history_skips_generations_without_values() {
    let distance = FunctionDistance::new("late", |x: &SumStats, x_0: &SumStats, t, _: &Parameter| {
        if t == 0 {
            Err(AbcError::missing_generation("weights", t))
        } else {
            Ok((x["y"] - x_0["y"]).abs())
        }
    });
    let eps = ConstantEpsilon::new(1.0);
    let mut rng = RngHandle::from_seed(4);
    let result = UniformAcceptor::complete_history()
        .accept(
            &distance,
            &eps,
            &stats(&[("y", 0.5)]),
            &stats(&[("y", 0.0)]),
            1,
            &Parameter::new(),
            &mut rng,
        )
        .unwrap();
    assert!(result.accept);
}

#[test]
fn complete_history_propagates_other_failures() {
    let distance = FunctionDistance::new("broken", |x: &SumStats, x_0: &SumStats, t, _: &Parameter| {
        if t == 0 {
            Err(AbcError::Distance(ErrorInfo::new("broken", "cannot evaluate")))
        } else {
            Ok((x["y"] - x_0["y"]).abs())
        }
    });
    let eps = ConstantEpsilon::new(1.0);
    let mut rng = RngHandle::from_seed(5);
    let err = UniformAcceptor::complete_history()
        .accept(
            &distance,
            &eps,
            &stats(&[("y", 0.5)]),
            &stats(&[("y", 0.0)]),
            1,
            &Parameter::new(),
            &mut rng,
        )
        .unwrap_err();
    assert_eq!(err.info().code, "broken");
}

#[test]
fn linear_kernel_acceptance_matches_density_ratio() {
    let kernel = FunctionKernel::new(KernelScale::Lin, |x: &SumStats, x_0: &SumStats, _, _: &Parameter| {
        let d = x["y"] - x_0["y"];
        Ok((-0.5 * d * d).exp())
    });
    let mut kernel = kernel;
    let x_0 = stats(&[("y", 0.0)]);
    kernel.initialize(0, &mut || Ok(Vec::new()), &x_0).unwrap();
    assert_eq!(abc_smc::StochasticKernel::pdf_max(&kernel), Some(1.0));

    let mut acceptor = StochasticAcceptor::new(KernelPdfNorm);
    acceptor.initialize(0, &mut no_rows, &kernel, &x_0).unwrap();
    let temperature = ConstantEpsilon::new(1.0);

    let x = stats(&[("y", 1.0)]);
    let expected = (-0.5f64).exp();
    let trials = 20_000;
    let mut accepted = 0usize;
    for i in 0..trials {
        let mut rng = RngHandle::substream(99, i as u64);
        let result = acceptor
            .accept(&kernel, &temperature, &x, &x_0, 0, &Parameter::new(), &mut rng)
            .unwrap();
        assert_eq!(result.weight, 1.0);
        if result.accept {
            accepted += 1;
        }
    }
    let rate = accepted as f64 / trials as f64;
    assert!((rate - expected).abs() < 0.02, "rate {rate} expected {expected}");
}

#[test]
fn stochastic_acceptor_refuses_plain_distances() {
    let mut acceptor = StochasticAcceptor::default();
    let distance = PNormDistance::new(1.0).unwrap();
    let err = acceptor
        .initialize(0, &mut no_rows, &distance, &stats(&[("y", 0.0)]))
        .unwrap_err();
    assert_eq!(err.info().code, "kernel-required");
}

#[test]
fn pdf_norm_never_decreases() {
    let kernel = linear_kernel(0.5);
    let mut acceptor = StochasticAcceptor::default();
    let first = rows(&[0.2, 0.9, 0.4]);
    acceptor
        .initialize(0, &mut || Ok(first.clone()), &kernel, &stats(&[("pd", 1.0)]))
        .unwrap();
    acceptor.update(1, &rows(&[0.1, 0.3]), &kernel, 0.5).unwrap();
    acceptor.update(2, &rows(&[1.4]), &kernel, 0.5).unwrap();
    let norms: Vec<f64> = acceptor.pdf_norms().values().copied().collect();
    assert_eq!(norms, vec![0.9, 0.9, 1.4]);
    assert_eq!(acceptor.config(1).unwrap().pdf_norm, 0.9);
}
