use abc_core::{Parameter, Particle, Population, Sample};
use proptest::prelude::*;

fn particle(m: usize, weight: f64, accepted: bool, distance: f64) -> Particle {
    let parameter: Parameter = [("theta", m as f64 + weight)].into_iter().collect();
    let stats = [("y".to_string(), distance)].into_iter().collect();
    Particle {
        m,
        parameter,
        weight,
        accepted_sum_stats: if accepted { vec![stats] } else { Vec::new() },
        accepted_distances: if accepted { vec![distance] } else { Vec::new() },
        rejected_sum_stats: Vec::new(),
        rejected_distances: if accepted { Vec::new() } else { vec![distance] },
        accepted,
    }
}

#[test]
fn population_without_accepted_particle_is_rejected() {
    let err = Population::new(vec![particle(0, 1.0, false, 2.0)]).unwrap_err();
    assert_eq!(err.info().code, "no-accepted-particle");
    assert!(Population::new(Vec::new()).unwrap().is_empty());
}

#[test]
fn zero_total_weight_is_rejected() {
    let err = Population::new(vec![particle(0, 0.0, true, 2.0)]).unwrap_err();
    assert_eq!(err.info().code, "invalid-total-weight");
}

#[test]
fn distribution_normalises_within_model() {
    let population = Population::new(vec![
        particle(0, 1.0, true, 0.5),
        particle(0, 3.0, true, 0.1),
        particle(1, 4.0, true, 0.2),
    ])
    .unwrap();
    let (params, weights) = population.distribution(0);
    assert_eq!(params.len(), 2);
    assert!((weights[0] - 0.25).abs() < 1e-12);
    assert!((weights[1] - 0.75).abs() < 1e-12);

    let probs = population.model_probabilities();
    assert!((probs.get(0) - 0.5).abs() < 1e-12);
    assert!((probs.get(1) - 0.5).abs() < 1e-12);
    assert_eq!(probs.alive(), vec![0, 1]);
    assert_eq!(probs.get(2), 0.0);
}

#[test]
fn update_distances_rewrites_accepted_distances() {
    let mut population = Population::new(vec![particle(0, 1.0, true, 0.5)]).unwrap();
    population
        .update_distances(|stats, _| Ok(stats["y"] * 10.0))
        .unwrap();
    assert_eq!(population.particles()[0].accepted_distances, vec![5.0]);
}

#[test]
fn sample_views_skip_rejected_particles() {
    let sample = Sample {
        particles: vec![
            particle(0, 1.0, true, 0.5),
            particle(0, 0.0, false, 9.0),
            particle(1, 1.0, true, 0.7),
        ],
        nr_evaluations: 3,
    };
    assert_eq!(sample.n_accepted(), 2);
    assert_eq!(sample.accepted_population().unwrap().len(), 2);
    assert_eq!(sample.first_n_sum_stats(1).len(), 1);
}

proptest! {
    #[test]
    fn model_probabilities_sum_to_one(
        entries in prop::collection::vec((0usize..4, 0.001f64..10.0), 1..40)
    ) {
        let particles = entries
            .iter()
            .map(|(m, w)| particle(*m, *w, true, 1.0))
            .collect();
        let population = Population::new(particles).unwrap();
        let total: f64 = population.model_probabilities().iter().map(|(_, p)| p).sum();
        prop_assert!((total - 1.0).abs() < 1e-9);

        let weight_total: f64 = population.weighted_distances().iter().map(|row| row.weight).sum();
        prop_assert!((weight_total - 1.0).abs() < 1e-9);
    }
}
