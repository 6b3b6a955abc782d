mod common;

use abc_core::History;
use abc_smc::history::{population_path, run_dir};
use abc_smc::{GroundTruth, RunHistory, SingleCoreSampler, StorageTarget};
use common::{gaussian_abc, stats};
use tempfile::tempdir;

#[test]
fn run_resumes_after_reload() {
    let dir = tempdir().unwrap();
    let target = StorageTarget::Directory(dir.path().to_path_buf());
    let observed = stats(&[("y", 2.5)]);

    let mut first = gaussian_abc(13, SingleCoreSampler::new());
    let id = first
        .new(&target, observed.clone(), GroundTruth::default())
        .unwrap();
    first.run(0.0, Some(2), 0.0).unwrap();
    let stored_eps: Vec<f64> = first
        .history()
        .unwrap()
        .generations()
        .iter()
        .map(|summary| summary.epsilon)
        .collect();

    let run = run_dir(dir.path(), id);
    assert!(run.join("run.json").exists());
    assert!(population_path(&run, 0).exists());
    assert!(population_path(&run, 1).exists());

    let mut second = gaussian_abc(13, SingleCoreSampler::new());
    assert_eq!(second.load(&target, id, None).unwrap(), id);
    assert_eq!(second.observed_sum_stats(), &observed);
    let history = second.run(0.0, Some(1), 0.0).unwrap();
    assert_eq!(history.n_populations(), 3);
    assert_eq!(history.max_t(), Some(2));
    let generations = history.generations();
    assert!((generations[0].epsilon - stored_eps[0]).abs() < 1e-12);
    assert!((generations[1].epsilon - stored_eps[1]).abs() < 1e-12);
    assert!(generations[2].epsilon <= generations[1].epsilon + 1e-9);

    let reloaded = RunHistory::load(&target, id).unwrap();
    assert_eq!(reloaded.n_populations(), 3);
    assert_eq!(reloaded.sessions().len(), 2);
    assert!(reloaded
        .sessions()
        .iter()
        .all(|session| session.finished.is_some()));
    assert!(reloaded.calibration_samples() > 0);
}

#[test]
fn new_runs_get_fresh_ids() {
    let dir = tempdir().unwrap();
    let target = StorageTarget::Directory(dir.path().to_path_buf());
    let mut abc = gaussian_abc(1, SingleCoreSampler::new());
    let first = abc
        .new(&target, stats(&[("y", 1.0)]), GroundTruth::default())
        .unwrap();
    let second = abc
        .new(&target, stats(&[("y", 1.0)]), GroundTruth::default())
        .unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 2);
}

#[test]
fn observed_statistics_can_be_overridden_on_load() {
    let dir = tempdir().unwrap();
    let target = StorageTarget::Directory(dir.path().to_path_buf());
    let mut abc = gaussian_abc(2, SingleCoreSampler::new());
    let id = abc
        .new(&target, stats(&[("y", 1.0)]), GroundTruth::default())
        .unwrap();

    let mut other = gaussian_abc(2, SingleCoreSampler::new());
    other.load(&target, id, Some(stats(&[("y", 4.0)]))).unwrap();
    assert_eq!(other.observed_sum_stats(), &stats(&[("y", 4.0)]));
    let reloaded = RunHistory::load(&target, id).unwrap();
    assert_eq!(
        reloaded.observed_sum_stats().unwrap(),
        stats(&[("y", 4.0)])
    );
}

#[test]
fn memory_runs_cannot_be_reloaded() {
    let mut abc = gaussian_abc(3, SingleCoreSampler::new());
    let err = abc.load(&StorageTarget::Memory, 1, None).unwrap_err();
    assert_eq!(err.info().code, "history-not-persistent");
}

#[test]
fn missing_run_is_a_storage_error() {
    let dir = tempdir().unwrap();
    let target = StorageTarget::Directory(dir.path().to_path_buf());
    let err = RunHistory::load(&target, 42).unwrap_err();
    assert_eq!(err.info().code, "history-read");
}

#[test]
fn appending_out_of_order_is_rejected() {
    let mut abc = gaussian_abc(4, SingleCoreSampler::new());
    abc.new(
        &StorageTarget::Memory,
        stats(&[("y", 2.0)]),
        GroundTruth::default(),
    )
    .unwrap();
    abc.run(0.0, Some(1), 0.0).unwrap();
    let population = abc.history().unwrap().get_population(Some(0)).unwrap();

    let mut history = RunHistory::create(&StorageTarget::Memory, Default::default()).unwrap();
    history
        .append_population(3, 1.0, &population, 20, &[])
        .unwrap();
    let err = history
        .append_population(2, 1.0, &population, 20, &[])
        .unwrap_err();
    assert_eq!(err.info().code, "non-monotonic-append");
    let lookup = history.get_population(Some(1)).unwrap_err();
    assert!(lookup.is_lookup());
}
