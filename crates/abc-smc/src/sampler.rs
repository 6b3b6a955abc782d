//! Execution engines running the per-generation closure.
//!
//! Evaluation `i` always draws from substream `i` of the generation seed and
//! results are consumed in index order, so the serial and the multi-threaded
//! engine return identical samples.

use abc_core::errors::ErrorInfo;
use abc_core::{AbcError, Particle, Retention, RngHandle, Sample, Sampler, SimulateOne};
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use crate::config::SamplerConfig;

/// Builds the engine described by `config`.
pub fn from_config(config: &SamplerConfig) -> Result<Box<dyn Sampler>, AbcError> {
    if config.threads <= 1 {
        let mut sampler = SingleCoreSampler::new();
        sampler.max_evaluations = config.max_evaluations;
        Ok(Box::new(sampler))
    } else {
        let mut sampler = MulticoreSampler::new(config.threads, config.batch_size)?;
        sampler.max_evaluations = config.max_evaluations;
        Ok(Box::new(sampler))
    }
}

fn budget_exhausted(limit: usize, n: usize, accepted: usize) -> AbcError {
    AbcError::Sampler(
        ErrorInfo::new("max-evaluations", "evaluation budget exhausted before enough acceptances")
            .with_context("max_evaluations", limit)
            .with_context("requested", n)
            .with_context("accepted", accepted),
    )
}

/// Accumulates evaluations in index order until `n` are accepted.
struct Collector {
    n: usize,
    retention: Retention,
    accepted: usize,
    evaluations: usize,
    particles: Vec<Particle>,
}

impl Collector {
    fn new(n: usize, retention: Retention) -> Self {
        Self {
            n,
            retention,
            accepted: 0,
            evaluations: 0,
            particles: Vec::new(),
        }
    }

    fn done(&self) -> bool {
        self.accepted >= self.n
    }

    fn push(&mut self, particle: Particle) {
        self.evaluations += 1;
        if particle.accepted {
            self.accepted += 1;
            self.particles.push(particle);
        } else if self.retention == Retention::All {
            self.particles.push(particle);
        }
    }

    fn finish(self) -> Sample {
        Sample {
            particles: self.particles,
            nr_evaluations: self.evaluations,
        }
    }
}

/// Evaluates proposals one after the other on the calling thread.
#[derive(Debug, Clone, Default)]
pub struct SingleCoreSampler {
    /// Optional cap on evaluations per call.
    pub max_evaluations: Option<usize>,
    nr_evaluations: usize,
}

impl SingleCoreSampler {
    /// Serial engine without an evaluation cap.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sampler for SingleCoreSampler {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        simulate_one: &SimulateOne<'_>,
        seed: u64,
        retention: Retention,
    ) -> Result<Sample, AbcError> {
        let mut collector = Collector::new(n, retention);
        let mut index = 0u64;
        while !collector.done() {
            if let Some(limit) = self.max_evaluations {
                if collector.evaluations >= limit {
                    return Err(budget_exhausted(limit, n, collector.accepted));
                }
            }
            let mut rng = RngHandle::substream(seed, index);
            collector.push(simulate_one(&mut rng)?);
            index += 1;
        }
        self.nr_evaluations = collector.evaluations;
        Ok(collector.finish())
    }

    fn nr_evaluations(&self) -> usize {
        self.nr_evaluations
    }
}

/// Evaluates proposals in ordered batches on a rayon thread pool.
///
/// Evaluations past the `n`-th acceptance within the last batch are
/// discarded and not counted.
pub struct MulticoreSampler {
    pool: ThreadPool,
    batch_size: usize,
    /// Optional cap on evaluations per call.
    pub max_evaluations: Option<usize>,
    nr_evaluations: usize,
}

impl MulticoreSampler {
    /// Engine with `threads` workers scheduling `batch_size` evaluations at a time.
    pub fn new(threads: usize, batch_size: usize) -> Result<Self, AbcError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .build()
            .map_err(|err| {
                AbcError::Sampler(
                    ErrorInfo::new("thread-pool", err.to_string()).with_context("threads", threads),
                )
            })?;
        Ok(Self {
            pool,
            batch_size: batch_size.max(1),
            max_evaluations: None,
            nr_evaluations: 0,
        })
    }

    /// Worker threads in the pool.
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl Sampler for MulticoreSampler {
    fn sample_until_n_accepted(
        &mut self,
        n: usize,
        simulate_one: &SimulateOne<'_>,
        seed: u64,
        retention: Retention,
    ) -> Result<Sample, AbcError> {
        let mut collector = Collector::new(n, retention);
        let mut next = 0u64;
        while !collector.done() {
            let mut batch = self.batch_size as u64;
            if let Some(limit) = self.max_evaluations {
                let remaining = limit.saturating_sub(collector.evaluations) as u64;
                if remaining == 0 {
                    return Err(budget_exhausted(limit, n, collector.accepted));
                }
                batch = batch.min(remaining);
            }
            let start = next;
            let results: Vec<Result<Particle, AbcError>> = self.pool.install(|| {
                (start..start + batch)
                    .into_par_iter()
                    .map(|index| {
                        let mut rng = RngHandle::substream(seed, index);
                        simulate_one(&mut rng)
                    })
                    .collect()
            });
            next += batch;
            debug!(start, batch, accepted = collector.accepted, "sampler batch");
            for result in results {
                if collector.done() {
                    break;
                }
                collector.push(result?);
            }
        }
        self.nr_evaluations = collector.evaluations;
        Ok(collector.finish())
    }

    fn nr_evaluations(&self) -> usize {
        self.nr_evaluations
    }
}
