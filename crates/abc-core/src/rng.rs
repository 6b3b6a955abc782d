//! Deterministic RNG wrapper and seed-derivation helpers.

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use siphasher::sip::SipHasher13;
use std::hash::Hasher;

/// Deterministic RNG handle passed to every stochastic component.
///
/// Priors, transition kernels, simulators and acceptors never own a global
/// generator; each call receives the handle of the evaluation it belongs to.
/// Substreams are derived by hashing `(master_seed, substream_id)` with
/// SipHash-1-3 under fixed zero keys, which keeps parallel execution
/// reproducible regardless of scheduling.
#[derive(Debug, Clone)]
pub struct RngHandle {
    rng: StdRng,
}

impl RngHandle {
    /// Creates a new RNG handle from a master seed.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Creates the handle for a derived substream of `master_seed`.
    pub fn substream(master_seed: u64, substream: u64) -> Self {
        Self::from_seed(derive_substream_seed(master_seed, substream))
    }

    /// Draws a uniform value in `[0, 1)`.
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Returns a mutable reference to the underlying RNG for advanced usage.
    pub fn inner_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

impl RngCore for RngHandle {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Derives the deterministic seed for a specific substream.
pub fn derive_substream_seed(master_seed: u64, substream: u64) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write_u64(master_seed);
    hasher.write_u64(substream);
    hasher.finish()
}

/// Draws an index with probability proportional to `weights`.
///
/// Falls back to the last positive entry when rounding leaves the cumulative
/// sum marginally below the drawn value. Returns `None` for empty or
/// all-zero weights.
pub fn weighted_choice(weights: &[f64], rng: &mut RngHandle) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if !(total > 0.0) {
        return None;
    }
    let target = rng.uniform() * total;
    let mut cumulative = 0.0;
    let mut last_positive = None;
    for (idx, &weight) in weights.iter().enumerate() {
        if weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = Some(idx);
        if target < cumulative {
            return Some(idx);
        }
    }
    last_positive
}
