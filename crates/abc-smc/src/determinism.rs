use abc_core::derive_substream_seed;

const CALIBRATION_SALT: u64 = 0xCA1B_CA1B_CA1B_CA1B;
const ADAPTATION_SALT: u64 = 0xADA9_ADA9_ADA9_ADA9;

/// Seed handed to the sampler for generation `t`; evaluation `i` then uses
/// substream `i` of it.
pub fn generation_seed(master_seed: u64, t: usize) -> u64 {
    derive_substream_seed(master_seed, t as u64)
}

/// Seed of the prior sample drawn to calibrate distance, epsilon and acceptor.
pub fn calibration_seed(master_seed: u64) -> u64 {
    derive_substream_seed(master_seed ^ CALIBRATION_SALT, 0)
}

/// Seed used by the population size strategy before generation `t`.
pub fn adaptation_seed(master_seed: u64, t: usize) -> u64 {
    derive_substream_seed(master_seed ^ ADAPTATION_SALT, t as u64)
}
