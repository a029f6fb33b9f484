//! Process-wide seeding.
//!
//! Call [`seed_everything`] once before building models: it seeds the device
//! generator used for weight initialization and dropout, and returns the root
//! RNG. Split and shuffle generators are seeded with values drawn from that
//! root through [`draw_seeds`], so one seed fixes every stream.

use candle_core::Device;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed the device RNG and return a root RNG seeded with `seed`.
///
/// Backends that cannot be seeded are logged and skipped; the host-side
/// generators stay deterministic either way.
pub fn seed_everything(seed: u64, device: &Device) -> StdRng {
    match device.set_seed(seed) {
        Ok(()) => tracing::debug!("Seeded {:?} with {}", device, seed),
        Err(e) => tracing::warn!("Device {:?} does not support seeding: {}", device, e),
    }
    StdRng::seed_from_u64(seed)
}

/// Draw `N` child seeds from the root RNG, in order.
pub fn draw_seeds<const N: usize>(root: &mut StdRng) -> [u64; N] {
    let mut seeds = [0u64; N];
    for seed in &mut seeds {
        *seed = root.gen();
    }
    seeds
}
