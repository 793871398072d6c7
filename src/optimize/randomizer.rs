//! Pluggable, seedable initial-layout randomization — spec §4.H step 1.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Distribution shape for initial coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomizationShape {
    /// Uniform within a diameter equal to
    /// `max(table_distance) * randomization_diameter_multiplier`.
    Uniform,
    /// Normal distribution with equivalent spread.
    Normal,
}

/// Stateful, seedable source of random initial coordinates.
pub struct LayoutRandomizer {
    rng: ChaCha8Rng,
    shape: RandomizationShape,
    diameter: f64,
}

impl LayoutRandomizer {
    pub fn new(seed: u64, shape: RandomizationShape, diameter: f64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            shape,
            diameter,
        }
    }

    /// Derive a per-worker instance from a global seed and worker id, so
    /// parallel relax workers each have a distinct but reproducible stream
    /// (spec §5 "RNG").
    pub fn for_worker(global_seed: u64, worker_id: usize, shape: RandomizationShape, diameter: f64) -> Self {
        Self::new(global_seed.wrapping_add(worker_id as u64 * 0x9E3779B97F4A7C15), shape, diameter)
    }

    /// Fill `coords` with fresh random values.
    pub fn fill(&mut self, coords: &mut [f64]) {
        match self.shape {
            RandomizationShape::Uniform => {
                let half = self.diameter / 2.0;
                for c in coords.iter_mut() {
                    *c = self.rng.gen_range(-half..=half);
                }
            }
            RandomizationShape::Normal => {
                // Std-normal via Box-Muller, scaled so the 2-sigma spread
                // matches the requested diameter.
                let sigma = self.diameter / 4.0;
                let mut iter = coords.iter_mut();
                while let Some(c0) = iter.next() {
                    let u1: f64 = self.rng.gen_range(1e-12..1.0);
                    let u2: f64 = self.rng.gen_range(0.0..1.0);
                    let r = (-2.0 * u1.ln()).sqrt();
                    let z0 = r * (2.0 * std::f64::consts::PI * u2).cos();
                    *c0 = z0 * sigma;
                    if let Some(c1) = iter.next() {
                        let z1 = r * (2.0 * std::f64::consts::PI * u2).sin();
                        *c1 = z1 * sigma;
                    }
                }
            }
        }
    }
}
