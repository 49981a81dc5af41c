//! Random-number plumbing and discrete distributions.

pub mod distribution;

pub use distribution::Distribution1D;

use glam::{Vec2, Vec3};
use rand::RngCore;

/// Uniform `f32` in `[0, 1)` from the top 24 bits of the next word.
pub fn next_f32(rng: &mut dyn RngCore) -> f32 {
    (rng.next_u32() >> 8) as f32 * (1.0 / (1u32 << 24) as f32)
}

/// Uniform point in `[0, 1)^2`.
pub fn next_vec2(rng: &mut dyn RngCore) -> Vec2 {
    Vec2::new(next_f32(rng), next_f32(rng))
}

/// Uniform point in `[0, 1)^3`.
pub fn next_vec3(rng: &mut dyn RngCore) -> Vec3 {
    Vec3::new(next_f32(rng), next_f32(rng), next_f32(rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn next_f32_stays_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut mean = 0.0f64;
        for _ in 0..100_000 {
            let u = next_f32(&mut rng);
            assert!((0.0..1.0).contains(&u));
            mean += u as f64;
        }
        mean /= 100_000.0;
        assert!((mean - 0.5).abs() < 0.01, "mean {} far from 0.5", mean);
    }
}
