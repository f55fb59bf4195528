//! Deterministic random number generation for weight initialisation.
//!
//! A lightweight xorshift PRNG: models built with the same seed get the same
//! weights, which the checkpoint and training tests rely on.

/// Xorshift generator seeded from `ModelOptions::seed`.
#[derive(Debug, Clone)]
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    /// Create a new RNG with explicit seed (if zero, use a fixed value).
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9e3779b97f4a7c15 } else { seed };
        Self { state }
    }

    /// Basic xorshift to generate u32.
    pub fn next_u32(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 32) as u32
    }

    /// Sample in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // 24 mantissa bits keep the result strictly below 1.0
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }

    /// Uniform sample in [low, high).
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32()
    }

    /// Fills `values` with samples from U(-limit, limit).
    pub fn fill_uniform(&mut self, values: &mut [f32], limit: f32) {
        for value in values.iter_mut() {
            *value = self.gen_range_f32(-limit, limit);
        }
    }
}

/// Glorot/Xavier uniform bound `sqrt(6 / (fan_in + fan_out))`.
pub fn glorot_limit(fan_in: usize, fan_out: usize) -> f32 {
    (6.0 / (fan_in + fan_out).max(1) as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rng_deterministic() {
        let mut rng1 = SimpleRng::new(42);
        let mut rng2 = SimpleRng::new(42);

        for _ in 0..100 {
            assert_eq!(rng1.next_u32(), rng2.next_u32());
        }
    }

    #[test]
    fn test_rng_zero_seed_is_usable() {
        let mut rng = SimpleRng::new(0);
        assert_ne!(rng.next_u32(), 0);
    }

    #[test]
    fn test_rng_next_f32_range() {
        let mut rng = SimpleRng::new(12345);
        for _ in 0..1000 {
            let val = rng.next_f32();
            assert!((0.0..1.0).contains(&val));
        }
    }

    #[test]
    fn test_fill_uniform_bounds() {
        let mut rng = SimpleRng::new(67890);
        let mut values = vec![0.0f32; 1000];
        rng.fill_uniform(&mut values, 0.25);
        assert!(values.iter().all(|v| (-0.25..0.25).contains(v)));
        assert!(values.iter().any(|v| *v < 0.0));
        assert!(values.iter().any(|v| *v > 0.0));
    }

    #[test]
    fn test_glorot_limit() {
        assert!((glorot_limit(3, 3) - 1.0).abs() < 1e-6);
        assert!((glorot_limit(200, 40) - (6.0f32 / 240.0).sqrt()).abs() < 1e-6);
    }
}
