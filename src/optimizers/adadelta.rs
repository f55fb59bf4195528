//! Adadelta optimizer implementation
//!
//! Adadelta adapts the step size per parameter from running averages of
//! squared gradients and squared updates, so the nominal learning rate is
//! usually left at 1.0.
//!
//! ```text
//! a_t  = ρ a_{t-1} + (1 - ρ) g²
//! Δ    = g · sqrt(d_{t-1} + ε) / sqrt(a_t + ε)
//! p   -= lr · Δ
//! d_t  = ρ d_{t-1} + (1 - ρ) Δ²
//! ```
//!
//! Zeiler, M. D. (2012). ADADELTA: An Adaptive Learning Rate Method.
//! arXiv preprint arXiv:1212.5701.

use crate::optimizers::Optimizer;
use std::collections::HashMap;

pub const DEFAULT_LEARNING_RATE: f32 = 1.0;
pub const DEFAULT_RHO: f32 = 0.95;
pub const DEFAULT_EPSILON: f32 = 1e-7;

/// Slot variables of one parameter buffer.
#[derive(Debug, Clone)]
struct Accumulators {
    /// Running average of squared gradients
    grad_sq: Vec<f32>,
    /// Running average of squared updates
    delta_sq: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Adadelta {
    learning_rate: f32,
    rho: f32,
    epsilon: f32,
    slots: HashMap<String, Accumulators>,
}

impl Adadelta {
    pub fn new(learning_rate: f32, rho: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            rho,
            epsilon,
            slots: HashMap::new(),
        }
    }

    pub fn rho(&self) -> f32 {
        self.rho
    }
}

impl Default for Adadelta {
    fn default() -> Self {
        Self::new(DEFAULT_LEARNING_RATE, DEFAULT_RHO, DEFAULT_EPSILON)
    }
}

impl Optimizer for Adadelta {
    fn name(&self) -> &'static str {
        "adadelta"
    }

    fn update(&mut self, key: &str, parameters: &mut [f32], gradients: &[f32]) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "Parameters and gradients must have the same length"
        );

        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Accumulators {
                grad_sq: vec![0.0; parameters.len()],
                delta_sq: vec![0.0; parameters.len()],
            });

        for i in 0..parameters.len() {
            let g = gradients[i];
            slot.grad_sq[i] = self.rho * slot.grad_sq[i] + (1.0 - self.rho) * g * g;
            let delta = g * (slot.delta_sq[i] + self.epsilon).sqrt()
                / (slot.grad_sq[i] + self.epsilon).sqrt();
            parameters[i] -= self.learning_rate * delta;
            slot.delta_sq[i] = self.rho * slot.delta_sq[i] + (1.0 - self.rho) * delta * delta;
        }
    }

    fn reset(&mut self) {
        self.slots.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_adadelta_first_step() {
        let mut optimizer = Adadelta::new(1.0, 0.95, 1e-7);
        let mut params = vec![1.0f32];
        optimizer.update("w", &mut params, &[0.5]);

        // a = 0.05 * 0.25, delta = 0.5 * sqrt(1e-7) / sqrt(a + 1e-7)
        let a = 0.05f32 * 0.25;
        let expected = 1.0 - 0.5 * (1e-7f32).sqrt() / (a + 1e-7).sqrt();
        assert_relative_eq!(params[0], expected, epsilon = 1e-7);
    }

    #[test]
    fn test_adadelta_keeps_state_per_key() {
        let mut optimizer = Adadelta::default();
        let mut a = vec![1.0f32, 1.0];
        let mut b = vec![1.0f32];
        optimizer.update("a", &mut a, &[0.1, 0.1]);
        optimizer.update("b", &mut b, &[0.1]);
        // Same first-step gradient, same first-step update regardless of key
        assert_relative_eq!(a[0], b[0], epsilon = 1e-7);
        assert_eq!(optimizer.slots.len(), 2);

        optimizer.reset();
        assert!(optimizer.slots.is_empty());
    }

    #[test]
    fn test_adadelta_moves_against_gradient() {
        let mut optimizer = Adadelta::default();
        let mut params = vec![0.0f32, 0.0];
        for _ in 0..10 {
            optimizer.update("w", &mut params, &[1.0, -1.0]);
        }
        assert!(params[0] < 0.0);
        assert!(params[1] > 0.0);
    }
}
