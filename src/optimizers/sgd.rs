//! Stochastic Gradient Descent (SGD) optimizer implementation
//!
//! Plain gradient descent, optionally with classical momentum:
//! `v = μ v - η g; parameter += v`

use crate::optimizers::Optimizer;
use std::collections::HashMap;

/// Stochastic Gradient Descent optimizer.
///
/// With `momentum == 0.0` this is the vanilla update `w = w - η * ∇L/∂w` and
/// no per-parameter state is kept. Otherwise a velocity buffer is stored per
/// parameter key.
///
/// # Example
///
/// ```ignore
/// use multislice_xception::optimizers::{Optimizer, SGD};
///
/// let mut optimizer = SGD::new(0.01);
/// let mut weights = vec![1.0, 2.0, 3.0];
/// optimizer.update("dense/kernel", &mut weights, &[0.1, 0.2, 0.3]);
/// // weights are now: [0.999, 1.998, 2.997]
/// ```
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    velocities: HashMap<String, Vec<f32>>,
}

impl SGD {
    /// Vanilla SGD with the given learning rate.
    ///
    /// # Examples
    ///
    /// ```
    /// use multislice_xception::optimizers::{Optimizer, sgd::SGD};
    ///
    /// let optimizer = SGD::new(0.01);
    /// assert_eq!(optimizer.learning_rate(), 0.01);
    /// ```
    pub fn new(learning_rate: f32) -> Self {
        Self::with_momentum(learning_rate, 0.0)
    }

    pub fn with_momentum(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocities: HashMap::new(),
        }
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl Optimizer for SGD {
    fn name(&self) -> &'static str {
        "sgd"
    }

    /// # Panics
    ///
    /// Panics if `parameters` and `gradients` have different lengths.
    ///
    /// # Examples
    ///
    /// ```
    /// use multislice_xception::optimizers::{Optimizer, sgd::SGD};
    ///
    /// let mut optimizer = SGD::new(0.1);
    /// let mut params = vec![1.0, 2.0, 3.0];
    /// optimizer.update("w", &mut params, &[0.1, 0.2, 0.3]);
    /// assert!((params[0] - 0.99).abs() < 1e-6);
    /// assert!((params[1] - 1.98).abs() < 1e-6);
    /// assert!((params[2] - 2.97).abs() < 1e-6);
    /// ```
    fn update(&mut self, key: &str, parameters: &mut [f32], gradients: &[f32]) {
        assert_eq!(
            parameters.len(),
            gradients.len(),
            "Parameters and gradients must have the same length"
        );

        if self.momentum == 0.0 {
            for (param, grad) in parameters.iter_mut().zip(gradients.iter()) {
                *param -= self.learning_rate * grad;
            }
            return;
        }

        let velocity = self
            .velocities
            .entry(key.to_string())
            .or_insert_with(|| vec![0.0; parameters.len()]);
        for i in 0..parameters.len() {
            velocity[i] = self.momentum * velocity[i] - self.learning_rate * gradients[i];
            parameters[i] += velocity[i];
        }
    }

    fn reset(&mut self) {
        self.velocities.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
