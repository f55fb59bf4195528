//! Batch normalization layer implementation
//!
//! This module provides a BatchNormLayer that normalizes each channel of a
//! channels-last feature map over the batch and spatial positions.
//!
//! # Batch Normalization Theory
//!
//! 1. Compute batch statistics per channel: mean μ and variance σ²
//! 2. Normalize: x_norm = (x - μ) / sqrt(σ² + ε)
//! 3. Scale and shift: y = γ * x_norm + β
//!
//! During training the layer uses batch statistics and updates moving
//! statistics with an exponential moving average; during inference it uses
//! the moving statistics.
//!
//! # References
//!
//! Ioffe, S., & Szegedy, C. (2015). Batch Normalization: Accelerating Deep Network Training
//! by Reducing Internal Covariate Shift. ICML.

use crate::error::Result;
use crate::layers::r#trait::{apply_gradients, load_buffer, param_key, LayerState};
use crate::layers::{FeatureShape, Layer};
use crate::optimizers::Optimizer;
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Default epsilon, matching Keras `BatchNormalization`.
pub const DEFAULT_EPSILON: f32 = 1e-3;
/// Default moving-average momentum, matching Keras `BatchNormalization`.
pub const DEFAULT_MOMENTUM: f32 = 0.99;

/// Batch normalization layer with learnable scale and shift parameters.
///
/// Works on any [`FeatureShape`]; statistics are per channel, so a
/// `(h, w, c)` map is normalised over `batch × h × w` values per channel and
/// a vector of length `n` over `batch` values per feature.
///
/// # Example
///
/// ```ignore
/// let mut layer = BatchNormLayer::new("block1_conv1_bn", FeatureShape::map(39, 159, 32), 1e-3, 0.99);
/// assert_eq!(layer.parameter_count(), 64); // 32 gamma + 32 beta
/// layer.set_training(false);
/// ```
pub struct BatchNormLayer {
    name: String,
    shape: FeatureShape,
    epsilon: f32,
    momentum: f32,
    training: bool,

    // Learnable parameters
    gamma: Vec<f32>,
    beta: Vec<f32>,

    // Gradient accumulators (mutable interior via RefCell for trait compatibility)
    grad_gamma: RefCell<Vec<f32>>,
    grad_beta: RefCell<Vec<f32>>,

    // Moving statistics (updated during training forward passes)
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
}

impl BatchNormLayer {
    /// Creates a new batch normalization layer.
    ///
    /// Gamma starts at 1, beta at 0, the moving mean at 0 and the moving
    /// variance at 1. The layer starts in training mode.
    ///
    /// # Panics
    ///
    /// Panics if `epsilon` is not positive or `momentum` is outside `[0, 1]`.
    pub fn new(name: &str, shape: FeatureShape, epsilon: f32, momentum: f32) -> Self {
        assert!(epsilon > 0.0, "epsilon must be positive");
        assert!(
            (0.0..=1.0).contains(&momentum),
            "momentum must be in range [0.0, 1.0]"
        );
        let channels = shape.channels();

        Self {
            name: name.to_string(),
            shape,
            epsilon,
            momentum,
            training: true,
            gamma: vec![1.0f32; channels],
            beta: vec![0.0f32; channels],
            grad_gamma: RefCell::new(vec![0.0f32; channels]),
            grad_beta: RefCell::new(vec![0.0f32; channels]),
            running_mean: RefCell::new(vec![0.0f32; channels]),
            running_var: RefCell::new(vec![1.0f32; channels]),
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn gamma(&self) -> &[f32] {
        &self.gamma
    }

    pub fn beta(&self) -> &[f32] {
        &self.beta
    }

    /// Copy of the moving mean.
    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.borrow().clone()
    }

    /// Copy of the moving variance.
    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.borrow().clone()
    }

    /// Per-channel batch mean and (biased) variance of `input`.
    fn batch_statistics(&self, input: &[f32], batch_size: usize) -> (Vec<f32>, Vec<f32>) {
        let c = self.shape.channels();
        let count = (batch_size * self.shape.spatial()) as f32;
        let mut mean = vec![0.0f32; c];
        let mut var = vec![0.0f32; c];

        for px in input.chunks_exact(c) {
            for (m, &x) in mean.iter_mut().zip(px) {
                *m += x;
            }
        }
        mean.iter_mut().for_each(|m| *m /= count);

        for px in input.chunks_exact(c) {
            for ((v, &m), &x) in var.iter_mut().zip(&mean).zip(px) {
                let diff = x - m;
                *v += diff * diff;
            }
        }
        var.iter_mut().for_each(|v| *v /= count);

        (mean, var)
    }
}

impl Layer for BatchNormLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let total_size = batch_size * self.shape.len();
        assert_eq!(input.len(), total_size, "{}: input len mismatch", self.name);
        assert_eq!(output.len(), total_size, "{}: output len mismatch", self.name);
        let c = self.shape.channels();

        let (mean, var) = if self.training {
            let (mean, var) = self.batch_statistics(input, batch_size);

            // running = momentum * running + (1 - momentum) * batch
            let mut running_mean = self.running_mean.borrow_mut();
            let mut running_var = self.running_var.borrow_mut();
            for j in 0..c {
                running_mean[j] = self.momentum * running_mean[j] + (1.0 - self.momentum) * mean[j];
                running_var[j] = self.momentum * running_var[j] + (1.0 - self.momentum) * var[j];
            }
            (mean, var)
        } else {
            (self.running_mean(), self.running_var())
        };

        let inv_std: Vec<f32> = var.iter().map(|&v| 1.0 / (v + self.epsilon).sqrt()).collect();
        for (px_in, px_out) in input.chunks_exact(c).zip(output.chunks_exact_mut(c)) {
            for j in 0..c {
                let normalized = (px_in[j] - mean[j]) * inv_std[j];
                px_out[j] = self.gamma[j] * normalized + self.beta[j];
            }
        }
    }

    fn backward(
        &self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let total_size = batch_size * self.shape.len();
        assert_eq!(grad_output.len(), total_size, "{}: grad_output len mismatch", self.name);
        assert_eq!(grad_input.len(), total_size, "{}: grad_input len mismatch", self.name);
        let c = self.shape.channels();

        let (mean, var) = if self.training {
            self.batch_statistics(input, batch_size)
        } else {
            (self.running_mean(), self.running_var())
        };
        let inv_std: Vec<f32> = var.iter().map(|&v| 1.0 / (v + self.epsilon).sqrt()).collect();

        let mut grad_gamma = self.grad_gamma.borrow_mut();
        let mut grad_beta = self.grad_beta.borrow_mut();

        // Σ g and Σ g·x̂ per channel
        let mut sum_g = vec![0.0f32; c];
        let mut sum_g_xhat = vec![0.0f32; c];
        for (px_in, g) in input.chunks_exact(c).zip(grad_output.chunks_exact(c)) {
            for j in 0..c {
                let xhat = (px_in[j] - mean[j]) * inv_std[j];
                sum_g[j] += g[j];
                sum_g_xhat[j] += g[j] * xhat;
            }
        }
        for j in 0..c {
            grad_gamma[j] += sum_g_xhat[j];
            grad_beta[j] += sum_g[j];
        }

        if !self.training {
            // Statistics are constants in inference mode
            for (g, gi) in grad_output.chunks_exact(c).zip(grad_input.chunks_exact_mut(c)) {
                for j in 0..c {
                    gi[j] = g[j] * self.gamma[j] * inv_std[j];
                }
            }
            return;
        }

        // dx = γ/(Nσ) · (N·g - Σg - x̂·Σ(g·x̂))
        let count = (batch_size * self.shape.spatial()) as f32;
        for ((px_in, g), gi) in input
            .chunks_exact(c)
            .zip(grad_output.chunks_exact(c))
            .zip(grad_input.chunks_exact_mut(c))
        {
            for j in 0..c {
                let xhat = (px_in[j] - mean[j]) * inv_std[j];
                gi[j] = self.gamma[j] * inv_std[j] / count
                    * (count * g[j] - sum_g[j] - xhat * sum_g_xhat[j]);
            }
        }
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) {
        let key = param_key(&self.name, "gamma");
        apply_gradients(optimizer, &key, &mut self.gamma, &self.grad_gamma);
        let key = param_key(&self.name, "beta");
        apply_gradients(optimizer, &key, &mut self.beta, &self.grad_beta);
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn input_shape(&self) -> FeatureShape {
        self.shape
    }

    fn output_shape(&self) -> FeatureShape {
        self.shape
    }

    fn parameter_count(&self) -> usize {
        2 * self.shape.channels() // gamma + beta
    }

    fn state(&self) -> LayerState {
        vec![
            (param_key(&self.name, "gamma"), self.gamma.clone()),
            (param_key(&self.name, "beta"), self.beta.clone()),
            (param_key(&self.name, "moving_mean"), self.running_mean()),
            (param_key(&self.name, "moving_variance"), self.running_var()),
        ]
    }

    fn load_state(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        load_buffer(state, &param_key(&self.name, "gamma"), &mut self.gamma)?;
        load_buffer(state, &param_key(&self.name, "beta"), &mut self.beta)?;
        load_buffer(
            state,
            &param_key(&self.name, "moving_mean"),
            self.running_mean.get_mut(),
        )?;
        load_buffer(
            state,
            &param_key(&self.name, "moving_variance"),
            self.running_var.get_mut(),
        )
    }
}
