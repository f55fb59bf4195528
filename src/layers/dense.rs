//! Dense (fully connected) layer implementation
//!
//! This module provides a DenseLayer (also known as Linear or Fully Connected layer)
//! that performs the transformation: output = input × weights + biases

use crate::error::Result;
use crate::layers::r#trait::{apply_gradients, load_buffer, param_key, LayerState};
use crate::layers::{FeatureShape, Layer};
use crate::optimizers::Optimizer;
use crate::utils::rng::{glorot_limit, SimpleRng};
use std::cell::RefCell;
use std::collections::BTreeMap;

/// Dense (fully connected) layer with weights and biases.
///
/// Performs `y = xW + b` where `W` is stored row-major as
/// `input_size × output_size`. Feature-map inputs are flattened.
///
/// # Example
///
/// ```ignore
/// let mut rng = SimpleRng::new(42);
/// let layer = DenseLayer::new("predictions0", FeatureShape::Vector(40), 40, &mut rng);
/// assert_eq!(layer.parameter_count(), 40 * 40 + 40);
/// ```
pub struct DenseLayer {
    name: String,
    input: FeatureShape,
    output_size: usize,
    weights: Vec<f32>,
    biases: Vec<f32>,
    grad_weights: RefCell<Vec<f32>>,
    grad_biases: RefCell<Vec<f32>>,
}

impl DenseLayer {
    /// Create a new DenseLayer with Xavier initialization.
    ///
    /// Weights are sampled from `[-limit, limit]` with
    /// `limit = sqrt(6 / (input_size + output_size))`; biases start at zero.
    pub fn new(name: &str, input: FeatureShape, output_size: usize, rng: &mut SimpleRng) -> Self {
        let input_size = input.len();
        let mut weights = vec![0.0f32; input_size * output_size];
        rng.fill_uniform(&mut weights, glorot_limit(input_size, output_size));

        Self {
            name: name.to_string(),
            input,
            output_size,
            grad_weights: RefCell::new(vec![0.0f32; weights.len()]),
            grad_biases: RefCell::new(vec![0.0f32; output_size]),
            weights,
            biases: vec![0.0f32; output_size],
        }
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases
    }

    /// Snapshot of the accumulated weight gradient.
    pub fn weight_gradients(&self) -> Vec<f32> {
        self.grad_weights.borrow().clone()
    }
}

impl Layer for DenseLayer {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let input_size = self.input.len();
        assert_eq!(input.len(), batch_size * input_size, "{}: input len mismatch", self.name);
        assert_eq!(output.len(), batch_size * self.output_size, "{}: output len mismatch", self.name);

        for b in 0..batch_size {
            let x = &input[b * input_size..(b + 1) * input_size];
            let out = &mut output[b * self.output_size..(b + 1) * self.output_size];
            out.copy_from_slice(&self.biases);
            for (i, &xv) in x.iter().enumerate() {
                let row = &self.weights[i * self.output_size..(i + 1) * self.output_size];
                for (o, &wv) in out.iter_mut().zip(row) {
                    *o += xv * wv;
                }
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
        let input_size = self.input.len();
        let mut grad_w = self.grad_weights.borrow_mut();
        let mut grad_b = self.grad_biases.borrow_mut();

        for b in 0..batch_size {
            let x = &input[b * input_size..(b + 1) * input_size];
            let g = &grad_output[b * self.output_size..(b + 1) * self.output_size];
            let gi = &mut grad_input[b * input_size..(b + 1) * input_size];

            for (gb, &gv) in grad_b.iter_mut().zip(g) {
                *gb += gv;
            }
            for i in 0..input_size {
                let row = i * self.output_size;
                let mut acc = 0.0f32;
                for j in 0..self.output_size {
                    grad_w[row + j] += x[i] * g[j];
                    acc += g[j] * self.weights[row + j];
                }
                gi[i] = acc;
            }
        }
    }

    fn update_with_optimizer(&mut self, optimizer: &mut dyn Optimizer) {
        let key = param_key(&self.name, "kernel");
        apply_gradients(optimizer, &key, &mut self.weights, &self.grad_weights);
        let key = param_key(&self.name, "bias");
        apply_gradients(optimizer, &key, &mut self.biases, &self.grad_biases);
    }

    fn input_shape(&self) -> FeatureShape {
        self.input
    }

    fn output_shape(&self) -> FeatureShape {
        FeatureShape::Vector(self.output_size)
    }

    /// Returns input_size × output_size (weights) + output_size (biases).
    fn parameter_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn state(&self) -> LayerState {
        vec![
            (param_key(&self.name, "kernel"), self.weights.clone()),
            (param_key(&self.name, "bias"), self.biases.clone()),
        ]
    }

    fn load_state(&mut self, state: &BTreeMap<String, Vec<f32>>) -> Result<()> {
        load_buffer(state, &param_key(&self.name, "kernel"), &mut self.weights)?;
        load_buffer(state, &param_key(&self.name, "bias"), &mut self.biases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dense_layer_creation() {
        let mut rng = SimpleRng::new(42);
        let layer = DenseLayer::new("d", FeatureShape::Vector(10), 5, &mut rng);

        assert_eq!(layer.input_size(), 10);
        assert_eq!(layer.output_size(), 5);
        assert_eq!(layer.weights.len(), 50); // 10 × 5
        assert_eq!(layer.biases.len(), 5);
    }

    #[test]
    fn test_dense_flattens_feature_maps() {
        let mut rng = SimpleRng::new(42);
        let layer = DenseLayer::new("d", FeatureShape::map(2, 2, 3), 4, &mut rng);
        assert_eq!(layer.input_size(), 12);
        assert_eq!(layer.parameter_count(), 12 * 4 + 4);
    }

    #[test]
    fn test_xavier_initialization() {
        let mut rng = SimpleRng::new(42);
        let layer = DenseLayer::new("d", FeatureShape::Vector(100), 50, &mut rng);
        let limit = (6.0f32 / 150.0).sqrt();

        for &weight in &layer.weights {
            assert!(weight >= -limit && weight <= limit);
        }
        for &bias in &layer.biases {
            assert_eq!(bias, 0.0);
        }
    }

    #[test]
    fn test_forward_known_values() {
        let mut rng = SimpleRng::new(1);
        let mut layer = DenseLayer::new("d", FeatureShape::Vector(2), 2, &mut rng);
        layer.weights = vec![1.0, 2.0, 3.0, 4.0];
        layer.biases = vec![0.5, -0.5];

        let mut output = vec![0.0; 2];
        layer.forward(&[1.0, 1.0], &mut output, 1);
        assert_eq!(output, vec![4.5, 5.5]);
    }
}
